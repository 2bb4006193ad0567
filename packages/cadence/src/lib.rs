//! # Cadence
//!
//! An event-to-action dispatch and timing engine. Producers report named
//! events; actions fire when the events they wait for have all been seen, on
//! either a background worker or the host's UI context.
//!
//! ## Core Concepts
//!
//! - **Events** are free-form names reported with a success flag, an `i32`
//!   and an optional payload: `handle.event("tap_up", true, 0, None)`.
//! - **Actions** are integer ids bound to a handler
//!   `Fn(ActionId, bool, i32, Payload)`.
//! - A **join** ties an action to a list of events. It fires once all of them
//!   have been observed, with `success` true only if none failed, and fires
//!   again only when that outcome changes.
//! - **Runs** dispatch an action directly: now, after a debounced delay, or
//!   repeatedly.
//! - The **wake scheduler** keeps long-horizon timed actions across restarts
//!   and keeps a single system alarm armed for the earliest one.
//!
//! ## Architecture
//!
//! ```text
//! producers ──► EngineHandle::event()
//!                   │
//!                   ▼
//!             JoinRegistry ◄── EventPool (records)
//!                   │ aggregate changed
//!                   ▼
//!   run*() ──► Dispatcher ──┬──► background worker thread ──► handler
//!                           │
//!                           └──► UiQueue (host drains) ─────► handler
//!
//! WakeFacility ──fire──► WakeScheduler ──► handler / queue_handler(queue)
//!        ▲                    │
//!        └──── arm earliest ──┘──► KeyValueStore (persisted list)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One consumer per queue** - handlers on the same queue never overlap
//! 2. **Fire on change** - a join never fires twice with the same outcome
//! 3. **One armed alarm** - the wake facility only ever holds the earliest entry
//! 4. **Locks are never held across handlers** - handlers may call back in
//!
//! ## Example
//!
//! ```ignore
//! use cadence::{handler, ActionId, EngineBuilder, Queue};
//!
//! let (handle, mut ui) = EngineBuilder::new(handler(|action, success, _, _| {
//!     println!("{} -> {}", action, success);
//! }))
//! .build()
//! .start()?;
//!
//! handle.register_permanent(ActionId(1), ["tap_down", "tap_up"], Queue::Ui)?;
//! handle.signal("tap_down", true);
//! handle.signal("tap_up", true);
//! ui.run_pending(); // prints "1 -> true"
//! ```

// Core modules
mod alarm;
mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod join;
mod pool;
mod store;
mod wake;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{handler, ActionHandler, ActionId, EventSnapshot, EventStatus, Payload, Queue};

// Re-export error types
pub use crate::error::{EngineError, PersistError};

// Re-export configuration
pub use crate::config::{EngineConfig, WakeConfig, DEFAULT_GUARD_WINDOW_MS};

// Re-export pool and join types
pub use crate::join::{JoinAction, JoinFire, JoinKind, JoinRegistry, RunType};
pub use crate::pool::{EventPool, EventRecord, DEFAULT_POOL_CAPACITY};

// Re-export dispatcher types
pub use crate::dispatch::{Dispatch, DispatchFlags, Dispatcher, UiQueue, MIN_REPEAT_INTERVAL};

// Re-export engine types (primary entry point)
pub use crate::engine::{Engine, EngineBuilder, EngineHandle};

// Re-export wake scheduler types
pub use crate::alarm::{Alarm, AlarmCallback, Clock, SystemClock, TokioWakeFacility, WakeFacility};
pub use crate::store::{FileStore, KeyValueStore, TimerFields};
pub use crate::wake::{ScheduledEntry, WakeScheduler, WakeSchedulerBuilder};
