//! External seams of the wake scheduler: the wake facility and the clock.
//!
//! The scheduler never sleeps on its own. It asks a [`WakeFacility`] to arm a
//! single alarm for its earliest entry and is called back when that alarm
//! goes off. On a device this is the power-aware system alarm; in-process,
//! [`TokioWakeFacility`] stands in for it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::core::ActionId;

/// The one alarm the scheduler keeps armed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alarm {
    pub action: ActionId,
    pub tag: String,
    /// Absolute fire time, milliseconds since the Unix epoch.
    pub fire_at_ms: i64,
}

impl Alarm {
    /// Fire time as a UTC timestamp, for logging.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.fire_at_ms)
    }
}

/// Invoked by the facility when an armed alarm goes off.
pub type AlarmCallback = Box<dyn FnOnce(Alarm) + Send>;

/// A timer facility that holds at most one alarm.
///
/// Implementations must not call `on_fire` from inside `arm`; the scheduler
/// holds its lock while arming.
pub trait WakeFacility: Send + Sync + 'static {
    /// Arm `alarm`, replacing any alarm that is still outstanding.
    fn arm(&self, alarm: Alarm, on_fire: AlarmCallback);

    /// Cancel the outstanding alarm, if any.
    fn disarm(&self);
}

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Wake facility backed by a tokio timer task.
///
/// Only wakes while the process is alive; pending entries survive restarts
/// through the scheduler's persistence, not through this facility.
pub struct TokioWakeFacility {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    armed: Mutex<Option<AbortHandle>>,
}

impl TokioWakeFacility {
    pub fn new(runtime: Handle, clock: Arc<dyn Clock>) -> Self {
        Self {
            runtime,
            clock,
            armed: Mutex::new(None),
        }
    }

    /// Use the current runtime and the system clock.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current(), Arc::new(SystemClock))
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.armed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WakeFacility for TokioWakeFacility {
    fn arm(&self, alarm: Alarm, on_fire: AlarmCallback) {
        let wait_ms = alarm.fire_at_ms.saturating_sub(self.clock.now_ms()).max(0);
        let delay = Duration::from_millis(wait_ms as u64);
        trace!(action = %alarm.action, ?delay, "arming alarm");

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(alarm);
        });

        if let Some(previous) = self.slot().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    fn disarm(&self) {
        if let Some(previous) = self.slot().take() {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for TokioWakeFacility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioWakeFacility")
            .field("armed", &self.slot().is_some())
            .finish()
    }
}
