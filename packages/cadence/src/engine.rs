//! Cadence Engine - event joins, queues and runs behind one handle.
//!
//! ```text
//! event(name) → JoinRegistry → JoinFire → Dispatcher → handler (bg | ui)
//!                                              ↑
//!                  run / run_delayed / run_repeating
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cadence::{handler, ActionId, EngineBuilder, Queue};
//!
//! let (handle, mut ui) = EngineBuilder::new(handler(|action, success, _, _| {
//!     println!("action {} fired, success={}", action, success);
//! }))
//! .build()
//! .start()?;
//!
//! handle.register_permanent(ActionId(1), ["tap_down", "tap_up"], Queue::Ui)?;
//! handle.signal("tap_down", true);
//! handle.signal("tap_up", true);
//!
//! // From the host's frame loop:
//! ui.run_pending();
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::core::{ActionHandler, ActionId, EventSnapshot, Payload, Queue};
use crate::dispatch::{Dispatch, DispatchFlags, Dispatcher, UiQueue};
use crate::error::EngineError;
use crate::join::{JoinKind, JoinRegistry, RunType};
use crate::pool::EventPool;

// =============================================================================
// Engine
// =============================================================================

/// A configured, not yet started engine.
///
/// Use [`EngineBuilder`] to construct one.
pub struct Engine {
    handler: ActionHandler,
    config: EngineConfig,
    pool: Arc<EventPool>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder(handler: ActionHandler) -> EngineBuilder {
        EngineBuilder::new(handler)
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the background worker and return the handle plus the UI queue
    /// for the host to drain.
    ///
    /// Must be called from within a tokio runtime, which drives delayed and
    /// repeating runs.
    pub fn start(self) -> Result<(EngineHandle, UiQueue), EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        self.start_on(runtime)
    }

    /// Like [`start`](Self::start) with an explicit runtime handle, for hosts
    /// that start the engine outside the runtime.
    pub fn start_on(self, runtime: Handle) -> Result<(EngineHandle, UiQueue), EngineError> {
        info!(
            worker = %self.config.worker_name,
            pool_capacity = self.pool.capacity(),
            "starting cadence engine"
        );

        let (dispatcher, ui_queue) =
            Dispatcher::start(self.handler, runtime, &self.config.worker_name)?;

        let handle = EngineHandle {
            inner: Arc::new(EngineInner {
                dispatcher,
                registry: Mutex::new(JoinRegistry::new(self.pool.clone())),
                pool: self.pool,
                stopped: AtomicBool::new(false),
            }),
        };
        Ok((handle, ui_queue))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

struct EngineInner {
    dispatcher: Dispatcher,
    registry: Mutex<JoinRegistry>,
    pool: Arc<EventPool>,
    stopped: AtomicBool,
}

/// Handle to a running engine.
///
/// Cheap to clone and safe to use from any thread, including from inside
/// action handlers.
///
/// # Joins vs runs
///
/// - `register_*` + `event()`: the action fires when its events complete.
/// - `run*`: the action is dispatched directly, now, later, or repeatedly.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    fn registry(&self) -> MutexGuard<'_, JoinRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_stopped() {
            Err(EngineError::EngineStopped)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Report that `name` happened.
    ///
    /// Returns immediately; any action whose aggregate status changed is
    /// queued for its handler. Ignored while paused or after stop.
    pub fn event(
        &self,
        name: &str,
        success: bool,
        extra: i32,
        payload: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        if self.is_stopped() || self.is_paused() {
            trace!(event = name, "engine not accepting events");
            return;
        }

        // Posted under the registry lock: one action's fires keep registry order.
        let mut registry = self.registry();
        for fire in registry.on_event(name, success, extra, payload) {
            debug!(action = %fire.action, success = fire.success, queue = %fire.queue, "join fired");
            let msg = Dispatch::new(
                fire.action,
                DispatchFlags::new(fire.queue, fire.success, fire.extra),
                Payload::Events(fire.events),
            )
            .with_handler(fire.handler);
            self.inner.dispatcher.post(msg);
        }
    }

    /// [`event`](Self::event) without extra data.
    pub fn signal(&self, name: &str, success: bool) {
        self.event(name, success, 0, None);
    }

    // -------------------------------------------------------------------------
    // Join registration
    // -------------------------------------------------------------------------

    fn register<I>(
        &self,
        id: ActionId,
        names: I,
        queue: Queue,
        kind: JoinKind,
        handler: Option<ActionHandler>,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.ensure_running()?;
        self.registry().register(id, names, queue, kind, handler)
    }

    /// Fire `id` on `queue` whenever the aggregate status of `names` changes.
    pub fn register_permanent<I>(&self, id: ActionId, names: I, queue: Queue) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Permanent, None)
    }

    pub fn register_permanent_with<I>(
        &self,
        id: ActionId,
        names: I,
        queue: Queue,
        handler: ActionHandler,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Permanent, Some(handler))
    }

    /// Fire `id` once when `names` complete, then forget it. Replaces any
    /// other pending once action.
    pub fn register_once<I>(&self, id: ActionId, names: I, queue: Queue) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Once, None)
    }

    pub fn register_once_with<I>(
        &self,
        id: ActionId,
        names: I,
        queue: Queue,
        handler: ActionHandler,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Once, Some(handler))
    }

    /// Like [`register_permanent`](Self::register_permanent), but `names` must
    /// be observed in order.
    pub fn register_sequence<I>(&self, id: ActionId, names: I, queue: Queue) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Sequence, None)
    }

    pub fn register_sequence_with<I>(
        &self,
        id: ActionId,
        names: I,
        queue: Queue,
        handler: ActionHandler,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.register(id, names, queue, JoinKind::Sequence, Some(handler))
    }

    /// Remove a join action. Returns whether it was registered.
    pub fn cancel_action(&self, id: ActionId) -> bool {
        let removed = self.registry().remove(id);
        if removed {
            debug!(action = %id, "action cancelled");
        }
        removed
    }

    /// Choose when a join action fires. Actions start with
    /// [`RunType::ResultChange`].
    pub fn set_run_type(&self, id: ActionId, run_type: RunType) -> Result<(), EngineError> {
        self.registry().set_run_type(id, run_type)
    }

    /// Put every event of a join action back to waiting.
    pub fn reset_action(&self, id: ActionId) -> Result<(), EngineError> {
        self.registry().reset(id)
    }

    /// First event of the action that has not succeeded yet.
    pub fn waiting_event(&self, id: ActionId) -> Option<String> {
        self.registry()
            .get(id)
            .and_then(|action| action.waiting_event().map(str::to_string))
    }

    /// Current state of the action's events, in registration order.
    pub fn action_events(&self, id: ActionId) -> Option<Vec<EventSnapshot>> {
        self.registry().get(id).map(|action| action.snapshot())
    }

    pub fn action_count(&self) -> usize {
        self.registry().len()
    }

    // -------------------------------------------------------------------------
    // Direct runs
    // -------------------------------------------------------------------------

    fn dispatch(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        payload: Payload,
        queue: Queue,
        handler: Option<ActionHandler>,
    ) -> Dispatch {
        Dispatch::new(id, DispatchFlags::new(queue, success, extra), payload).with_handler(handler)
    }

    /// Dispatch `id` now.
    pub fn run(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        payload: Payload,
        queue: Queue,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner
            .dispatcher
            .post(self.dispatch(id, success, extra, payload, queue, None));
        Ok(())
    }

    pub fn run_with(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        payload: Payload,
        queue: Queue,
        handler: ActionHandler,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner
            .dispatcher
            .post(self.dispatch(id, success, extra, payload, queue, Some(handler)));
        Ok(())
    }

    /// Dispatch `id` after `delay`. A second call before the first delivers
    /// replaces it, so only the last call within the window runs.
    pub fn run_delayed(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        payload: Payload,
        queue: Queue,
        delay: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner
            .dispatcher
            .post_delayed(self.dispatch(id, success, extra, payload, queue, None), delay);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run_delayed_with(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        payload: Payload,
        queue: Queue,
        delay: Duration,
        handler: ActionHandler,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner.dispatcher.post_delayed(
            self.dispatch(id, success, extra, payload, queue, Some(handler)),
            delay,
        );
        Ok(())
    }

    /// Dispatch `id` now and then every `interval` until
    /// [`cancel_run`](Self::cancel_run).
    pub fn run_repeating(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        queue: Queue,
        interval: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner.dispatcher.post_repeating(
            id,
            DispatchFlags::new(queue, success, extra),
            interval,
            None,
        );
        Ok(())
    }

    pub fn run_repeating_with(
        &self,
        id: ActionId,
        success: bool,
        extra: i32,
        queue: Queue,
        interval: Duration,
        handler: ActionHandler,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.inner.dispatcher.post_repeating(
            id,
            DispatchFlags::new(queue, success, extra),
            interval,
            Some(handler),
        );
        Ok(())
    }

    /// Drop every pending, delayed or repeating run of `id` on both queues.
    pub fn cancel_run(&self, id: ActionId) {
        self.inner.dispatcher.cancel(id);
    }

    /// Handler that dispatches whatever it receives onto `queue` of this
    /// engine. Hand it to a [`WakeScheduler`](crate::WakeScheduler) so wake
    /// fires run on the engine's queues.
    pub fn queue_handler(&self, queue: Queue) -> ActionHandler {
        let dispatcher = self.inner.dispatcher.clone();
        Arc::new(move |action, success, extra, payload| {
            dispatcher.post(Dispatch::new(
                action,
                DispatchFlags::new(queue, success, extra),
                payload,
            ));
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Ignore events and new runs until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.dispatcher.pause();
        info!("engine paused");
    }

    pub fn resume(&self) {
        self.inner.dispatcher.resume();
        info!("engine resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.dispatcher.is_paused()
    }

    /// Cancel everything, drop every join action, and empty the pool.
    ///
    /// Safe to call more than once and from any thread, including from a
    /// handler.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatcher.stop();
        self.registry().clear();
        self.inner.pool.release();
        info!("engine stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.inner.pool
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("dispatcher", &self.inner.dispatcher)
            .field("actions", &self.action_count())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for an [`Engine`].
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new(on_action)
///     .with_config(EngineConfig::from_env()?)
///     .with_pool(shared_pool)   // Optional: share records between engines
///     .build();
/// ```
pub struct EngineBuilder {
    handler: ActionHandler,
    config: EngineConfig,
    pool: Option<Arc<EventPool>>,
}

impl EngineBuilder {
    /// `handler` receives every action that has no handler of its own.
    pub fn new(handler: ActionHandler) -> Self {
        Self {
            handler,
            config: EngineConfig::default(),
            pool: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing pool instead of creating one from the config.
    pub fn with_pool(mut self, pool: Arc<EventPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn build(self) -> Engine {
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(EventPool::new(self.config.pool_capacity)));
        Engine {
            handler: self.handler,
            config: self.config,
            pool,
        }
    }
}
