//! Dual-queue dispatcher.
//!
//! The `Dispatcher` owns two serialized queues:
//!
//! - **Background**: drained by one dedicated worker thread per engine
//! - **UI**: drained by the host through a [`UiQueue`], either from a frame
//!   loop (`run_pending`) or from an async main task (`run`)
//!
//! Each queue has exactly one consumer, so handlers on the same queue never
//! overlap. A handler blocked on one queue never holds up the other.
//!
//! # Cancellation
//!
//! Every queue keeps a per-action epoch. Messages are stamped with the epoch
//! current when they were posted and are dropped at delivery if the epoch has
//! moved on. Cancelling an action (or posting a delayed message for it) bumps
//! the epoch, which invalidates anything already sitting in the channel, and
//! aborts the sleeping timer task if there is one.
//!
//! # Repeating messages
//!
//! A repeating message re-arms itself *before* its handler runs, so a slow or
//! panicking handler does not stretch or break the cadence.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace};

use crate::core::{ActionHandler, ActionId, Payload, Queue};
use crate::error::EngineError;

/// Shortest cadence a repeating message can run at.
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// Messages
// =============================================================================

/// Routing and result flags carried by every dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchFlags {
    /// Re-arm after every delivery.
    pub repeat: bool,
    pub success: bool,
    pub queue: Queue,
    pub extra: i32,
}

impl DispatchFlags {
    pub fn new(queue: Queue, success: bool, extra: i32) -> Self {
        Self {
            repeat: false,
            success,
            queue,
            extra,
        }
    }
}

/// One scheduled delivery.
#[derive(Clone)]
pub struct Dispatch {
    pub action: ActionId,
    pub flags: DispatchFlags,
    pub payload: Payload,
    /// Set for repeating messages.
    pub interval: Option<Duration>,
    /// Overrides the engine handler for this delivery.
    pub handler: Option<ActionHandler>,
    epoch: u64,
}

impl Dispatch {
    pub fn new(action: ActionId, flags: DispatchFlags, payload: Payload) -> Self {
        Self {
            action,
            flags,
            payload,
            interval: None,
            handler: None,
            epoch: 0,
        }
    }

    pub fn with_handler(mut self, handler: Option<ActionHandler>) -> Self {
        self.handler = handler;
        self
    }

    fn repeating(action: ActionId, flags: DispatchFlags, interval: Duration) -> Self {
        Self {
            action,
            flags: DispatchFlags {
                repeat: true,
                ..flags
            },
            payload: Payload::None,
            interval: Some(interval),
            handler: None,
            epoch: 0,
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("action", &self.action)
            .field("flags", &self.flags)
            .field("payload", &self.payload)
            .field("interval", &self.interval)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

enum LaneMessage {
    Deliver(Dispatch),
    Shutdown,
}

// =============================================================================
// Lanes
// =============================================================================

/// Sending side and cancellation state of one queue.
struct Lane {
    queue: Queue,
    tx: mpsc::UnboundedSender<LaneMessage>,
    epochs: DashMap<ActionId, u64>,
    timers: DashMap<ActionId, (u64, AbortHandle)>,
}

impl Lane {
    fn new(queue: Queue) -> (Self, mpsc::UnboundedReceiver<LaneMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lane = Self {
            queue,
            tx,
            epochs: DashMap::new(),
            timers: DashMap::new(),
        };
        (lane, rx)
    }

    fn epoch(&self, action: ActionId) -> u64 {
        self.epochs.get(&action).map(|e| *e).unwrap_or(0)
    }

    /// Drop every pending message for `action` and return the new epoch.
    fn invalidate(&self, action: ActionId) -> u64 {
        if let Some((_, (_, timer))) = self.timers.remove(&action) {
            timer.abort();
        }
        let mut epoch = self.epochs.entry(action).or_insert(0);
        *epoch += 1;
        *epoch
    }

    fn send(&self, msg: Dispatch) -> bool {
        self.tx.send(LaneMessage::Deliver(msg)).is_ok()
    }

    fn shutdown(&self) {
        for entry in self.timers.iter() {
            entry.value().1.abort();
        }
        self.timers.clear();
        let _ = self.tx.send(LaneMessage::Shutdown);
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Shared {
    background: Lane,
    ui: Lane,
    handler: ActionHandler,
    runtime: Handle,
    stopped: AtomicBool,
    paused: AtomicBool,
}

impl Shared {
    fn lane(&self, queue: Queue) -> &Lane {
        match queue {
            Queue::Background => &self.background,
            Queue::Ui => &self.ui,
        }
    }

    fn accepting(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.paused.load(Ordering::Acquire)
    }

    fn post(&self, mut msg: Dispatch) -> bool {
        let lane = self.lane(msg.flags.queue);
        msg.epoch = lane.epoch(msg.action);
        lane.send(msg)
    }

    /// Replace any pending message for the action with `msg` after `delay`.
    fn post_after(&self, mut msg: Dispatch, delay: Duration) {
        let lane = self.lane(msg.flags.queue);
        msg.epoch = lane.invalidate(msg.action);
        self.arm(lane, msg, delay);
    }

    /// Re-arm a repeating message under its current epoch. A cancel that
    /// lands while the handler is running wins.
    fn rearm(&self, msg: Dispatch, interval: Duration) {
        let lane = self.lane(msg.flags.queue);
        if lane.epoch(msg.action) != msg.epoch {
            return;
        }
        self.arm(lane, msg, interval);
    }

    fn arm(&self, lane: &Lane, msg: Dispatch, delay: Duration) {
        let (action, epoch) = (msg.action, msg.epoch);
        let tx = lane.tx.clone();
        // Hold the entry until the timer is recorded, so a delivery racing
        // the spawn cannot clear it first.
        let slot = lane.timers.entry(action);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LaneMessage::Deliver(msg));
        });
        slot.insert((epoch, task.abort_handle()));
    }

    fn deliver(&self, msg: Dispatch) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let lane = self.lane(msg.flags.queue);
        lane.timers.remove_if(&msg.action, |_, (epoch, _)| *epoch == msg.epoch);
        if msg.epoch != lane.epoch(msg.action) {
            trace!(action = %msg.action, queue = %lane.queue, "dropping cancelled message");
            return;
        }

        if let Some(interval) = msg.interval.filter(|_| msg.flags.repeat) {
            self.rearm(msg.clone(), interval);
        }

        let handler = msg.handler.clone().unwrap_or_else(|| self.handler.clone());
        let (action, success, extra) = (msg.action, msg.flags.success, msg.flags.extra);
        let result = catch_unwind(AssertUnwindSafe(|| {
            handler(action, success, extra, msg.payload);
        }));

        if let Err(panic_info) = result {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(
                action = %action,
                queue = %lane.queue,
                panic = %panic_msg,
                "action handler panicked"
            );
        }
    }

    /// Returns true when the consumer should exit.
    fn handle(&self, msg: LaneMessage) -> bool {
        match msg {
            LaneMessage::Deliver(dispatch) => {
                self.deliver(dispatch);
                false
            }
            LaneMessage::Shutdown => true,
        }
    }
}

/// Routes actions onto the background and UI queues.
///
/// Cloning is cheap; all clones feed the same queues.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Create the dispatcher, spawn its background worker thread, and return
    /// the UI queue for the host to drain.
    ///
    /// `runtime` drives delayed and repeating timers.
    pub fn start(
        handler: ActionHandler,
        runtime: Handle,
        worker_name: &str,
    ) -> Result<(Self, UiQueue), EngineError> {
        let (background, mut background_rx) = Lane::new(Queue::Background);
        let (ui, ui_rx) = Lane::new(Queue::Ui);

        let shared = Arc::new(Shared {
            background,
            ui,
            handler,
            runtime,
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        });

        let worker = shared.clone();
        std::thread::Builder::new()
            .name(worker_name.to_string())
            .spawn(move || {
                debug!("background worker started");
                while let Some(msg) = background_rx.blocking_recv() {
                    if worker.handle(msg) {
                        break;
                    }
                }
                debug!("background worker stopped");
            })
            .map_err(EngineError::WorkerSpawn)?;

        info!(worker = worker_name, "dispatcher started");

        let ui_queue = UiQueue {
            shared: shared.clone(),
            rx: ui_rx,
            closed: false,
        };
        Ok((Self { shared }, ui_queue))
    }

    /// Enqueue an immediate delivery.
    ///
    /// Returns false if the dispatcher is paused or stopped.
    pub fn post(&self, msg: Dispatch) -> bool {
        if !self.shared.accepting() {
            return false;
        }
        self.shared.post(msg)
    }

    /// Deliver after `delay`, replacing any pending message for the same
    /// action on the same queue.
    pub fn post_delayed(&self, msg: Dispatch, delay: Duration) -> bool {
        if !self.shared.accepting() {
            return false;
        }
        debug!(action = %msg.action, queue = %msg.flags.queue, ?delay, "delayed run scheduled");
        self.shared.post_after(msg, delay);
        true
    }

    /// Deliver now and then every `interval` until cancelled. Intervals
    /// shorter than [`MIN_REPEAT_INTERVAL`] are raised to it.
    pub fn post_repeating(
        &self,
        action: ActionId,
        flags: DispatchFlags,
        interval: Duration,
        handler: Option<ActionHandler>,
    ) -> bool {
        if !self.shared.accepting() {
            return false;
        }
        let interval = interval.max(MIN_REPEAT_INTERVAL);
        debug!(action = %action, queue = %flags.queue, ?interval, "repeating run scheduled");
        let msg = Dispatch::repeating(action, flags, interval).with_handler(handler);
        let lane = self.shared.lane(flags.queue);
        lane.invalidate(action);
        self.shared.post(msg)
    }

    /// Remove pending delayed, repeating and queued messages for `action`
    /// from both queues. A handler already running is not interrupted.
    pub fn cancel(&self, action: ActionId) {
        self.shared.background.invalidate(action);
        self.shared.ui.invalidate(action);
        debug!(action = %action, "run cancelled");
    }

    /// Ignore new posts until [`resume`](Self::resume). Already scheduled
    /// messages, including repeats, keep running.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Cancel everything and shut both consumers down. Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.background.shutdown();
        self.shared.ui.shutdown();
        info!("dispatcher stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Number of delayed or repeating timers currently sleeping.
    pub fn pending_timers(&self) -> usize {
        self.shared.background.timers.len() + self.shared.ui.timers.len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stopped", &self.is_stopped())
            .field("paused", &self.is_paused())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

// =============================================================================
// UI Queue
// =============================================================================

/// Consumer side of the UI queue.
///
/// Drive it from the host's main context. Only one `UiQueue` exists per
/// engine, so UI handlers never run concurrently with each other.
pub struct UiQueue {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<LaneMessage>,
    closed: bool,
}

impl UiQueue {
    /// Deliver everything currently queued without waiting.
    ///
    /// Returns the number of messages taken off the queue, including
    /// cancelled ones that were dropped.
    pub fn run_pending(&mut self) -> usize {
        let mut taken = 0;
        while !self.closed {
            match self.rx.try_recv() {
                Ok(msg) => {
                    taken += 1;
                    if self.shared.handle(msg) {
                        self.closed = true;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.closed = true,
            }
        }
        taken
    }

    /// Deliver messages until the engine stops.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if self.shared.handle(msg) {
                break;
            }
        }
        self.closed = true;
        debug!("ui queue stopped");
    }

    /// True once the engine has stopped and the queue will deliver nothing
    /// more.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for UiQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiQueue")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
