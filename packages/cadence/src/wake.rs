//! Wake scheduler: many pending timed actions, one armed alarm.
//!
//! Entries are kept sorted by absolute fire time. Only the earliest is armed
//! on the [`WakeFacility`]; when it fires the scheduler runs it, re-inserts
//! it if it repeats, and re-arms for whatever is now first. Entries that are
//! already due (within the guard window) are run in the same callback, since
//! system wake alarms have a coarse resolution and back-to-back entries would
//! otherwise be late.
//!
//! The list is written to a [`KeyValueStore`] after every change and read
//! back when the scheduler is opened, so pending entries survive restarts.
//!
//! ```ignore
//! let wake = WakeScheduler::builder(handle.queue_handler(Queue::Background))
//!     .config(WakeConfig::from_env()?)
//!     .open()?;
//!
//! wake.schedule_repeating(ActionId(7), Duration::from_secs(3600), "hourly-sync")?;
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::alarm::{Alarm, Clock, SystemClock, TokioWakeFacility, WakeFacility};
use crate::config::WakeConfig;
use crate::core::{ActionHandler, ActionId, Payload};
use crate::error::EngineError;
use crate::store::{FileStore, KeyValueStore, TimerFields};

/// One pending wake entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub action: ActionId,
    pub tag: String,
    /// Absolute fire time, milliseconds since the Unix epoch.
    pub fire_at_ms: i64,
    /// Zero for one-shot entries.
    pub repeat_ms: i64,
}

impl ScheduledEntry {
    pub fn is_repeating(&self) -> bool {
        self.repeat_ms > 0
    }

    fn key(&self) -> (ActionId, i64) {
        (self.action, self.fire_at_ms)
    }

    fn alarm(&self) -> Alarm {
        Alarm {
            action: self.action,
            tag: self.tag.clone(),
            fire_at_ms: self.fire_at_ms,
        }
    }
}

/// Insert after every entry due at or before `entry`.
fn insert_sorted(entries: &mut Vec<ScheduledEntry>, entry: ScheduledEntry) {
    let index = entries
        .iter()
        .position(|e| e.fire_at_ms > entry.fire_at_ms)
        .unwrap_or(entries.len());
    entries.insert(index, entry);
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Default)]
struct WakeState {
    entries: Vec<ScheduledEntry>,
    /// `(action, fire_at)` of the entry the facility is armed for.
    armed: Option<(ActionId, i64)>,
    stopped: bool,
}

struct WakeShared {
    state: Mutex<WakeState>,
    facility: Arc<dyn WakeFacility>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    handler: ActionHandler,
    config: WakeConfig,
}

impl WakeShared {
    fn lock(&self) -> MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &[ScheduledEntry]) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = TimerFields::encode(entries).save(store.as_ref(), &self.config.namespace) {
            warn!(
                namespace = %self.config.namespace,
                error = %format!("{:#}", e),
                "failed to persist wake list"
            );
        }
    }

    /// Make the facility's alarm match the head of the list.
    fn sync_alarm(this: &Arc<Self>, state: &mut WakeState) {
        let Some(head) = state.entries.first() else {
            if state.armed.take().is_some() {
                this.facility.disarm();
            }
            return;
        };

        if state.armed == Some(head.key()) {
            return;
        }
        state.armed = Some(head.key());

        let alarm = head.alarm();
        debug!(action = %alarm.action, fire_at = ?alarm.fire_at(), "arming wake alarm");
        let weak = Arc::downgrade(this);
        this.facility.arm(
            alarm,
            Box::new(move |alarm| {
                if let Some(shared) = weak.upgrade() {
                    Self::on_alarm(&shared, alarm);
                }
            }),
        );
    }

    fn on_alarm(this: &Arc<Self>, alarm: Alarm) {
        let mut state = this.lock();
        if state.stopped {
            return;
        }
        let key = (alarm.action, alarm.fire_at_ms);
        if state.armed == Some(key) {
            state.armed = None;
        }

        let guard = this.config.guard_window_i64();
        let mut fired: SmallVec<[ActionId; 4]> = SmallVec::new();
        let mut target = Some(key);

        while let Some((action, fire_at)) = target.take() {
            let Some(index) = state
                .entries
                .iter()
                .position(|e| e.action == action && e.fire_at_ms == fire_at)
            else {
                debug!(action = %action, "dropping stale wake alarm");
                break;
            };

            let entry = state.entries.remove(index);
            if entry.is_repeating() {
                let next = ScheduledEntry {
                    fire_at_ms: this.clock.now_ms().saturating_add(entry.repeat_ms),
                    ..entry.clone()
                };
                insert_sorted(&mut state.entries, next);
            }
            this.persist(&state.entries);
            fired.push(action);
            drop(state);

            this.invoke(entry);

            state = this.lock();
            if state.stopped {
                return;
            }
            let due_by = this.clock.now_ms().saturating_add(guard);
            target = state
                .entries
                .first()
                .filter(|head| head.fire_at_ms < due_by && !fired.contains(&head.action))
                .map(ScheduledEntry::key);
        }

        Self::sync_alarm(this, &mut state);
    }

    fn invoke(&self, entry: ScheduledEntry) {
        debug!(action = %entry.action, tag = %entry.tag, "wake entry fired");
        let action = entry.action;
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.handler)(action, true, 0, Payload::Tag(entry.tag));
        }));

        if let Err(panic_info) = result {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(action = %action, panic = %panic_msg, "wake handler panicked");
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and opens a [`WakeScheduler`].
pub struct WakeSchedulerBuilder {
    handler: ActionHandler,
    facility: Option<Arc<dyn WakeFacility>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: WakeConfig,
    discard_corrupt: bool,
}

impl WakeSchedulerBuilder {
    pub fn facility(mut self, facility: Arc<dyn WakeFacility>) -> Self {
        self.facility = Some(facility);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: WakeConfig) -> Self {
        self.config = config;
        self
    }

    /// Start empty instead of failing when the persisted list is unreadable.
    pub fn discard_corrupt_state(mut self, discard: bool) -> Self {
        self.discard_corrupt = discard;
        self
    }

    /// Load persisted entries and arm the earliest.
    ///
    /// Without an explicit facility this needs a tokio runtime. Without an
    /// explicit store, `config.store_path` is used if set, otherwise the list
    /// lives in memory only.
    pub fn open(self) -> Result<WakeScheduler, EngineError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let facility: Arc<dyn WakeFacility> = match self.facility {
            Some(facility) => facility,
            None => {
                let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
                Arc::new(TokioWakeFacility::new(runtime, clock.clone()))
            }
        };
        let store: Option<Arc<dyn KeyValueStore>> = match self.store {
            Some(store) => Some(store),
            None => self
                .config
                .store_path
                .clone()
                .map(|path| Arc::new(FileStore::new(path)) as Arc<dyn KeyValueStore>),
        };

        let entries = match &store {
            Some(store) => load_entries(store.as_ref(), &self.config.namespace, self.discard_corrupt)?,
            None => Vec::new(),
        };
        let pending = entries.len();

        let shared = Arc::new(WakeShared {
            state: Mutex::new(WakeState {
                entries,
                ..Default::default()
            }),
            facility,
            store,
            clock,
            handler: self.handler,
            config: self.config,
        });

        {
            let mut state = shared.lock();
            WakeShared::sync_alarm(&shared, &mut state);
        }

        info!(
            namespace = %shared.config.namespace,
            pending,
            persistent = shared.store.is_some(),
            "wake scheduler opened"
        );
        Ok(WakeScheduler { shared })
    }
}

fn load_entries(
    store: &dyn KeyValueStore,
    namespace: &str,
    discard_corrupt: bool,
) -> Result<Vec<ScheduledEntry>, EngineError> {
    let fields = match TimerFields::load(store, namespace) {
        Ok(fields) => fields,
        Err(e) => {
            warn!(namespace, error = %format!("{:#}", e), "failed to read wake list, starting empty");
            return Ok(Vec::new());
        }
    };

    let loaded = match fields.decode() {
        Ok(entries) => entries,
        Err(e) if discard_corrupt => {
            warn!(namespace, error = %e, "discarding unreadable wake list");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    // Re-sort and keep one entry per action.
    let mut entries: Vec<ScheduledEntry> = Vec::with_capacity(loaded.len());
    let mut sorted = loaded;
    sorted.sort_by_key(|e| e.fire_at_ms);
    for entry in sorted {
        if !entries.iter().any(|e| e.action == entry.action) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

// =============================================================================
// Scheduler
// =============================================================================

/// Handle to a wake scheduler. Clones share the same list.
#[derive(Clone)]
pub struct WakeScheduler {
    shared: Arc<WakeShared>,
}

impl WakeScheduler {
    /// `handler` receives `(action, true, 0, Payload::Tag(tag))` for every
    /// fired entry, on whatever thread the facility calls back on. Use
    /// `EngineHandle::queue_handler` to move fires onto an engine queue.
    pub fn builder(handler: ActionHandler) -> WakeSchedulerBuilder {
        WakeSchedulerBuilder {
            handler,
            facility: None,
            store: None,
            clock: None,
            config: WakeConfig::default(),
            discard_corrupt: false,
        }
    }

    /// Fire `action` once after `delay`, replacing any pending entry for it.
    pub fn schedule_delayed(
        &self,
        action: ActionId,
        delay: Duration,
        tag: &str,
    ) -> Result<(), EngineError> {
        self.schedule(action, millis(delay), 0, tag)
    }

    /// Fire `action` every `interval`, first after one interval, replacing any
    /// pending entry for it. Intervals under a millisecond are rounded up.
    pub fn schedule_repeating(
        &self,
        action: ActionId,
        interval: Duration,
        tag: &str,
    ) -> Result<(), EngineError> {
        let interval_ms = millis(interval).max(1);
        self.schedule(action, interval_ms, interval_ms, tag)
    }

    fn schedule(
        &self,
        action: ActionId,
        delay_ms: i64,
        repeat_ms: i64,
        tag: &str,
    ) -> Result<(), EngineError> {
        if tag.contains('\n') {
            return Err(EngineError::InvalidTag { action });
        }

        let mut state = self.shared.lock();
        if state.stopped {
            return Err(EngineError::SchedulerStopped);
        }

        let fire_at_ms = self.shared.clock.now_ms().saturating_add(delay_ms);
        state.entries.retain(|e| e.action != action);
        insert_sorted(
            &mut state.entries,
            ScheduledEntry {
                action,
                tag: tag.to_string(),
                fire_at_ms,
                repeat_ms,
            },
        );
        self.shared.persist(&state.entries);
        WakeShared::sync_alarm(&self.shared, &mut state);

        debug!(action = %action, fire_at_ms, repeat_ms, tag, "wake entry scheduled");
        Ok(())
    }

    /// Remove the entry for `action`. Returns whether one was pending.
    pub fn cancel(&self, action: ActionId) -> Result<bool, EngineError> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(EngineError::SchedulerStopped);
        }

        let Some(index) = state.entries.iter().position(|e| e.action == action) else {
            return Ok(false);
        };
        let removed = state.entries.remove(index);
        if state.armed == Some(removed.key()) {
            self.shared.facility.disarm();
            state.armed = None;
        }
        self.shared.persist(&state.entries);
        WakeShared::sync_alarm(&self.shared, &mut state);

        debug!(action = %action, "wake entry cancelled");
        Ok(true)
    }

    /// Remove every entry carrying `tag`. Returns how many were removed.
    pub fn cancel_tag(&self, tag: &str) -> Result<usize, EngineError> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(EngineError::SchedulerStopped);
        }

        let before = state.entries.len();
        state.entries.retain(|e| e.tag != tag);
        let removed = before - state.entries.len();
        if removed > 0 {
            self.shared.persist(&state.entries);
            WakeShared::sync_alarm(&self.shared, &mut state);
            debug!(tag, removed, "wake entries cancelled by tag");
        }
        Ok(removed)
    }

    /// Remove everything, disarm, and persist the empty list.
    pub fn cancel_all(&self) -> Result<(), EngineError> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(EngineError::SchedulerStopped);
        }

        state.entries.clear();
        state.armed = None;
        self.shared.facility.disarm();
        self.shared.persist(&state.entries);
        info!(namespace = %self.shared.config.namespace, "wake list cleared");
        Ok(())
    }

    /// Disarm and stop accepting calls. Persisted entries are left in place
    /// for the next [`open`](WakeSchedulerBuilder::open). Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        if state.armed.take().is_some() {
            self.shared.facility.disarm();
        }
        info!(namespace = %self.shared.config.namespace, "wake scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Pending entries in fire order.
    pub fn pending(&self) -> Vec<ScheduledEntry> {
        self.shared.lock().entries.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// The entry the facility is currently armed for.
    pub fn armed(&self) -> Option<ScheduledEntry> {
        let state = self.shared.lock();
        let (action, fire_at_ms) = state.armed?;
        state
            .entries
            .iter()
            .find(|e| e.action == action && e.fire_at_ms == fire_at_ms)
            .cloned()
    }
}

impl std::fmt::Debug for WakeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("WakeScheduler")
            .field("namespace", &self.shared.config.namespace)
            .field("pending", &state.entries.len())
            .field("armed", &state.armed)
            .field("stopped", &state.stopped)
            .finish()
    }
}
