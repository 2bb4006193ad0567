//! Testing utilities for cadence engines and wake schedulers.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! cadence = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording handler calls
//!
//! ```ignore
//! use cadence::testing::Recorder;
//!
//! let recorder = Recorder::new();
//! let (handle, _ui) = EngineBuilder::new(recorder.handler()).build().start()?;
//!
//! handle.register_permanent(ActionId(1), ["tap_down", "tap_up"], Queue::Background)?;
//! handle.signal("tap_down", true);
//! handle.signal("tap_up", true);
//!
//! recorder.wait_for(1, Duration::from_secs(1)).await;
//! assert!(recorder.calls()[0].success);
//! ```
//!
//! # Driving the wake scheduler by hand
//!
//! [`ManualClock`] and [`ManualWakeFacility`] let a test decide when time
//! passes and when the armed alarm goes off:
//!
//! ```ignore
//! let clock = Arc::new(ManualClock::new(0));
//! let facility = Arc::new(ManualWakeFacility::new());
//! let wake = WakeScheduler::builder(recorder.handler())
//!     .facility(facility.clone())
//!     .clock(clock.clone())
//!     .store(Arc::new(InMemoryStore::new()))
//!     .open()?;
//!
//! wake.schedule_delayed(ActionId(1), Duration::from_secs(5), "t")?;
//! clock.advance(5_000);
//! assert!(facility.fire());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;

use tokio::time::Instant;

use crate::alarm::{Alarm, AlarmCallback, Clock, WakeFacility};
use crate::core::{ActionHandler, ActionId, Payload};
use crate::store::KeyValueStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Recorder
// =============================================================================

/// One handler invocation captured by a [`Recorder`].
#[derive(Clone, Debug)]
pub struct Call {
    pub action: ActionId,
    pub success: bool,
    pub extra: i32,
    pub payload: Payload,
    /// Tokio time of the call, so paused-clock tests can measure delays.
    pub at: Instant,
    pub thread: ThreadId,
}

/// Handler that records every invocation.
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> ActionHandler {
        let recorder = self.clone();
        Arc::new(move |action, success, extra, payload| {
            recorder.record(action, success, extra, payload);
        })
    }

    pub fn record(&self, action: ActionId, success: bool, extra: i32, payload: Payload) {
        lock(&self.calls).push(Call {
            action,
            success,
            extra,
            payload,
            at: Instant::now(),
            thread: std::thread::current().id(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn actions(&self) -> Vec<ActionId> {
        lock(&self.calls).iter().map(|c| c.action).collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Wait until at least `n` calls were recorded.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` passes first.
    pub async fn wait_for(&self, n: usize, timeout: Duration) {
        let waited = tokio::time::timeout(timeout, async {
            while self.count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        if waited.is_err() {
            panic!(
                "timed out waiting for {} calls, saw {}: {:?}",
                n,
                self.count(),
                self.actions()
            );
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("calls", &self.count())
            .finish()
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// [`KeyValueStore`] kept in a `HashMap`.
///
/// `fail_writes(true)` makes every `put_all` return an error, for exercising
/// the log-and-continue path.
#[derive(Default)]
pub struct InMemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `put_all` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.values).insert(key.into(), value.into());
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn put_all(&self, entries: &[(String, String)]) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        let mut values = lock(&self.values);
        for (key, value) in entries {
            values.insert(key.clone(), value.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Manual clock
// =============================================================================

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Manual wake facility
// =============================================================================

/// [`WakeFacility`] whose alarm fires only when a test calls [`fire`](Self::fire).
#[derive(Default)]
pub struct ManualWakeFacility {
    armed: Mutex<Option<(Alarm, AlarmCallback)>>,
    arms: AtomicUsize,
    disarms: AtomicUsize,
}

impl ManualWakeFacility {
    pub fn new() -> Self {
        Self::default()
    }

    /// The alarm currently armed.
    pub fn armed(&self) -> Option<Alarm> {
        lock(&self.armed).as_ref().map(|(alarm, _)| alarm.clone())
    }

    /// Fire the armed alarm. Returns false if nothing was armed.
    pub fn fire(&self) -> bool {
        // Taken out first so the callback can re-arm.
        let armed = lock(&self.armed).take();
        match armed {
            Some((alarm, on_fire)) => {
                on_fire(alarm);
                true
            }
            None => false,
        }
    }

    /// Remove the armed alarm without firing it, keeping its callback so a
    /// test can deliver it late.
    pub fn take(&self) -> Option<(Alarm, AlarmCallback)> {
        lock(&self.armed).take()
    }

    pub fn arm_count(&self) -> usize {
        self.arms.load(Ordering::SeqCst)
    }

    pub fn disarm_count(&self) -> usize {
        self.disarms.load(Ordering::SeqCst)
    }
}

impl WakeFacility for ManualWakeFacility {
    fn arm(&self, alarm: Alarm, on_fire: AlarmCallback) {
        self.arms.fetch_add(1, Ordering::SeqCst);
        *lock(&self.armed) = Some((alarm, on_fire));
    }

    fn disarm(&self) {
        self.disarms.fetch_add(1, Ordering::SeqCst);
        lock(&self.armed).take();
    }
}

impl std::fmt::Debug for ManualWakeFacility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualWakeFacility")
            .field("armed", &self.armed())
            .field("arms", &self.arm_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recorder_wait_for_sees_other_thread() {
        let recorder = Recorder::new();
        let handler = recorder.handler();
        std::thread::spawn(move || handler(ActionId(1), true, 0, Payload::None));

        recorder.wait_for(1, Duration::from_secs(5)).await;
        assert_eq!(recorder.actions(), vec![ActionId(1)]);
        assert_ne!(recorder.calls()[0].thread, std::thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "timed out")]
    async fn test_recorder_wait_for_times_out() {
        Recorder::new().wait_for(1, Duration::from_millis(50)).await;
    }

    #[test]
    fn test_in_memory_store_failure_toggle() {
        let store = InMemoryStore::new();
        store.put_all(&[("a".into(), "1".into())]).unwrap();

        store.fail_writes(true);
        assert!(store.put_all(&[("a".into(), "2".into())]).is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_manual_facility_fire_consumes_alarm() {
        let facility = ManualWakeFacility::new();
        assert!(!facility.fire());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        facility.arm(
            Alarm {
                action: ActionId(2),
                tag: "t".into(),
                fire_at_ms: 10,
            },
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(facility.armed().map(|a| a.action), Some(ActionId(2)));

        assert!(facility.fire());
        assert!(!facility.fire());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(facility.armed().is_none());
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(0);
        assert_eq!(clock.now_ms(), 0);
    }
}
