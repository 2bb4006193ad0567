//! Stress tests designed to break the join, dispatch and wake machinery.
//!
//! These tests exercise concurrent producers, randomized orderings and
//! re-entrant handlers.

#[cfg(test)]
mod stress_tests {
    use crate::core::{ActionHandler, ActionId, EventStatus, Payload, Queue};
    use crate::engine::{EngineBuilder, EngineHandle};
    use crate::dispatch::UiQueue;
    use crate::pool::EventPool;
    use crate::testing::{InMemoryStore, ManualClock, ManualWakeFacility, Recorder};
    use crate::wake::WakeScheduler;
    use std::collections::HashMap;
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    fn start(recorder: &Recorder) -> (EngineHandle, UiQueue) {
        EngineBuilder::new(recorder.handler()).build().start().unwrap()
    }

    // ==========================================================================
    // Concurrent producers
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_fire_each_action_once() {
        const ACTIONS: i32 = 40;
        const THREADS: i32 = 4;

        let recorder = Recorder::new();
        let (handle, _ui) = start(&recorder);
        for i in 0..ACTIONS {
            handle
                .register_permanent(
                    ActionId(i),
                    [format!("a{}", i), format!("b{}", i)],
                    Queue::Background,
                )
                .unwrap();
        }

        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(t as u64);
                    let mut names: Vec<String> = (0..ACTIONS)
                        .filter(|i| i % THREADS == t)
                        .flat_map(|i| [format!("a{}", i), format!("b{}", i), format!("a{}", i)])
                        .collect();
                    rng.shuffle(&mut names);
                    for name in names {
                        handle.signal(&name, true);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        recorder.wait_for(ACTIONS as usize, Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut per_action: HashMap<ActionId, usize> = HashMap::new();
        for call in recorder.calls() {
            assert!(call.success);
            *per_action.entry(call.action).or_default() += 1;
        }
        assert_eq!(per_action.len(), ACTIONS as usize);
        assert!(per_action.values().all(|&n| n == 1));
        handle.stop();
    }

    // ==========================================================================
    // Randomized orderings against a model
    // ==========================================================================

    #[tokio::test]
    async fn test_random_event_streams_match_model() {
        let names = ["n0", "n1", "n2", "n3", "n1"];
        let mut rng = fastrand::Rng::with_seed(7);

        for _ in 0..200 {
            let recorder = Recorder::new();
            let (handle, mut ui) = start(&recorder);
            handle
                .register_permanent(ActionId(1), names, Queue::Ui)
                .unwrap();

            let mut statuses = [EventStatus::Waiting; 5];
            let mut last = EventStatus::Waiting;
            let mut expected = Vec::new();

            for _ in 0..30 {
                let name = names[rng.usize(..names.len())];
                let success = rng.u8(..4) != 0;
                handle.signal(name, success);

                for (slot, slot_name) in statuses.iter_mut().zip(names) {
                    if slot_name == name {
                        *slot = EventStatus::from_success(success);
                    }
                }
                if statuses.iter().all(|s| s.is_observed()) {
                    let aggregate = if statuses.iter().all(|s| s.is_success()) {
                        EventStatus::Success
                    } else {
                        EventStatus::Failure
                    };
                    if aggregate != last {
                        last = aggregate;
                        expected.push(aggregate.is_success());
                    }
                }
            }

            ui.run_pending();
            let actual: Vec<bool> = recorder.calls().iter().map(|c| c.success).collect();
            assert_eq!(actual, expected);
            handle.stop();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_producers_deliver_alternating_results() {
        const MARKER: ActionId = ActionId(99);

        for trial in 0..20 {
            let recorder = Recorder::new();
            let (handle, _ui) = start(&recorder);
            handle
                .register_permanent(ActionId(1), ["x"], Queue::Background)
                .unwrap();

            let producers: Vec<_> = [true, false]
                .into_iter()
                .map(|success| {
                    let handle = handle.clone();
                    std::thread::spawn(move || {
                        for _ in 0..200 {
                            handle.signal("x", success);
                        }
                    })
                })
                .collect();
            for producer in producers {
                producer.join().unwrap();
            }

            handle
                .run(MARKER, true, 0, Payload::None, Queue::Background)
                .unwrap();
            tokio::time::timeout(Duration::from_secs(10), async {
                while !recorder.actions().contains(&MARKER) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("marker run timed out");

            let results: Vec<bool> = recorder
                .calls()
                .iter()
                .filter(|c| c.action == ActionId(1))
                .map(|c| c.success)
                .collect();
            assert!(!results.is_empty());
            assert!(
                results.windows(2).all(|w| w[0] != w[1]),
                "trial {}: repeated result delivered",
                trial
            );

            let slot = &handle.action_events(ActionId(1)).unwrap()[0];
            assert_eq!(results.last().copied(), Some(slot.status.is_success()));
            handle.stop();
        }
    }

    // ==========================================================================
    // Registration churn
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_cancel_churn_keeps_pool_bounded() {
        let recorder = Recorder::new();
        let pool = Arc::new(EventPool::new(16));
        let (handle, _ui) = EngineBuilder::new(recorder.handler())
            .with_pool(pool.clone())
            .build()
            .start()
            .unwrap();

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = ActionId(t * 1000 + i);
                        handle
                            .register_permanent(id, ["x", "y", "z"], Queue::Background)
                            .unwrap();
                        handle.signal("x", true);
                        if i % 3 == 0 {
                            handle
                                .register_once(ActionId(-1 - t), ["x"], Queue::Background)
                                .unwrap();
                        }
                        assert!(handle.cancel_action(id));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(pool.available() <= pool.capacity());
        assert!(handle.action_count() <= 1);
        handle.stop();
        assert_eq!(pool.available(), 0);
    }

    // ==========================================================================
    // Re-entrant handlers
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handlers_can_drive_the_engine() {
        const STEPS: i32 = 100;

        let slot: Arc<OnceLock<EngineHandle>> = Arc::new(OnceLock::new());
        let recorder = Recorder::new();
        let handler: ActionHandler = {
            let slot = slot.clone();
            let recorder = recorder.clone();
            Arc::new(move |action, success, extra, payload| {
                recorder.record(action, success, extra, payload);
                let Some(handle) = slot.get() else {
                    return;
                };
                let next = action.value() + 1;
                if next < STEPS {
                    handle
                        .register_once(ActionId(next), [format!("step{}", next)], Queue::Background)
                        .unwrap();
                    handle.signal(&format!("step{}", next), true);
                }
            })
        };

        let (handle, _ui) = EngineBuilder::new(handler).build().start().unwrap();
        let _ = slot.set(handle.clone());

        handle
            .register_once(ActionId(0), ["step0"], Queue::Background)
            .unwrap();
        handle.signal("step0", true);

        recorder
            .wait_for(STEPS as usize, Duration::from_secs(10))
            .await;
        let actions = recorder.actions();
        assert_eq!(actions, (0..STEPS).map(ActionId).collect::<Vec<_>>());
        handle.stop();
    }

    // ==========================================================================
    // Cancellation under load
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_repeats_stay_cancelled() {
        let recorder = Recorder::new();
        let (handle, ui) = start(&recorder);
        tokio::spawn(ui.run());

        for i in 0..20 {
            let queue = if i % 2 == 0 { Queue::Background } else { Queue::Ui };
            handle
                .run_repeating(ActionId(i), true, i, queue, Duration::from_millis(5))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..20 {
            handle.cancel_run(ActionId(i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = recorder.count();
        assert!(settled >= 20);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.count(), settled);
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debounce_under_rapid_posts() {
        let recorder = Recorder::new();
        let (handle, _ui) = start(&recorder);

        for extra in 0..200 {
            handle
                .run_delayed(
                    ActionId(1),
                    true,
                    extra,
                    Payload::None,
                    Queue::Background,
                    Duration::from_millis(30),
                )
                .unwrap();
        }

        recorder.wait_for(1, Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].extra, 199);
        handle.stop();
    }

    // ==========================================================================
    // Wake scheduler
    // ==========================================================================

    #[test]
    fn test_concurrent_scheduling_keeps_single_earliest_alarm() {
        let facility = Arc::new(ManualWakeFacility::new());
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStore::new());
        let wake = WakeScheduler::builder(Recorder::new().handler())
            .facility(facility.clone())
            .clock(clock.clone())
            .store(store.clone())
            .open()
            .unwrap();

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let wake = wake.clone();
                std::thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(100 + t as u64);
                    for i in 0..50 {
                        let id = ActionId(t * 100 + i);
                        let delay = Duration::from_millis(rng.u64(1..1_000_000));
                        wake.schedule_delayed(id, delay, "load").unwrap();
                        if rng.u8(..5) == 0 {
                            wake.cancel(id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let pending = wake.pending();
        assert!(pending.windows(2).all(|w| w[0].fire_at_ms <= w[1].fire_at_ms));

        let armed = facility.armed().unwrap();
        assert_eq!(armed.action, pending[0].action);
        assert_eq!(armed.fire_at_ms, pending[0].fire_at_ms);

        // The persisted copy matches memory.
        let reopened = WakeScheduler::builder(Recorder::new().handler())
            .facility(Arc::new(ManualWakeFacility::new()))
            .clock(clock)
            .store(store)
            .open()
            .unwrap();
        assert_eq!(reopened.pending(), pending);
    }

    #[test]
    fn test_draining_wake_list_fires_everything_in_order() {
        let recorder = Recorder::new();
        let facility = Arc::new(ManualWakeFacility::new());
        let clock = Arc::new(ManualClock::new(0));
        let wake = WakeScheduler::builder(recorder.handler())
            .facility(facility.clone())
            .clock(clock.clone())
            .open()
            .unwrap();

        let mut rng = fastrand::Rng::with_seed(3);
        for i in 0..100 {
            let delay = Duration::from_secs(rng.u64(1..10_000));
            wake.schedule_delayed(ActionId(i), delay, "").unwrap();
        }
        let expected: Vec<ActionId> = wake.pending().iter().map(|e| e.action).collect();

        while let Some(alarm) = facility.armed() {
            clock.set(alarm.fire_at_ms);
            assert!(facility.fire());
        }

        assert_eq!(recorder.actions(), expected);
        assert_eq!(wake.pending_count(), 0);
    }
}
