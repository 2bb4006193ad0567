//! Multi-event AND-join.
//!
//! A [`JoinAction`] waits for a list of named events. Each event reported
//! through [`JoinRegistry::on_event`] updates every slot carrying that name.
//! Once every slot has been observed, the action's aggregate status is
//! computed:
//!
//! - `Success` if every slot last reported success
//! - `Failure` otherwise
//!
//! The action fires only when the aggregate differs from the value it last
//! fired with. Repeated successes therefore fire once; a failure followed by a
//! recovery fires twice more.
//!
//! ```text
//! tap_down(ok) ──► [ok, waiting]      no fire
//! tap_up(ok)   ──► [ok, ok]           fire(success)
//! tap_up(ok)   ──► [ok, ok]           no fire (unchanged)
//! tap_up(err)  ──► [ok, err]          fire(failure)
//! ```
//!
//! [`RunType`] changes when an action fires. The default is
//! [`RunType::ResultChange`], described above.
//!
//! Slots are counted per occurrence: an action registered on `["a", "a"]` has
//! two slots, both updated by a single `a`.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::core::{ActionHandler, ActionId, EventSnapshot, EventStatus, Queue};
use crate::error::EngineError;
use crate::pool::{EventPool, EventRecord};

/// Lifetime and ordering policy of a join registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    /// Stays registered across fires.
    Permanent,
    /// Removed after its first fire. Only one can be live at a time.
    Once,
    /// Permanent, and events are only accepted in registration order.
    Sequence,
}

/// When a join action fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunType {
    /// Every matched event fires, carrying that event's success and extra.
    EventUpdate,
    /// Fires when the aggregate over all slots changes.
    #[default]
    ResultChange,
    /// Fires every time all slots are observed and the aggregate is success.
    ResultUpdate,
}

/// A join transition ready to be dispatched.
pub struct JoinFire {
    pub action: ActionId,
    pub success: bool,
    pub extra: i32,
    pub queue: Queue,
    pub events: Arc<[EventSnapshot]>,
    pub handler: Option<ActionHandler>,
}

impl std::fmt::Debug for JoinFire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinFire")
            .field("action", &self.action)
            .field("success", &self.success)
            .field("extra", &self.extra)
            .field("queue", &self.queue)
            .field("events", &self.events)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Join descriptor: the events an action waits for and what it last fired.
pub struct JoinAction {
    id: ActionId,
    slots: SmallVec<[EventRecord; 4]>,
    queue: Queue,
    kind: JoinKind,
    run_type: RunType,
    last_fired: EventStatus,
    handler: Option<ActionHandler>,
}

impl JoinAction {
    fn new<I>(
        pool: &EventPool,
        id: ActionId,
        names: I,
        queue: Queue,
        kind: JoinKind,
        handler: Option<ActionHandler>,
    ) -> Result<Self, EngineError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let slots: SmallVec<[EventRecord; 4]> = names
            .into_iter()
            .map(|name| pool.obtain(name.as_ref()))
            .collect();

        if slots.is_empty() {
            return Err(EngineError::EmptyEventSet { action: id });
        }

        Ok(Self {
            id,
            slots,
            queue,
            kind,
            run_type: RunType::default(),
            last_fired: EventStatus::Waiting,
            handler,
        })
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub fn run_type(&self) -> RunType {
        self.run_type
    }

    pub fn set_run_type(&mut self, run_type: RunType) {
        self.run_type = run_type;
    }

    /// Status this action last fired with (`Waiting` if it never fired).
    pub fn last_fired(&self) -> EventStatus {
        self.last_fired
    }

    /// Name of the first slot that is not in `Success`.
    pub fn waiting_event(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|slot| !slot.status().is_success())
            .map(EventRecord::name)
    }

    pub fn snapshot(&self) -> Vec<EventSnapshot> {
        self.slots.iter().map(EventRecord::snapshot).collect()
    }

    /// Put every slot back to `Waiting` and forget the last fire.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.last_fired = EventStatus::Waiting;
    }

    /// Apply an event. Returns a fire if the run type says this event
    /// triggers the action.
    fn on_event(
        &mut self,
        name: &str,
        success: bool,
        extra: i32,
        payload: &Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<JoinFire> {
        let found = if self.kind == JoinKind::Sequence {
            self.apply_in_sequence(name, success, extra, payload)
        } else {
            let mut found = false;
            for slot in self.slots.iter_mut().filter(|slot| slot.name() == name) {
                slot.observe(success, extra, payload.clone());
                found = true;
            }
            found
        };

        if !found {
            return None;
        }

        trace!(action = %self.id, event = name, success, "event applied");

        if self.run_type == RunType::EventUpdate {
            debug!(action = %self.id, event = name, success, "join action fired on event update");
            return Some(self.fire(success, extra));
        }

        let aggregate = self.aggregate()?;
        match self.run_type {
            RunType::ResultUpdate if !aggregate.is_success() => return None,
            RunType::ResultChange if aggregate == self.last_fired => return None,
            _ => {}
        }
        self.last_fired = aggregate;

        debug!(action = %self.id, status = %aggregate, "join action fired");

        Some(self.fire(aggregate.is_success(), 0))
    }

    fn fire(&self, success: bool, extra: i32) -> JoinFire {
        JoinFire {
            action: self.id,
            success,
            extra,
            queue: self.queue,
            events: self.snapshot().into(),
            handler: self.handler.clone(),
        }
    }

    /// Ordered variant: only the first matching slot with every earlier slot
    /// observed accepts the event. An event that arrives early rewinds the
    /// last observed slot before the gap.
    fn apply_in_sequence(
        &mut self,
        name: &str,
        success: bool,
        extra: i32,
        payload: &Option<Arc<dyn Any + Send + Sync>>,
    ) -> bool {
        for i in 0..self.slots.len() {
            if self.slots[i].name() == name {
                self.slots[i].observe(success, extra, payload.clone());
                return true;
            }
            if !self.slots[i].status().is_observed() {
                let named_later = self.slots[i..].iter().any(|slot| slot.name() == name);
                if named_later && i > 0 {
                    debug!(action = %self.id, event = name, "out-of-order event, rewinding");
                    self.slots[i - 1].reset();
                }
                return false;
            }
        }
        false
    }

    /// Aggregate over all slots, or `None` while any slot is still waiting.
    fn aggregate(&self) -> Option<EventStatus> {
        let mut failed = false;
        for slot in &self.slots {
            match slot.status() {
                EventStatus::Waiting => return None,
                EventStatus::Failure => failed = true,
                EventStatus::Success => {}
            }
        }
        Some(if failed {
            EventStatus::Failure
        } else {
            EventStatus::Success
        })
    }

    fn recycle(self, pool: &EventPool) {
        for slot in self.slots {
            pool.recycle(slot);
        }
    }
}

impl std::fmt::Debug for JoinAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinAction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("run_type", &self.run_type)
            .field("queue", &self.queue)
            .field("slots", &self.slots)
            .field("last_fired", &self.last_fired)
            .finish_non_exhaustive()
    }
}

/// All live join actions: any number of permanent ones plus at most one
/// one-shot action.
pub struct JoinRegistry {
    pool: Arc<EventPool>,
    permanent: Vec<JoinAction>,
    once: Option<JoinAction>,
}

impl JoinRegistry {
    pub fn new(pool: Arc<EventPool>) -> Self {
        Self {
            pool,
            permanent: Vec::new(),
            once: None,
        }
    }

    /// Register an action. Any live action with the same id is replaced, and
    /// a `Once` registration also replaces the previous one-shot action.
    pub fn register<I>(
        &mut self,
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
        let action = JoinAction::new(&self.pool, id, names, queue, kind, handler)?;

        if self.remove(id) {
            debug!(action = %id, "action already registered, replacing");
        }

        debug!(action = %id, ?kind, %queue, events = action.slots.len(), "action registered");

        if kind == JoinKind::Once {
            if let Some(previous) = self.once.replace(action) {
                debug!(action = %previous.id, "replacing pending once action");
                previous.recycle(&self.pool);
            }
        } else {
            self.permanent.push(action);
        }
        Ok(())
    }

    /// Apply an event to every live action. Fires are returned in
    /// registration order, the one-shot action last.
    pub fn on_event(
        &mut self,
        name: &str,
        success: bool,
        extra: i32,
        payload: Option<Arc<dyn Any + Send + Sync>>,
    ) -> SmallVec<[JoinFire; 2]> {
        let mut fires = SmallVec::new();

        for action in &mut self.permanent {
            if let Some(fire) = action.on_event(name, success, extra, &payload) {
                fires.push(fire);
            }
        }

        let fired_once = self
            .once
            .as_mut()
            .and_then(|action| action.on_event(name, success, extra, &payload));
        if let Some(fire) = fired_once {
            if let Some(action) = self.once.take() {
                debug!(action = %action.id, "once action fired, recycling");
                action.recycle(&self.pool);
            }
            fires.push(fire);
        }

        if fires.is_empty() {
            trace!(event = name, "event matched no transition");
        }
        fires
    }

    /// Remove and recycle the action with this id. Returns whether it existed.
    pub fn remove(&mut self, id: ActionId) -> bool {
        if let Some(index) = self.permanent.iter().position(|a| a.id == id) {
            self.permanent.remove(index).recycle(&self.pool);
            return true;
        }
        if self.once.as_ref().is_some_and(|a| a.id == id) {
            if let Some(action) = self.once.take() {
                action.recycle(&self.pool);
            }
            return true;
        }
        false
    }

    pub fn get(&self, id: ActionId) -> Option<&JoinAction> {
        self.permanent
            .iter()
            .chain(self.once.iter())
            .find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: ActionId) -> Option<&mut JoinAction> {
        self.permanent
            .iter_mut()
            .chain(self.once.iter_mut())
            .find(|a| a.id == id)
    }

    pub fn set_run_type(&mut self, id: ActionId, run_type: RunType) -> Result<(), EngineError> {
        let action = self
            .get_mut(id)
            .ok_or(EngineError::UnknownAction { action: id })?;
        action.set_run_type(run_type);
        Ok(())
    }

    pub fn reset(&mut self, id: ActionId) -> Result<(), EngineError> {
        let action = self
            .get_mut(id)
            .ok_or(EngineError::UnknownAction { action: id })?;
        action.reset();
        Ok(())
    }

    /// Recycle every action.
    pub fn clear(&mut self) {
        for action in self.permanent.drain(..) {
            action.recycle(&self.pool);
        }
        if let Some(action) = self.once.take() {
            action.recycle(&self.pool);
        }
    }

    pub fn len(&self) -> usize {
        self.permanent.len() + usize::from(self.once.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for JoinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRegistry")
            .field("permanent", &self.permanent.len())
            .field("once", &self.once.as_ref().map(|a| a.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JoinRegistry {
        JoinRegistry::new(Arc::new(EventPool::new(16)))
    }

    fn send(reg: &mut JoinRegistry, name: &str, success: bool) -> Vec<(ActionId, bool)> {
        reg.on_event(name, success, 0, None)
            .into_iter()
            .map(|f| (f.action, f.success))
            .collect()
    }

    #[test]
    fn test_tap_scenario() {
        let mut reg = registry();
        reg.register(
            ActionId(1),
            ["tap_down", "tap_up"],
            Queue::Background,
            JoinKind::Permanent,
            None,
        )
        .unwrap();

        assert!(send(&mut reg, "tap_down", true).is_empty());
        assert_eq!(send(&mut reg, "tap_up", true), vec![(ActionId(1), true)]);
        assert!(send(&mut reg, "tap_up", true).is_empty());
    }

    #[test]
    fn test_and_join_fires_only_after_all_in_any_order() {
        let orders = [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]];
        for order in orders {
            let mut reg = registry();
            reg.register(
                ActionId(5),
                ["a", "b", "c"],
                Queue::Background,
                JoinKind::Permanent,
                None,
            )
            .unwrap();

            assert!(send(&mut reg, order[0], true).is_empty());
            assert!(send(&mut reg, order[1], true).is_empty());
            assert_eq!(send(&mut reg, order[2], true), vec![(ActionId(5), true)]);
        }
    }

    #[test]
    fn test_failure_then_recovery_refires() {
        let mut reg = registry();
        reg.register(ActionId(2), ["a", "b"], Queue::Ui, JoinKind::Permanent, None)
            .unwrap();

        send(&mut reg, "a", true);
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(2), true)]);
        assert_eq!(send(&mut reg, "b", false), vec![(ActionId(2), false)]);
        // Still failing: no refire.
        assert!(send(&mut reg, "a", true).is_empty());
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(2), true)]);
    }

    #[test]
    fn test_first_observation_failure_fires_failure() {
        let mut reg = registry();
        reg.register(ActionId(3), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();

        send(&mut reg, "a", false);
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(3), false)]);
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        assert!(send(&mut reg, "zzz", true).is_empty());
        assert_eq!(reg.get(ActionId(1)).unwrap().last_fired(), EventStatus::Waiting);
    }

    #[test]
    fn test_empty_event_set_rejected() {
        let mut reg = registry();
        let names: [&str; 0] = [];
        let err = reg
            .register(ActionId(9), names, Queue::Background, JoinKind::Permanent, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyEventSet { action } if action == ActionId(9)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_duplicate_names_count_per_occurrence() {
        let mut reg = registry();
        reg.register(
            ActionId(4),
            ["ping", "ping", "pong"],
            Queue::Background,
            JoinKind::Permanent,
            None,
        )
        .unwrap();

        assert!(send(&mut reg, "ping", true).is_empty());
        let fires = reg.on_event("pong", true, 0, None);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].events.len(), 3);
        assert!(fires[0].events.iter().all(|e| e.status == EventStatus::Success));
    }

    #[test]
    fn test_once_action_removed_after_fire() {
        let pool = Arc::new(EventPool::new(16));
        let mut reg = JoinRegistry::new(pool.clone());
        reg.register(ActionId(7), ["done"], Queue::Background, JoinKind::Once, None)
            .unwrap();
        assert_eq!(reg.len(), 1);

        assert_eq!(send(&mut reg, "done", true), vec![(ActionId(7), true)]);
        assert!(reg.is_empty());
        assert_eq!(pool.available(), 1);
        assert!(send(&mut reg, "done", false).is_empty());
    }

    #[test]
    fn test_register_once_replaces_previous_once() {
        let mut reg = registry();
        reg.register(ActionId(1), ["x"], Queue::Background, JoinKind::Once, None)
            .unwrap();
        reg.register(ActionId(2), ["y"], Queue::Background, JoinKind::Once, None)
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert!(send(&mut reg, "x", true).is_empty());
        assert_eq!(send(&mut reg, "y", true), vec![(ActionId(2), true)]);
    }

    #[test]
    fn test_reregistering_same_id_replaces() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        send(&mut reg, "a", true);
        reg.register(ActionId(1), ["c"], Queue::Ui, JoinKind::Permanent, None)
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert!(send(&mut reg, "b", true).is_empty());
        let fires = reg.on_event("c", true, 0, None);
        assert_eq!(fires[0].queue, Queue::Ui);
    }

    #[test]
    fn test_sequence_requires_order() {
        let mut reg = registry();
        reg.register(
            ActionId(8),
            ["first", "second", "third"],
            Queue::Background,
            JoinKind::Sequence,
            None,
        )
        .unwrap();

        // Out of order: ignored.
        assert!(send(&mut reg, "third", true).is_empty());
        assert!(send(&mut reg, "first", true).is_empty());
        // Early "third" rewinds "first".
        assert!(send(&mut reg, "third", true).is_empty());
        assert_eq!(
            reg.get(ActionId(8)).unwrap().waiting_event(),
            Some("first")
        );

        assert!(send(&mut reg, "first", true).is_empty());
        assert!(send(&mut reg, "second", true).is_empty());
        assert_eq!(send(&mut reg, "third", true), vec![(ActionId(8), true)]);
    }

    #[test]
    fn test_sequence_ignores_unrelated_events() {
        let mut reg = registry();
        reg.register(ActionId(8), ["a", "b"], Queue::Background, JoinKind::Sequence, None)
            .unwrap();
        send(&mut reg, "a", true);
        send(&mut reg, "unrelated", true);
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(8), true)]);
    }

    #[test]
    fn test_reset_and_waiting_event() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        send(&mut reg, "a", true);
        assert_eq!(reg.get(ActionId(1)).unwrap().waiting_event(), Some("b"));
        send(&mut reg, "b", true);
        assert_eq!(reg.get(ActionId(1)).unwrap().waiting_event(), None);

        reg.reset(ActionId(1)).unwrap();
        assert_eq!(reg.get(ActionId(1)).unwrap().waiting_event(), Some("a"));
        send(&mut reg, "a", true);
        // Reset forgot the last fire, so success fires again.
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(1), true)]);

        assert!(matches!(
            reg.reset(ActionId(99)),
            Err(EngineError::UnknownAction { .. })
        ));
    }

    #[test]
    fn test_fire_snapshot_carries_extra_and_payload() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        reg.on_event("a", true, 11, Some(Arc::new("left".to_string())));
        let fires = reg.on_event("b", true, 22, None);

        let events = &fires[0].events;
        assert_eq!(events[0].name, "a");
        assert_eq!(events[0].extra, 11);
        assert_eq!(events[0].payload_ref::<String>().map(String::as_str), Some("left"));
        assert_eq!(events[1].extra, 22);
    }

    #[test]
    fn test_event_update_fires_on_every_matched_event() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        reg.set_run_type(ActionId(1), RunType::EventUpdate).unwrap();

        let fires = reg.on_event("a", false, 42, None);
        assert_eq!(fires.len(), 1);
        assert!(!fires[0].success);
        assert_eq!(fires[0].extra, 42);

        assert_eq!(send(&mut reg, "a", true), vec![(ActionId(1), true)]);
        assert_eq!(send(&mut reg, "a", true), vec![(ActionId(1), true)]);
        assert_eq!(send(&mut reg, "b", false), vec![(ActionId(1), false)]);
        assert!(send(&mut reg, "other", true).is_empty());
    }

    #[test]
    fn test_result_change_is_the_default() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        assert_eq!(reg.get(ActionId(1)).unwrap().run_type(), RunType::ResultChange);

        assert_eq!(send(&mut reg, "a", true), vec![(ActionId(1), true)]);
        assert!(send(&mut reg, "a", true).is_empty());
        assert_eq!(send(&mut reg, "a", false), vec![(ActionId(1), false)]);
        assert!(send(&mut reg, "a", false).is_empty());
    }

    #[test]
    fn test_result_update_fires_on_each_complete_success() {
        let mut reg = registry();
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        reg.set_run_type(ActionId(1), RunType::ResultUpdate).unwrap();

        assert!(send(&mut reg, "a", true).is_empty());
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(1), true)]);
        // Unchanged success fires again.
        assert_eq!(send(&mut reg, "b", true), vec![(ActionId(1), true)]);
        // Failing aggregates never fire.
        assert!(send(&mut reg, "a", false).is_empty());
        assert!(send(&mut reg, "b", true).is_empty());
        assert_eq!(send(&mut reg, "a", true), vec![(ActionId(1), true)]);
    }

    #[test]
    fn test_set_run_type_unknown_action() {
        let mut reg = registry();
        assert!(matches!(
            reg.set_run_type(ActionId(3), RunType::EventUpdate),
            Err(EngineError::UnknownAction { action }) if action == ActionId(3)
        ));
    }

    #[test]
    fn test_clear_recycles_into_pool() {
        let pool = Arc::new(EventPool::new(16));
        let mut reg = JoinRegistry::new(pool.clone());
        reg.register(ActionId(1), ["a", "b"], Queue::Background, JoinKind::Permanent, None)
            .unwrap();
        reg.register(ActionId(2), ["c"], Queue::Background, JoinKind::Once, None)
            .unwrap();

        reg.clear();
        assert!(reg.is_empty());
        assert_eq!(pool.available(), 3);
    }
}
