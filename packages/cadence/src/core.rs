//! Core types shared by the pool, the join registry, the dispatcher and the
//! wake scheduler.
//!
//! # Identity
//!
//! Actions are identified by a plain integer [`ActionId`]. The same id space is
//! used by join registrations, dispatcher runs and wake entries, so a single
//! handler can `match` on the id regardless of which component fired it.
//!
//! # Payloads
//!
//! Every delivery carries a [`Payload`]. Join fires carry a snapshot of the
//! action's events, wake fires carry the entry's tag, and direct runs carry
//! whatever the caller attached.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// =============================================================================
// Action Identity
// =============================================================================

/// Identifier of an action.
///
/// Ids are caller-chosen. Negative ids are allowed; the engine never
/// allocates ids on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub i32);

impl ActionId {
    /// Get the inner value.
    pub fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for ActionId {
    fn from(value: i32) -> Self {
        ActionId(value)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Status
// =============================================================================

/// Tri-state status of a single required event, and of an action as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// Not observed yet.
    #[default]
    Waiting,
    /// Last observation reported success.
    Success,
    /// Last observation reported failure.
    Failure,
}

impl EventStatus {
    /// Map a producer's success flag to a status.
    pub fn from_success(success: bool) -> Self {
        if success {
            EventStatus::Success
        } else {
            EventStatus::Failure
        }
    }

    pub fn is_observed(self) -> bool {
        self != EventStatus::Waiting
    }

    pub fn is_success(self) -> bool {
        self == EventStatus::Success
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Waiting => write!(f, "waiting"),
            EventStatus::Success => write!(f, "success"),
            EventStatus::Failure => write!(f, "failure"),
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Point-in-time copy of one required event, handed to handlers on a join fire.
#[derive(Clone)]
pub struct EventSnapshot {
    pub name: String,
    pub status: EventStatus,
    pub extra: i32,
    pub payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventSnapshot {
    /// Downcast the attached producer payload.
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for EventSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSnapshot")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("extra", &self.extra)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Data delivered alongside an action.
#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    None,
    /// Opaque caller data attached to a direct run or an event.
    Value(Arc<dyn Any + Send + Sync>),
    /// Snapshot of the action's required events, in registration order.
    Events(Arc<[EventSnapshot]>),
    /// Tag of a fired wake entry.
    Tag(String),
}

impl Payload {
    /// Wrap an arbitrary value.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Payload::Value(Arc::new(value))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    /// Downcast a [`Payload::Value`].
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::Value(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Event snapshots of a join fire.
    pub fn events(&self) -> Option<&[EventSnapshot]> {
        match self {
            Payload::Events(events) => Some(events),
            _ => None,
        }
    }

    /// Tag of a wake fire.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Payload::Tag(tag) => Some(tag),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => write!(f, "None"),
            Payload::Value(_) => write!(f, "Value(..)"),
            Payload::Events(events) => f.debug_tuple("Events").field(&events.len()).finish(),
            Payload::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
        }
    }
}

// =============================================================================
// Queues and Handlers
// =============================================================================

/// Execution queue a delivery is routed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    /// The engine's dedicated worker.
    #[default]
    Background,
    /// The host's UI/main context, drained through [`UiQueue`](crate::UiQueue).
    Ui,
}

impl Queue {
    pub fn from_run_on_ui(run_on_ui: bool) -> Self {
        if run_on_ui {
            Queue::Ui
        } else {
            Queue::Background
        }
    }

    pub fn is_ui(self) -> bool {
        self == Queue::Ui
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::Background => write!(f, "background"),
            Queue::Ui => write!(f, "ui"),
        }
    }
}

/// Callback invoked for every delivered action:
/// `(action, success, extra, payload)`.
pub type ActionHandler = Arc<dyn Fn(ActionId, bool, i32, Payload) + Send + Sync>;

/// Build an [`ActionHandler`] from a closure.
pub fn handler<F>(f: F) -> ActionHandler
where
    F: Fn(ActionId, bool, i32, Payload) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_success() {
        assert_eq!(EventStatus::from_success(true), EventStatus::Success);
        assert_eq!(EventStatus::from_success(false), EventStatus::Failure);
        assert!(!EventStatus::Waiting.is_observed());
        assert!(EventStatus::Failure.is_observed());
    }

    #[test]
    fn test_payload_accessors() {
        let value = Payload::value(41u32);
        assert_eq!(value.downcast_ref::<u32>(), Some(&41));
        assert!(value.downcast_ref::<String>().is_none());
        assert!(value.tag().is_none());

        let tag = Payload::Tag("nightly".into());
        assert_eq!(tag.tag(), Some("nightly"));
        assert!(tag.events().is_none());

        assert!(Payload::default().is_none());
    }

    #[test]
    fn test_snapshot_payload_downcast() {
        let snapshot = EventSnapshot {
            name: "tap_up".into(),
            status: EventStatus::Success,
            extra: 3,
            payload: Some(Arc::new("x".to_string())),
        };
        assert_eq!(snapshot.payload_ref::<String>().map(String::as_str), Some("x"));
        assert!(format!("{:?}", snapshot).contains("tap_up"));
    }

    #[test]
    fn test_queue_from_flag() {
        assert_eq!(Queue::from_run_on_ui(true), Queue::Ui);
        assert_eq!(Queue::from_run_on_ui(false), Queue::Background);
        assert_eq!(Queue::Ui.to_string(), "ui");
    }
}
