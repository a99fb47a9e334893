//! Execution events
//!
//! Events form an in-band queue of time-scoped facts for one execution:
//! external signals, durable timers, captured logs, per-step outputs, and
//! lifecycle markers. Signals and timers carry consumption state
//! (`consumed_at`) so delivery is single-reader; the rest is an append-only
//! trail for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of execution events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// External signal awaiting a wait-for-signal step
    Signal,

    /// Durable timer; `visible_at` is the fire time
    Timer,

    /// Free-form log attachment (e.g. sandbox console output)
    Message,

    /// A step's output (one per step name, large values replaced by a sentinel)
    Output,

    /// Step body began
    StepStarted,

    /// Step body finished
    StepCompleted,

    /// First executor entry for this execution
    WorkflowStarted,

    /// Execution reached a terminal result
    WorkflowCompleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Timer => write!(f, "timer"),
            Self::Message => write!(f, "message"),
            Self::Output => write!(f, "output"),
            Self::StepStarted => write!(f, "step_started"),
            Self::StepCompleted => write!(f, "step_completed"),
            Self::WorkflowStarted => write!(f, "workflow_started"),
            Self::WorkflowCompleted => write!(f, "workflow_completed"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(Self::Signal),
            "timer" => Ok(Self::Timer),
            "message" => Ok(Self::Message),
            "output" => Ok(Self::Output),
            "step_started" => Ok(Self::StepStarted),
            "step_completed" => Ok(Self::StepCompleted),
            "workflow_started" => Ok(Self::WorkflowStarted),
            "workflow_completed" => Ok(Self::WorkflowCompleted),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A persisted event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Event id (UUID v7, creation-ordered)
    pub id: Uuid,

    /// Owning execution
    pub execution_id: Uuid,

    /// Event kind
    pub event_type: EventType,

    /// Signal name, timer step name, output step name, …
    pub name: Option<String>,

    /// Event payload
    pub payload: Option<serde_json::Value>,

    /// Insertion time
    pub created_at: DateTime<Utc>,

    /// For timers: the fire time
    pub visible_at: Option<DateTime<Utc>>,

    /// Consumption marker; a null means deliverable
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ExecutionEvent {
    /// Whether the event is still deliverable
    pub fn is_pending(&self) -> bool {
        self.consumed_at.is_none()
    }

    /// Whether a timer event is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.visible_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// An event about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub name: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub visible_at: Option<DateTime<Utc>>,
}

impl NewEvent {
    /// An external signal
    pub fn signal(name: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            event_type: EventType::Signal,
            name: Some(name.into()),
            payload,
            visible_at: None,
        }
    }

    /// A durable timer for a step, firing at `wake_at`
    pub fn timer(step: impl Into<String>, wake_at: DateTime<Utc>) -> Self {
        Self {
            event_type: EventType::Timer,
            name: Some(step.into()),
            payload: None,
            visible_at: Some(wake_at),
        }
    }

    /// A log attachment for a step
    pub fn message(step: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: EventType::Message,
            name: Some(step.into()),
            payload: Some(payload),
            visible_at: None,
        }
    }

    /// A step output record
    pub fn output(step: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: EventType::Output,
            name: Some(step.into()),
            payload: Some(payload),
            visible_at: None,
        }
    }

    /// A lifecycle marker without a name
    pub fn lifecycle(event_type: EventType, payload: Option<serde_json::Value>) -> Self {
        Self {
            event_type,
            name: None,
            payload,
            visible_at: None,
        }
    }

    /// A step lifecycle marker
    pub fn step_marker(event_type: EventType, step: impl Into<String>) -> Self {
        Self {
            event_type,
            name: Some(step.into()),
            payload: None,
            visible_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_round_trip() {
        for event_type in [
            EventType::Signal,
            EventType::Timer,
            EventType::Message,
            EventType::Output,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::WorkflowStarted,
            EventType::WorkflowCompleted,
        ] {
            let text = event_type.to_string();
            assert_eq!(text.parse::<EventType>().unwrap(), event_type);
        }
        assert!("bogus".parse::<EventType>().is_err());
    }

    #[test]
    fn test_signal_builder() {
        let event = NewEvent::signal("approve", Some(json!({"ok": true})));
        assert_eq!(event.event_type, EventType::Signal);
        assert_eq!(event.name.as_deref(), Some("approve"));
        assert!(event.visible_at.is_none());
    }

    #[test]
    fn test_timer_due() {
        let now = Utc::now();
        let event = ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id: Uuid::now_v7(),
            event_type: EventType::Timer,
            name: Some("nap".to_string()),
            payload: None,
            created_at: now,
            visible_at: Some(now + chrono::Duration::seconds(30)),
            consumed_at: None,
        };

        assert!(!event.is_due(now));
        assert!(event.is_due(now + chrono::Duration::seconds(31)));
        assert!(event.is_pending());
    }
}
