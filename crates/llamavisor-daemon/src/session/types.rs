//! Event types published to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subprocess::SupervisorState;

/// Identifier assigned to every submitted prompt.
pub type RequestId = Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One complete unit of conversation.
///
/// Sequence numbers come from a single counter shared by user and model
/// turns, so sorting by `sequence` reconstructs the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    pub role: Role,
    pub text: String,
    /// The prompt this turn belongs to. Model turns are attributed to the
    /// oldest prompt still awaiting output; `None` for output produced while
    /// nothing was awaiting (e.g. the start-up banner).
    pub request_id: Option<RequestId>,
    /// Child generation that was live when the turn was recorded.
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

/// Host resource utilisation at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub timestamp: DateTime<Utc>,
}

/// Supervisor state change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub state: SupervisorState,
    pub generation: u64,
    pub consecutive_failures: u32,
    pub restarts: u64,
    pub detail: Option<String>,
}

impl SystemStatus {
    pub const fn stopped() -> Self {
        Self {
            state: SupervisorState::Stopped,
            generation: 0,
            consecutive_failures: 0,
            restarts: 0,
            detail: None,
        }
    }
}

/// Non-fatal anomaly worth surfacing to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Output exceeded the buffer limit without a sentinel and was flushed.
    StreamOverflow,
    /// Output left without a sentinel when the stream closed.
    DiscardedResidue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub generation: u64,
    pub message: String,
}

/// Everything the broadcaster delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    Turn(Turn),
    #[serde(rename = "system_metrics")]
    Resource(ResourceSample),
    #[serde(rename = "system_status")]
    Status(SystemStatus),
    Diagnostic(Diagnostic),
}

impl ServiceEvent {
    /// The turn carried by this event, if any.
    pub const fn as_turn(&self) -> Option<&Turn> {
        match self {
            Self::Turn(turn) => Some(turn),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ServiceEvent::Status(SystemStatus {
            state: SupervisorState::Degraded,
            generation: 4,
            consecutive_failures: 4,
            restarts: 3,
            detail: Some("child keeps exiting".into()),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "system_status");
        assert_eq!(json["state"], "degraded");

        let sample = ServiceEvent::Resource(ResourceSample {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            timestamp: Utc::now(),
        });
        assert_eq!(serde_json::to_value(&sample).unwrap()["type"], "system_metrics");
    }

    #[test]
    fn turn_round_trips_through_json() {
        let turn = Turn {
            sequence: 7,
            role: Role::Model,
            text: "Hello".into(),
            request_id: Some(Uuid::new_v4()),
            generation: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&ServiceEvent::Turn(turn.clone())).unwrap();
        let back: ServiceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_turn(), Some(&turn));
    }
}
