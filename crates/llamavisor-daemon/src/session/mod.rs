//! Conversation state and event fan-out.
//!
//! Turns, resource samples and status changes are published once through
//! the [`EventBroadcaster`] and delivered to every live subscriber.

mod broadcaster;
mod history;
mod types;

pub use broadcaster::{EventBroadcaster, Subscription};
pub use history::{ConversationLog, RingBuffer};
pub use types::{
    Diagnostic, DiagnosticKind, RequestId, ResourceSample, Role, ServiceEvent, SystemStatus,
    Turn,
};
