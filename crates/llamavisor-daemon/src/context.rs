//! Shared state handed to every component at construction.

use std::sync::Arc;

use crate::sampler::ResourceHistory;
use crate::session::{ConversationLog, EventBroadcaster};
use crate::subprocess::InFlight;

/// Handles to the state shared between the supervisor, the demultiplexer,
/// the serializer, the sampler and callers. Cloning is cheap.
#[derive(Clone)]
pub struct ServiceContext {
    pub broadcaster: Arc<EventBroadcaster>,
    pub conversation: Arc<ConversationLog>,
    pub in_flight: Arc<InFlight>,
    pub resources: Arc<ResourceHistory>,
}

impl ServiceContext {
    pub fn new(subscriber_capacity: usize, turn_history: usize, sample_history: usize) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(subscriber_capacity));
        Self {
            conversation: Arc::new(ConversationLog::new(turn_history, Arc::clone(&broadcaster))),
            broadcaster,
            in_flight: Arc::new(InFlight::new()),
            resources: Arc::new(ResourceHistory::new(sample_history)),
        }
    }
}
