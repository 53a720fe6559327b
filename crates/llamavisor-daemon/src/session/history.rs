//! Bounded in-memory history: recent turns and the conversation log.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;

use super::broadcaster::EventBroadcaster;
use super::types::{RequestId, Role, ServiceEvent, Turn};

/// Fixed-capacity buffer that overwrites its oldest entry when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted oldest one if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy of the contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

struct ConversationState {
    turns: RingBuffer<Turn>,
    last_sequence: u64,
}

/// Single source of turn sequence numbers.
///
/// Numbering, retention and publication happen under one lock, so the order
/// subscribers observe always matches sequence order.
pub struct ConversationLog {
    state: Mutex<ConversationState>,
    broadcaster: Arc<EventBroadcaster>,
}

impl ConversationLog {
    pub fn new(capacity: usize, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            state: Mutex::new(ConversationState {
                turns: RingBuffer::new(capacity),
                last_sequence: 0,
            }),
            broadcaster,
        }
    }

    /// Number, retain and publish a turn.
    pub fn record(
        &self,
        role: Role,
        text: impl Into<String>,
        request_id: Option<RequestId>,
        generation: u64,
    ) -> Turn {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_sequence += 1;
        let turn = Turn {
            sequence: state.last_sequence,
            role,
            text: text.into(),
            request_id,
            generation,
            timestamp: Utc::now(),
        };
        state.turns.push(turn.clone());
        self.broadcaster.publish(ServiceEvent::Turn(turn.clone()));
        drop(state);
        turn
    }

    /// Retained turns, oldest first.
    pub fn recent(&self) -> Vec<Turn> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .turns
            .to_vec()
    }

    pub fn last_sequence(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_sequence
    }
}
