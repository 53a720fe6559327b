//! Single-writer access to the child's input channel.
//!
//! Submissions are written one at a time, in the order callers reached the
//! input lock (`tokio::sync::Mutex` is FIFO-fair). A submission returns as
//! soon as its line is flushed; the answer arrives later as a model
//! [`Turn`](crate::session::Turn) tagged with the returned request id.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::{ConversationLog, RequestId, Role, SystemStatus};

use super::supervisor::SupervisorState;

/// A prompt written to the child whose output has not arrived yet.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: RequestId,
    pub prompt: String,
    pub submitted_at: Instant,
}

impl PendingRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            submitted_at: Instant::now(),
        }
    }
}

/// FIFO of requests awaiting output from the current child.
#[derive(Debug, Default)]
pub struct InFlight {
    queue: Mutex<VecDeque<PendingRequest>>,
    pushed: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: PendingRequest) {
        self.lock().push_back(request);
        self.pushed.notify_one();
    }

    /// Resolves once a request has been pushed, including one pushed before
    /// the call.
    pub async fn wait_for_push(&self) {
        self.pushed.notified().await;
    }

    /// Remove and return the oldest awaiting request.
    pub fn pop_front(&self) -> Option<PendingRequest> {
        self.lock().pop_front()
    }

    pub fn front_id(&self) -> Option<RequestId> {
        self.lock().front().map(|r| r.id)
    }

    pub fn oldest_submitted(&self) -> Option<Instant> {
        self.lock().front().map(|r| r.submitted_at)
    }

    pub fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        let mut queue = self.lock();
        let index = queue.iter().position(|r| r.id == id)?;
        queue.remove(index)
    }

    /// Forget every awaiting request, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Errors returned to prompt submitters.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Child is not ready (state: {state})")]
    NotReady { state: SupervisorState },

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Child died while the prompt was being written: {reason}")]
    ChildDied { reason: String },
}

struct InputSlot {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    generation: u64,
}

/// Serializes prompt writes to whichever child is currently attached.
pub struct RequestSerializer {
    input: AsyncMutex<Option<InputSlot>>,
    status: watch::Receiver<SystemStatus>,
    in_flight: Arc<InFlight>,
    conversation: Arc<ConversationLog>,
    input_failed: Arc<Notify>,
    prompt_suffix: String,
}

impl RequestSerializer {
    pub fn new(
        status: watch::Receiver<SystemStatus>,
        in_flight: Arc<InFlight>,
        conversation: Arc<ConversationLog>,
        input_failed: Arc<Notify>,
        prompt_suffix: impl Into<String>,
    ) -> Self {
        Self {
            input: AsyncMutex::new(None),
            status,
            in_flight,
            conversation,
            input_failed,
            prompt_suffix: prompt_suffix.into(),
        }
    }

    /// Install the input channel of a freshly started child.
    pub async fn attach<W>(&self, writer: W, generation: u64)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.input.lock().await = Some(InputSlot {
            writer: Box::new(writer),
            generation,
        });
        debug!(generation, "Child input attached");
    }

    /// Drop the current input channel, closing the child's stdin.
    ///
    /// Waits for a write in progress to finish first.
    pub async fn detach(&self) {
        if let Some(slot) = self.input.lock().await.take() {
            debug!(generation = slot.generation, "Child input detached");
        }
    }

    /// Write one prompt to the child.
    ///
    /// Interior line breaks are folded into spaces so the prompt occupies
    /// exactly one input line; the configured suffix is appended before the
    /// terminator.
    pub async fn submit(&self, prompt: &str) -> Result<RequestId, SubmitError> {
        let prompt = fold_lines(prompt);
        if prompt.trim().is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }
        self.ensure_ready()?;

        let mut input = self.input.lock().await;
        // The child may have been replaced while this call queued for the lock.
        self.ensure_ready()?;
        let Some(slot) = input.as_mut() else {
            return Err(SubmitError::NotReady {
                state: self.state(),
            });
        };

        let request = PendingRequest::new(prompt.clone());
        let id = request.id;
        let generation = slot.generation;
        let line = format!("{prompt}{}\n", self.prompt_suffix);

        self.in_flight.push(request);

        if let Err(e) = write_line(&mut slot.writer, &line).await {
            self.in_flight.remove(id);
            *input = None;
            drop(input);
            warn!(generation, request_id = %id, error = %e, "Write to child input failed");
            self.input_failed.notify_one();
            return Err(SubmitError::ChildDied {
                reason: e.to_string(),
            });
        }
        // Recorded under the input lock so user turns keep write order.
        self.conversation
            .record(Role::User, prompt, Some(id), generation);
        drop(input);

        debug!(generation, request_id = %id, bytes = line.len(), "Prompt written");
        Ok(id)
    }

    fn state(&self) -> SupervisorState {
        self.status.borrow().state
    }

    fn ensure_ready(&self) -> Result<(), SubmitError> {
        match self.state() {
            SupervisorState::Ready => Ok(()),
            state => Err(SubmitError::NotReady { state }),
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn fold_lines(prompt: &str) -> String {
    prompt
        .split(['\r', '\n'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
