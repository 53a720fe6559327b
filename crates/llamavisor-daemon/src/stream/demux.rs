//! Child stdout → turns.
//!
//! Data flow:
//! ```text
//! child stdout → TurnSplitter → ConversationLog (numbering + broadcast)
//!                                      └→ transcript writer (attributed turns)
//! ```
//!
//! One demultiplexer runs per child generation and owns its buffer. The loop
//! ends when the child closes its output, a read fails, or the child stalls
//! while a prompt is awaiting output; the returned [`ChildDiedError`] tells
//! the supervisor why.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use llamavisor_core::TranscriptEntry;

use crate::context::ServiceContext;
use crate::session::{Diagnostic, DiagnosticKind, Role, ServiceEvent};
use crate::subprocess::ChildDiedError;

use super::splitter::{Split, TurnSplitter};

const READ_CHUNK: usize = 4096;

/// Splitting and stall-detection settings.
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    pub sentinel: String,
    pub max_buffer_bytes: usize,
    /// `None` disables stall detection.
    pub stall_timeout: Option<Duration>,
}

/// Reads one child generation's output and publishes its turns.
pub struct StreamDemultiplexer<R> {
    reader: R,
    splitter: TurnSplitter,
    generation: u64,
    stall_timeout: Option<Duration>,
    ctx: ServiceContext,
    transcript: Option<mpsc::Sender<TranscriptEntry>>,
}

impl<R> StreamDemultiplexer<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        config: &DemuxConfig,
        generation: u64,
        ctx: ServiceContext,
        transcript: Option<mpsc::Sender<TranscriptEntry>>,
    ) -> Self {
        Self {
            reader,
            splitter: TurnSplitter::new(&config.sentinel, config.max_buffer_bytes),
            generation,
            stall_timeout: config.stall_timeout,
            ctx,
            transcript,
        }
    }

    /// Read until the stream ends or the child is presumed dead.
    pub async fn run(mut self) -> ChildDiedError {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut last_turn_at = Instant::now();

        loop {
            let stall = self.stall_deadline(last_turn_at);
            let stalled = async move {
                match stall {
                    Some((deadline, timeout)) => {
                        tokio::time::sleep_until(deadline).await;
                        timeout
                    }
                    None => std::future::pending().await,
                }
            };

            let read = tokio::select! {
                read = self.reader.read(&mut buf) => read,
                // A new submission may arm the stall timer.
                () = self.ctx.in_flight.wait_for_push(), if self.stall_timeout.is_some() => continue,
                timeout = stalled => {
                    warn!(
                        generation = self.generation,
                        awaiting = self.ctx.in_flight.len(),
                        ?timeout,
                        "No sentinel since last submission, child presumed hung"
                    );
                    return ChildDiedError::Stalled { timeout };
                }
            };

            match read {
                Ok(0) => {
                    self.discard_residue();
                    info!(generation = self.generation, "Child output closed");
                    return ChildDiedError::OutputClosed;
                }
                Ok(n) => {
                    for split in self.splitter.push(&buf[..n]) {
                        if self.handle_split(split) {
                            last_turn_at = Instant::now();
                        }
                    }
                }
                Err(e) => {
                    warn!(generation = self.generation, error = %e, "Failed to read child output");
                    return ChildDiedError::ReadFailed {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    /// Deadline for the next sentinel while a prompt is awaiting output,
    /// with the timeout it was derived from.
    fn stall_deadline(&self, last_turn_at: Instant) -> Option<(Instant, Duration)> {
        let timeout = self.stall_timeout?;
        let submitted = self.ctx.in_flight.oldest_submitted()?;
        Some((submitted.max(last_turn_at) + timeout, timeout))
    }

    /// Returns `true` when a complete turn was emitted.
    fn handle_split(&self, split: Split) -> bool {
        match split {
            Split::Turn(text) => {
                let pending = self.ctx.in_flight.pop_front();
                let turn = self.ctx.conversation.record(
                    Role::Model,
                    text,
                    pending.as_ref().map(|p| p.id),
                    self.generation,
                );
                debug!(
                    generation = self.generation,
                    sequence = turn.sequence,
                    request_id = ?turn.request_id,
                    bytes = turn.text.len(),
                    "Turn emitted"
                );
                if let Some(request) = pending {
                    self.log_transcript(TranscriptEntry::now(request.prompt, turn.text));
                }
                true
            }
            Split::Overflow { text, error } => {
                warn!(generation = self.generation, %error, "Stream overflow, flushing buffer");
                self.ctx
                    .broadcaster
                    .publish(ServiceEvent::Diagnostic(Diagnostic {
                        kind: DiagnosticKind::StreamOverflow,
                        generation: self.generation,
                        message: error.to_string(),
                    }));
                if !text.is_empty() {
                    // Partial output: attribute it, but keep the request awaiting
                    // its sentinel.
                    self.ctx.conversation.record(
                        Role::Model,
                        text,
                        self.ctx.in_flight.front_id(),
                        self.generation,
                    );
                }
                false
            }
        }
    }

    fn discard_residue(&mut self) {
        let residue = self.splitter.take_residue();
        if residue.is_empty() {
            return;
        }
        warn!(
            generation = self.generation,
            bytes = residue.len(),
            "Discarding output left without a sentinel"
        );
        self.ctx
            .broadcaster
            .publish(ServiceEvent::Diagnostic(Diagnostic {
                kind: DiagnosticKind::DiscardedResidue,
                generation: self.generation,
                message: format!("{} bytes of unterminated output discarded", residue.len()),
            }));
    }

    fn log_transcript(&self, entry: TranscriptEntry) {
        let Some(tx) = &self.transcript else {
            return;
        };
        if let Err(e) = tx.try_send(entry) {
            warn!(generation = self.generation, error = %e, "Transcript entry dropped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::session::Subscription;
    use crate::subprocess::PendingRequest;
    use tokio::io::AsyncWriteExt;

    const SENTINEL: &str = "### User:";

    fn config(stall: Option<Duration>) -> DemuxConfig {
        DemuxConfig {
            sentinel: SENTINEL.into(),
            max_buffer_bytes: 64,
            stall_timeout: stall,
        }
    }

    fn drain_turns(sub: &mut Subscription) -> Vec<crate::session::Turn> {
        std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| e.as_turn().cloned())
            .collect()
    }

    #[tokio::test]
    async fn turns_are_tagged_with_awaiting_requests_in_order() {
        let ctx = ServiceContext::new(64, 16, 16);
        let mut sub = ctx.broadcaster.subscribe();
        let (mut child_out, reader) = tokio::io::duplex(1024);
        let (tx, mut transcript) = mpsc::channel(8);

        let first = PendingRequest::new("first?");
        let second = PendingRequest::new("second?");
        let (first_id, second_id) = (first.id, second.id);

        let demux = StreamDemultiplexer::new(reader, &config(None), 3, ctx.clone(), Some(tx));
        let task = tokio::spawn(demux.run());

        child_out.write_all(b"banner\n### User:").await.unwrap();
        tokio::task::yield_now().await;
        // Wait for the banner to be processed before queuing requests.
        while ctx.conversation.last_sequence() < 1 {
            tokio::task::yield_now().await;
        }
        ctx.in_flight.push(first);
        ctx.in_flight.push(second);
        child_out.write_all(b"one\n### User:tw").await.unwrap();
        child_out.write_all(b"o\n### User:").await.unwrap();
        drop(child_out);

        assert!(matches!(task.await.unwrap(), ChildDiedError::OutputClosed));

        let turns = drain_turns(&mut sub);
        let got: Vec<_> = turns
            .iter()
            .map(|t| (t.sequence, t.text.as_str(), t.request_id))
            .collect();
        assert_eq!(
            got,
            [
                (1, "banner", None),
                (2, "one", Some(first_id)),
                (3, "two", Some(second_id)),
            ]
        );
        assert!(turns.iter().all(|t| t.role == Role::Model && t.generation == 3));
        assert!(ctx.in_flight.is_empty());

        let entry = transcript.recv().await.unwrap();
        assert_eq!((entry.prompt.as_str(), entry.response.as_str()), ("first?", "one"));
        let entry = transcript.recv().await.unwrap();
        assert_eq!(entry.response, "two");
    }

    #[tokio::test]
    async fn residue_at_end_of_stream_is_reported_not_emitted() {
        let ctx = ServiceContext::new(64, 16, 16);
        let mut sub = ctx.broadcaster.subscribe();
        let (mut child_out, reader) = tokio::io::duplex(1024);

        let task = tokio::spawn(
            StreamDemultiplexer::new(reader, &config(None), 1, ctx.clone(), None).run(),
        );
        child_out.write_all(b"half an answ").await.unwrap();
        drop(child_out);
        assert!(matches!(task.await.unwrap(), ChildDiedError::OutputClosed));

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServiceEvent::Diagnostic(d) => assert_eq!(d.kind, DiagnosticKind::DiscardedResidue),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_publishes_diagnostic_and_flushes() {
        let ctx = ServiceContext::new(64, 16, 16);
        let mut sub = ctx.broadcaster.subscribe();
        let (mut child_out, reader) = tokio::io::duplex(1024);
        let pending = PendingRequest::new("long?");
        let pending_id = pending.id;
        ctx.in_flight.push(pending);

        let task = tokio::spawn(
            StreamDemultiplexer::new(reader, &config(None), 1, ctx.clone(), None).run(),
        );
        child_out.write_all(&[b'a'; 100]).await.unwrap();
        drop(child_out);
        task.await.unwrap();

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert!(matches!(
            &events[0],
            ServiceEvent::Diagnostic(d) if d.kind == DiagnosticKind::StreamOverflow
        ));
        let turn = events[1].as_turn().unwrap();
        assert_eq!(turn.text.len(), 100);
        assert_eq!(turn.request_id, Some(pending_id));
        // Still awaiting its sentinel.
        assert_eq!(ctx.in_flight.front_id(), Some(pending_id));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_is_detected_only_while_a_request_awaits() {
        let ctx = ServiceContext::new(64, 16, 16);
        let (_child_out, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(
            StreamDemultiplexer::new(
                reader,
                &config(Some(Duration::from_secs(5))),
                1,
                ctx.clone(),
                None,
            )
            .run(),
        );

        // Idle child with nothing awaiting is not a stall.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!task.is_finished());
        task.abort();

        let (_child_out, reader) = tokio::io::duplex(1024);
        ctx.in_flight.push(PendingRequest::new("hello?"));
        let result = StreamDemultiplexer::new(
            reader,
            &config(Some(Duration::from_secs(5))),
            2,
            ctx.clone(),
            None,
        )
        .run()
        .await;
        assert!(matches!(result, ChildDiedError::Stalled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn submission_after_reader_blocks_arms_the_stall_timer() {
        let ctx = ServiceContext::new(64, 16, 16);
        let (_child_out, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(
            StreamDemultiplexer::new(
                reader,
                &config(Some(Duration::from_secs(5))),
                1,
                ctx.clone(),
                None,
            )
            .run(),
        );

        // The reader is parked on an idle child before anything is submitted.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!task.is_finished());

        ctx.in_flight.push(PendingRequest::new("hello?"));
        let result = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("a silent child must be detected")
            .unwrap();
        assert_eq!(
            result,
            ChildDiedError::Stalled {
                timeout: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn output_after_submission_restarts_the_stall_timer() {
        let ctx = ServiceContext::new(64, 16, 16);
        let (mut child_out, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(
            StreamDemultiplexer::new(
                reader,
                &config(Some(Duration::from_secs(5))),
                1,
                ctx.clone(),
                None,
            )
            .run(),
        );
        tokio::task::yield_now().await;

        ctx.in_flight.push(PendingRequest::new("first?"));
        ctx.in_flight.push(PendingRequest::new("second?"));
        tokio::time::sleep(Duration::from_secs(4)).await;
        child_out.write_all(b"one\n### User:").await.unwrap();

        // The second answer has a full timeout counted from the first.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!task.is_finished());
        assert_eq!(ctx.in_flight.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(task.is_finished());
        assert!(matches!(
            task.await.unwrap(),
            ChildDiedError::Stalled { .. }
        ));
    }
}
