// ABOUTME: Stream establishment: token, headers, open, start workers, register, admit sends.
// ABOUTME: Each successful run produces one stream generation with its own closed token.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Instrument;

use crate::backoff::ReconnectBackoff;
use crate::error::SessionError;
use crate::identity::TOKEN_AUDIENCE;
use crate::session::Inner;
use crate::transport::{MessageSink, StreamHandle, StreamMetadata};

/// Client-side ceiling on a stream's lifetime. The service closes idle
/// streams well before this, so its close drives reconnects.
pub const STREAM_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// One instance of the underlying bidirectional stream.
pub(crate) struct Generation {
    pub(crate) id: u64,
    pub(crate) sink: Mutex<Box<dyn MessageSink>>,
    closed: CancellationToken,
}

impl Generation {
    fn new(id: u64, sink: Box<dyn MessageSink>, closed: CancellationToken) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            closed,
        }
    }

    /// Signal this generation's workers to stop. Idempotent.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl Inner {
    /// Fetch a fresh token and build the identifying headers.
    pub(crate) async fn stream_metadata(&self) -> Result<StreamMetadata, SessionError> {
        let token = self.identity.token(TOKEN_AUDIENCE).await?;
        Ok(StreamMetadata {
            token,
            resource_id: self.resource_id.clone(),
            channel_id: self.channel_id.clone(),
        })
    }

    fn worker_span(&self, worker: &'static str, generation: u64) -> tracing::Span {
        tracing::debug_span!(parent: &self.span, "stream_worker", worker, generation)
    }

    /// Open and register a new stream generation.
    ///
    /// If the new stream dies before registration completes, its receive
    /// loop has already taken over recovery and this returns `Ok`.
    pub(crate) fn create_stream(
        self: Arc<Self>,
        backoff: ReconnectBackoff,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        Box::pin(async move {
            let metadata = self.stream_metadata().await?;

            let id = self.next_generation();
            tracing::debug!(
                generation = id,
                resource_id = %self.resource_id,
                channel_id = %self.channel_id,
                "creating stream"
            );
            let StreamHandle { sink, source } = self
                .transport()?
                .open_stream(&metadata, STREAM_DEADLINE)
                .await?;
            let generation = Arc::new(Generation::new(
                id,
                sink,
                self.closure.generation_token(),
            ));

            tokio::spawn(
                self.clone()
                    .receive_loop(generation.clone(), source, backoff)
                    .instrument(self.worker_span("receive_loop", id)),
            );
            tokio::spawn(
                self.clone()
                    .send_loop(generation.clone())
                    .instrument(self.worker_span("send_loop", id)),
            );

            match self.register_stream(&generation).await {
                Ok(()) => {}
                Err(SessionError::StreamClosed) if !self.closure.is_closed() => {
                    tracing::debug!(
                        generation = id,
                        "stream closed during registration, receive loop is reconnecting"
                    );
                    return Ok(());
                }
                Err(err) => {
                    generation.close();
                    return Err(err);
                }
            }

            tokio::spawn(
                self.clone()
                    .forward_admissions(generation)
                    .instrument(self.worker_span("admissions", id)),
            );
            tracing::info!(generation = id, "stream established");
            Ok(())
        })
    }

    /// Admit queued sends while this generation is open.
    async fn forward_admissions(self: Arc<Self>, generation: Arc<Generation>) {
        let mut tickets = tokio::select! {
            biased;
            _ = generation.closed() => return,
            tickets = self.admission_queue.lock() => tickets,
        };
        loop {
            tokio::select! {
                biased;
                _ = generation.closed() => break,
                Some(ticket) = tickets.recv() => {
                    // The sender may have given up already.
                    let _ = ticket.send(());
                }
            }
        }
        tracing::debug!("admission forwarding stopped");
    }
}
