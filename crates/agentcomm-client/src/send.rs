// ABOUTME: Outbound path: correlated sends with retry, the per-generation send loop, and the
// ABOUTME: single stream write primitive shared by sends, acknowledgements and registration.

use std::sync::Arc;

use agentcomm_proto::{MessageBody, StreamAgentMessagesRequest};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backoff::{send_backoff, SEND_ATTEMPTS};
use crate::error::SessionError;
use crate::establish::Generation;
use crate::registry::ResponseWaiter;
use crate::session::Inner;
use crate::stream::WriteError;

impl Inner {
    /// Register a waiter under a fresh message id.
    fn fresh_waiter(&self) -> ResponseWaiter<'_> {
        loop {
            if let Some(waiter) = self.pending.register(Uuid::new_v4().to_string()) {
                return waiter;
            }
        }
    }

    /// Send with retry on timeout and throttling.
    pub(crate) async fn send(&self, body: MessageBody) -> Result<(), SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.send_once(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if attempt >= SEND_ATTEMPTS {
                return Err(err);
            }
            match err {
                SessionError::ResourceExhausted(ref message) => {
                    let delay = send_backoff(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "send throttled, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = self.closure.closed() => return Err(self.terminal_error()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                SessionError::MessageTimeout { ref message_id } => {
                    tracing::debug!(attempt, %message_id, "send timed out, retrying");
                }
                err => return Err(err),
            }
        }
    }

    /// One correlated send: register, wait for admission, queue, await the response.
    pub(crate) async fn send_once(&self, body: MessageBody) -> Result<(), SessionError> {
        if self.closure.is_closed() {
            return Err(self.terminal_error());
        }
        let mut waiter = self.fresh_waiter();
        let request = StreamAgentMessagesRequest::message(waiter.message_id(), body);

        self.admit().await?;

        tokio::select! {
            biased;
            _ = self.closure.closed() => return Err(self.terminal_error()),
            queued = self.sends.send(request) => {
                queued.map_err(|_| self.terminal_error())?;
            }
        }
        tracing::debug!(message_id = %waiter.message_id(), "sending message");

        self.await_response(&mut waiter, None).await
    }

    /// Rendezvous with the active generation's admission worker.
    async fn admit(&self) -> Result<(), SessionError> {
        let (ticket, admitted) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.closure.closed() => return Err(self.terminal_error()),
            handed = self.admissions.send(ticket) => {
                handed.map_err(|_| self.terminal_error())?;
            }
        }
        tokio::select! {
            biased;
            _ = self.closure.closed() => Err(self.terminal_error()),
            admitted = admitted => admitted.map_err(|_| SessionError::StreamClosed),
        }
    }

    /// Write the registration envelope straight onto `generation` and wait for its response.
    pub(crate) async fn register_stream(&self, generation: &Generation) -> Result<(), SessionError> {
        let mut waiter = self.fresh_waiter();
        let request = StreamAgentMessagesRequest::register(
            waiter.message_id(),
            self.resource_id.clone(),
            self.channel_id.clone(),
        );
        tracing::debug!(message_id = %waiter.message_id(), "registering connection");
        self.write(generation, request).await?;
        self.await_response(&mut waiter, Some(generation)).await
    }

    /// Wait for a correlated response, the response timeout, or closure.
    async fn await_response(
        &self,
        waiter: &mut ResponseWaiter<'_>,
        generation: Option<&Generation>,
    ) -> Result<(), SessionError> {
        let message_id = waiter.message_id().to_string();
        let stream_closed = async {
            match generation {
                Some(generation) => generation.closed().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.closure.closed() => Err(self.terminal_error()),
            status = waiter.recv() => match status {
                Some(status) => status.into_result(),
                None => Err(self.terminal_error()),
            },
            _ = stream_closed => Err(SessionError::StreamClosed),
            _ = tokio::time::sleep(self.response_timeout) => {
                Err(SessionError::MessageTimeout { message_id })
            }
        }
    }

    /// Write one envelope onto `generation`'s stream.
    ///
    /// End of stream closes the generation and returns [`SessionError::StreamClosed`];
    /// any other write failure closes the session.
    pub(crate) async fn write(
        &self,
        generation: &Generation,
        request: StreamAgentMessagesRequest,
    ) -> Result<(), SessionError> {
        let message_id = request.message_id.clone();
        let result = generation.sink.lock().await.send(request).await;
        match result {
            Ok(()) => Ok(()),
            Err(WriteError::Closed) => {
                tracing::debug!(
                    generation = generation.id,
                    %message_id,
                    "error sending message, stream closed"
                );
                generation.close();
                Err(SessionError::StreamClosed)
            }
            Err(WriteError::Failed(status)) => {
                tracing::warn!(%message_id, %status, "unexpected send error, closing connection");
                let err = SessionError::UnexpectedTransportError {
                    code: status.code(),
                    message: status.message().to_string(),
                };
                self.close(err.clone());
                Err(err)
            }
        }
    }

    /// Drain queued envelopes onto one generation's stream.
    pub(crate) async fn send_loop(self: Arc<Self>, generation: Arc<Generation>) {
        let mut queue = tokio::select! {
            biased;
            _ = generation.closed() => return,
            queue = self.send_queue.lock() => queue,
        };
        loop {
            tokio::select! {
                biased;
                _ = self.closure.closed() => {
                    generation.sink.lock().await.close_send().await;
                    return;
                }
                _ = generation.closed() => return,
                Some(request) = queue.recv() => {
                    if self.write(&generation, request).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
