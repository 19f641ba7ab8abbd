// ABOUTME: Inbound path: reads one stream generation, acknowledges and delivers messages,
// ABOUTME: routes responses to waiting senders, and drives reconnects when the stream ends.

use std::sync::Arc;

use agentcomm_proto::stream_agent_messages_response::Type;
use agentcomm_proto::{StreamAgentMessagesRequest, StreamAgentMessagesResponse};

use crate::backoff::{ReconnectBackoff, ReconnectDecision, StreamEnd};
use crate::establish::Generation;
use crate::registry::ResponseStatus;
use crate::session::Inner;
use crate::transport::MessageSource;

impl Inner {
    /// Read `generation` until it ends, then reconnect or close the session.
    pub(crate) async fn receive_loop(
        self: Arc<Self>,
        generation: Arc<Generation>,
        mut source: Box<dyn MessageSource>,
        mut backoff: ReconnectBackoff,
    ) {
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.closure.closed() => None,
                next = source.recv() => Some(next),
            };
            match next {
                None => break None,
                Some(Ok(Some(response))) => {
                    backoff.reset();
                    if !self.dispatch(&generation, response).await {
                        break None;
                    }
                }
                Some(Ok(None)) => break Some(StreamEnd::Eof),
                Some(Err(status)) => break Some(StreamEnd::Status(status)),
            }
        };

        generation.close();
        drop(source);

        let Some(end) = end else { return };
        if self.closure.is_closed() {
            return;
        }

        match backoff.on_stream_end(&end) {
            ReconnectDecision::Fatal(err) => {
                tracing::warn!(error = %err, "stream ended, not reconnecting");
                self.close(err);
            }
            ReconnectDecision::Recreate { delay } => {
                match &end {
                    StreamEnd::Eof => tracing::debug!("stream closed by server, reconnecting"),
                    StreamEnd::Status(status) => tracing::info!(
                        code = ?status.code(),
                        message = %status.message(),
                        delay_ms = delay.as_millis() as u64,
                        "stream ended, reconnecting"
                    ),
                }
                tokio::select! {
                    biased;
                    _ = self.closure.closed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(err) = self.clone().create_stream(backoff).await {
                    tracing::warn!(error = %err, "error creating new stream");
                    self.close(err);
                }
            }
        }
    }

    /// Handle one inbound envelope. Returns false once the session is closed.
    async fn dispatch(&self, generation: &Generation, response: StreamAgentMessagesResponse) -> bool {
        let StreamAgentMessagesResponse { message_id, r#type } = response;
        match r#type {
            Some(Type::MessageBody(body)) => {
                if self.closure.is_closed() {
                    return false;
                }
                let ack = StreamAgentMessagesRequest::acknowledgement(message_id.clone());
                if let Err(err) = self.write(generation, ack).await {
                    tracing::warn!(%message_id, error = %err, "failed to acknowledge message, dropping it");
                    return true;
                }
                tokio::select! {
                    biased;
                    _ = self.closure.closed() => false,
                    delivered = self.inbound.send(body) => delivered.is_ok(),
                }
            }
            Some(Type::MessageResponse(response)) => {
                let status = ResponseStatus::from_proto(response.status);
                if !self.pending.resolve(&message_id, status) {
                    tracing::debug!(%message_id, "response with no waiting sender");
                }
                true
            }
            None => {
                tracing::debug!(%message_id, "ignoring empty stream message");
                true
            }
        }
    }
}
