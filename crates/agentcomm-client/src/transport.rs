// ABOUTME: Transport seam consumed by the session: open a bidi stream, or make one unary call.
// ABOUTME: GrpcTransport implements it over tonic; tests substitute an in-memory transport.

use std::time::Duration;

use agentcomm_proto::{
    AgentCommunicationClient, SendAgentMessageRequest, SendAgentMessageResponse,
    StreamAgentMessagesRequest, StreamAgentMessagesResponse,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::Channel;

use crate::error::SessionError;
use crate::stream::{OutboundStream, StreamReceiver, StreamSender, WriteError};

/// Header carrying the bearer token.
pub const AUTHENTICATION_HEADER: &str = "authentication";
/// Header carrying the agent resource id.
pub const RESOURCE_ID_HEADER: &str = "agent-communication-resource-id";
/// Header carrying the channel id.
pub const CHANNEL_ID_HEADER: &str = "agent-communication-channel-id";

/// Identifying headers attached to every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub token: String,
    pub resource_id: String,
    pub channel_id: String,
}

impl StreamMetadata {
    /// Header name/value pairs in wire form.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (AUTHENTICATION_HEADER, format!("Bearer {}", self.token)),
            (RESOURCE_ID_HEADER, self.resource_id.clone()),
            (CHANNEL_ID_HEADER, self.channel_id.clone()),
        ]
    }

    /// Insert the headers into a request's metadata.
    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<(), SessionError> {
        for (key, value) in self.headers() {
            let value: MetadataValue<_> = value
                .parse()
                .map_err(|_| SessionError::InvalidMetadata(format!("value for {}", key)))?;
            metadata.insert(key, value);
        }
        Ok(())
    }
}

/// Write half of one stream generation.
#[async_trait]
pub trait MessageSink: Send {
    /// Write one envelope.
    async fn send(&mut self, request: StreamAgentMessagesRequest) -> Result<(), WriteError>;

    /// Half-close the stream. Later sends report [`WriteError::Closed`].
    async fn close_send(&mut self);
}

/// Read half of one stream generation.
#[async_trait]
pub trait MessageSource: Send {
    /// Read the next envelope. `Ok(None)` is a clean end of stream.
    async fn recv(&mut self) -> Result<Option<StreamAgentMessagesResponse>, tonic::Status>;
}

/// An opened bidirectional stream.
pub struct StreamHandle {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

/// The RPC surface a session needs.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the message stream. Errors opening are reported here, errors
    /// after opening surface through the returned source.
    async fn open_stream(
        &self,
        metadata: &StreamMetadata,
        deadline: Duration,
    ) -> Result<StreamHandle, SessionError>;

    /// Make a single unary send.
    async fn send_agent_message(
        &self,
        metadata: &StreamMetadata,
        request: SendAgentMessageRequest,
    ) -> Result<SendAgentMessageResponse, tonic::Status>;
}

/// [`Transport`] over a tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: AgentCommunicationClient<Channel>,
}

impl GrpcTransport {
    pub fn new(channel: Channel) -> Self {
        let client =
            AgentCommunicationClient::new(channel).max_decoding_message_size(i32::MAX as usize);
        Self { client }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn open_stream(
        &self,
        metadata: &StreamMetadata,
        deadline: Duration,
    ) -> Result<StreamHandle, SessionError> {
        let OutboundStream { sender, stream } = OutboundStream::with_default_buffer();
        let mut request = tonic::Request::new(stream);
        metadata.apply(request.metadata_mut())?;
        request.set_timeout(deadline);

        // The call resolves once the server sends headers, which may wait for
        // our first envelope, so it is driven by the first read instead.
        let mut client = self.client.clone();
        let call: BoxFuture<'static, _> = Box::pin(async move {
            client
                .stream_agent_messages(request)
                .await
                .map(|response| StreamReceiver::new(response.into_inner()))
        });

        Ok(StreamHandle {
            sink: Box::new(GrpcSink {
                sender: Some(sender),
            }),
            source: Box::new(GrpcSource::Connecting(call)),
        })
    }

    async fn send_agent_message(
        &self,
        metadata: &StreamMetadata,
        request: SendAgentMessageRequest,
    ) -> Result<SendAgentMessageResponse, tonic::Status> {
        let mut request = tonic::Request::new(request);
        metadata
            .apply(request.metadata_mut())
            .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
        let mut client = self.client.clone();
        Ok(client.send_agent_message(request).await?.into_inner())
    }
}

struct GrpcSink {
    sender: Option<StreamSender<StreamAgentMessagesRequest>>,
}

#[async_trait]
impl MessageSink for GrpcSink {
    async fn send(&mut self, request: StreamAgentMessagesRequest) -> Result<(), WriteError> {
        match &self.sender {
            Some(sender) => sender.send(request).await,
            None => Err(WriteError::Closed),
        }
    }

    async fn close_send(&mut self) {
        self.sender.take();
    }
}

type PendingCall =
    BoxFuture<'static, Result<StreamReceiver<StreamAgentMessagesResponse>, tonic::Status>>;

enum GrpcSource {
    Connecting(PendingCall),
    Open(StreamReceiver<StreamAgentMessagesResponse>),
    Failed,
}

#[async_trait]
impl MessageSource for GrpcSource {
    async fn recv(&mut self) -> Result<Option<StreamAgentMessagesResponse>, tonic::Status> {
        loop {
            match self {
                GrpcSource::Open(receiver) => return receiver.recv().await,
                GrpcSource::Connecting(call) => match call.await {
                    Ok(receiver) => *self = GrpcSource::Open(receiver),
                    Err(status) => {
                        *self = GrpcSource::Failed;
                        return Err(status);
                    }
                },
                GrpcSource::Failed => return Ok(None),
            }
        }
    }
}
