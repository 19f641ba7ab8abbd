// ABOUTME: In-memory transport and identity used by the session integration tests.
// ABOUTME: Each opened stream is handed to the test, which plays the service side.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentcomm_client::agentcomm_proto::{
    stream_agent_messages_request, MessageBody, SendAgentMessageRequest, SendAgentMessageResponse,
    Status, StreamAgentMessagesRequest, StreamAgentMessagesResponse,
};
use agentcomm_client::{
    IdentityProvider, InstanceIdentity, MessageSink, MessageSource, Session, SessionConfig,
    SessionError, StreamHandle, StreamMetadata, Transport, WriteError,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const RESOURCE_ID: &str = "projects/123/zones/us-central1-a/instances/456";
pub const CHANNEL_ID: &str = "test-channel";

pub fn config() -> SessionConfig {
    SessionConfig::new(CHANNEL_ID)
}

/// Identity that never touches the network.
#[derive(Debug, Clone, Default)]
pub struct FakeIdentity {
    fail: bool,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn token(&self, _audience: &str) -> Result<String, SessionError> {
        if self.fail {
            return Err(SessionError::IdentityUnavailable("metadata server down".to_string()));
        }
        Ok("test-token".to_string())
    }

    async fn instance(&self) -> Result<InstanceIdentity, SessionError> {
        if self.fail {
            return Err(SessionError::IdentityUnavailable("metadata server down".to_string()));
        }
        Ok(InstanceIdentity {
            zone: "us-central1-a".to_string(),
            project_number: "123".to_string(),
            instance_id: "456".to_string(),
        })
    }
}

struct Shared {
    opened: mpsc::UnboundedSender<FakeStream>,
    fail_acks: AtomicBool,
    fail_writes: AtomicBool,
    released: AtomicBool,
    unary: Mutex<Vec<SendAgentMessageRequest>>,
}

/// Marks the transport released once every clone of it is gone.
struct Lease(Arc<Shared>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
    }
}

/// Transport whose streams are driven by the test through [`FakeServer`].
#[derive(Clone)]
pub struct FakeTransport {
    shared: Arc<Shared>,
    _lease: Arc<Lease>,
}

impl FakeTransport {
    pub fn new() -> (Self, FakeServer) {
        let (opened, streams) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            opened,
            fail_acks: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            released: AtomicBool::new(false),
            unary: Mutex::new(Vec::new()),
        });
        (
            Self {
                shared: shared.clone(),
                _lease: Arc::new(Lease(shared.clone())),
            },
            FakeServer { streams, shared },
        )
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_stream(
        &self,
        metadata: &StreamMetadata,
        _deadline: Duration,
    ) -> Result<StreamHandle, SessionError> {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (responses, response_rx) = mpsc::unbounded_channel();
        let stream = FakeStream {
            metadata: metadata.clone(),
            opened_at: Instant::now(),
            requests,
            responses: Some(responses),
        };
        self.shared
            .opened
            .send(stream)
            .map_err(|_| SessionError::ConnectionFailed("server gone".to_string()))?;

        Ok(StreamHandle {
            sink: Box::new(FakeSink {
                requests: request_tx,
                shared: self.shared.clone(),
            }),
            source: Box::new(FakeSource {
                responses: response_rx,
            }),
        })
    }

    async fn send_agent_message(
        &self,
        metadata: &StreamMetadata,
        request: SendAgentMessageRequest,
    ) -> Result<SendAgentMessageResponse, tonic::Status> {
        assert_eq!(metadata.token, "test-token");
        let echo = request.message_body.clone();
        self.shared
            .unary
            .lock()
            .unwrap()
            .push(request);
        Ok(SendAgentMessageResponse { message_body: echo })
    }
}

struct FakeSink {
    requests: mpsc::UnboundedSender<StreamAgentMessagesRequest>,
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageSink for FakeSink {
    async fn send(&mut self, request: StreamAgentMessagesRequest) -> Result<(), WriteError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(WriteError::Failed(tonic::Status::internal("broken pipe")));
        }
        if request.is_acknowledgement() && self.shared.fail_acks.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        self.requests.send(request).map_err(|_| WriteError::Closed)
    }

    async fn close_send(&mut self) {}
}

struct FakeSource {
    responses: mpsc::UnboundedReceiver<Result<StreamAgentMessagesResponse, tonic::Status>>,
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn recv(&mut self) -> Result<Option<StreamAgentMessagesResponse>, tonic::Status> {
        match self.responses.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

/// The service side of a [`FakeTransport`].
pub struct FakeServer {
    streams: mpsc::UnboundedReceiver<FakeStream>,
    shared: Arc<Shared>,
}

impl FakeServer {
    /// The next stream the session opens.
    pub async fn next_stream(&mut self) -> FakeStream {
        tokio::time::timeout(Duration::from_secs(300), self.streams.recv())
            .await
            .expect("no stream opened")
            .expect("transport dropped")
    }

    /// A stream opened but not yet taken by the test.
    pub fn try_next_stream(&mut self) -> Option<FakeStream> {
        self.streams.try_recv().ok()
    }

    /// Make acknowledgement writes report end of stream.
    pub fn fail_acks(&self, fail: bool) {
        self.shared.fail_acks.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail with a non end-of-stream error.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether the session has dropped its transport.
    pub fn transport_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn unary_requests(&self) -> Vec<SendAgentMessageRequest> {
        self.shared.unary.lock().unwrap().clone()
    }
}

/// One opened stream, seen from the service.
pub struct FakeStream {
    pub metadata: StreamMetadata,
    pub opened_at: Instant,
    requests: mpsc::UnboundedReceiver<StreamAgentMessagesRequest>,
    responses: Option<mpsc::UnboundedSender<Result<StreamAgentMessagesResponse, tonic::Status>>>,
}

impl FakeStream {
    /// The next envelope the agent wrote.
    pub async fn next_request(&mut self) -> StreamAgentMessagesRequest {
        tokio::time::timeout(Duration::from_secs(300), self.requests.recv())
            .await
            .expect("no request written")
            .expect("stream dropped")
    }

    /// Envelope already written, if any.
    pub fn try_request(&mut self) -> Option<StreamAgentMessagesRequest> {
        self.requests.try_recv().ok()
    }

    /// Wait until the agent drops its end of the stream, discarding envelopes.
    pub async fn wait_closed(&mut self) {
        while self.requests.recv().await.is_some() {}
    }

    /// Read the registration envelope and return its id without answering.
    pub async fn expect_registration(&mut self) -> String {
        let request = self.next_request().await;
        match &request.r#type {
            Some(stream_agent_messages_request::Type::RegisterConnection(register)) => {
                assert_eq!(register.resource_id, RESOURCE_ID);
                assert_eq!(register.channel_id, CHANNEL_ID);
            }
            other => panic!("expected registration, got {:?}", other),
        }
        request.message_id
    }

    /// Read the registration envelope and answer OK.
    pub async fn accept_registration(&mut self) {
        let id = self.expect_registration().await;
        self.respond(id, None);
    }

    /// Read the next application message and return its id and body.
    pub async fn expect_message(&mut self) -> (String, MessageBody) {
        let request = self.next_request().await;
        match request.r#type {
            Some(stream_agent_messages_request::Type::MessageBody(body)) => {
                (request.message_id, body)
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    /// Read the next acknowledgement and return the id it acknowledges.
    pub async fn expect_ack(&mut self) -> String {
        let request = self.next_request().await;
        assert!(
            request.is_acknowledgement(),
            "expected acknowledgement, got {:?}",
            request
        );
        request.message_id
    }

    pub fn respond(&self, message_id: impl Into<String>, status: Option<Status>) {
        self.push(Ok(StreamAgentMessagesResponse::response(message_id, status)));
    }

    pub fn respond_with(&self, message_id: impl Into<String>, code: tonic::Code, message: &str) {
        self.respond(
            message_id,
            Some(Status {
                code: code as i32,
                message: message.to_string(),
                details: Vec::new(),
            }),
        );
    }

    pub fn deliver(&self, message_id: impl Into<String>, body: MessageBody) {
        self.push(Ok(StreamAgentMessagesResponse::message(message_id, body)));
    }

    /// End the stream with an error status.
    pub fn fail(&self, status: tonic::Status) {
        self.push(Err(status));
    }

    /// End the stream cleanly.
    pub fn end(&mut self) {
        self.responses.take();
    }

    fn push(&self, item: Result<StreamAgentMessagesResponse, tonic::Status>) {
        if let Some(responses) = &self.responses {
            // The session may already have stopped reading this stream.
            let _ = responses.send(item);
        }
    }
}

/// Connect a session over a fresh fake transport and accept its registration.
pub async fn connected() -> (Session, FakeServer, FakeStream) {
    connected_with(config()).await
}

pub async fn connected_with(config: SessionConfig) -> (Session, FakeServer, FakeStream) {
    let (transport, mut server) = FakeTransport::new();
    let connecting = tokio::spawn(
        Session::builder(config)
            .transport(transport)
            .identity(FakeIdentity::new())
            .connect(),
    );
    let mut stream = server.next_stream().await;
    stream.accept_registration().await;
    let session = connecting
        .await
        .expect("connect task panicked")
        .expect("connect failed");
    (session, server, stream)
}
