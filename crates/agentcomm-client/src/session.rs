// ABOUTME: Public Session handle and the shared state its background workers run against.
// ABOUTME: Construction resolves identity, opens the first stream, and registers before returning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agentcomm_proto::{MessageBody, SendAgentMessageRequest, StreamAgentMessagesRequest};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{Instrument, Span};

use crate::backoff::ReconnectBackoff;
use crate::channel::create_channel;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::identity::{IdentityProvider, MetadataServer};
use crate::lifecycle::Closure;
use crate::registry::PendingResponses;
use crate::transport::{GrpcTransport, Transport};

/// Admission ticket handed to the active stream generation.
pub(crate) type Ticket = oneshot::Sender<()>;

/// State shared by the session handle and every stream generation's workers.
pub(crate) struct Inner {
    /// Emptied on close so the channel is released even while handles live.
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) resource_id: String,
    pub(crate) channel_id: String,
    pub(crate) response_timeout: Duration,
    pub(crate) pending: PendingResponses,
    pub(crate) closure: Closure,
    /// Envelopes waiting for the send loop.
    pub(crate) sends: mpsc::Sender<StreamAgentMessagesRequest>,
    pub(crate) send_queue: Mutex<mpsc::Receiver<StreamAgentMessagesRequest>>,
    pub(crate) admissions: mpsc::Sender<Ticket>,
    pub(crate) admission_queue: Mutex<mpsc::Receiver<Ticket>>,
    /// Acknowledged inbound messages waiting for `receive`.
    pub(crate) inbound: mpsc::Sender<MessageBody>,
    inbound_queue: Mutex<mpsc::Receiver<MessageBody>>,
    generations: AtomicU64,
    pub(crate) span: Span,
}

impl Inner {
    fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        resource_id: String,
        config: &SessionConfig,
        span: Span,
    ) -> Self {
        let (sends, send_queue) = mpsc::channel(1);
        let (admissions, admission_queue) = mpsc::channel(1);
        let (inbound, inbound_queue) = mpsc::channel(1);
        Self {
            transport: StdMutex::new(Some(transport)),
            identity,
            resource_id,
            channel_id: config.channel_id.clone(),
            response_timeout: config.response_timeout(),
            pending: PendingResponses::new(),
            closure: Closure::new(),
            sends,
            send_queue: Mutex::new(send_queue),
            admissions,
            admission_queue: Mutex::new(admission_queue),
            inbound,
            inbound_queue: Mutex::new(inbound_queue),
            generations: AtomicU64::new(0),
            span,
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Close the session. Only the first call has any effect.
    pub(crate) fn close(&self, cause: SessionError) {
        let reason = cause.to_string();
        if self.closure.close(cause) {
            let abandoned = self.pending.cancel_all();
            let released = self.take_transport();
            tracing::info!(error = %reason, abandoned, "closing connection");
            drop(released);
        }
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        match self.transport.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// The transport, or the terminal error once the session has closed.
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        let slot = match self.transport.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone().ok_or_else(|| self.terminal_error())
    }

    pub(crate) fn terminal_error(&self) -> SessionError {
        self.closure.terminal_error()
    }

    async fn receive(&self) -> Result<MessageBody, SessionError> {
        let mut queue = tokio::select! {
            biased;
            _ = self.closure.closed() => return Err(self.terminal_error()),
            queue = self.inbound_queue.lock() => queue,
        };
        tokio::select! {
            biased;
            _ = self.closure.closed() => Err(self.terminal_error()),
            body = queue.recv() => body.ok_or_else(|| self.terminal_error()),
        }
    }

    async fn send_unary(&self, body: MessageBody) -> Result<Option<MessageBody>, SessionError> {
        if self.closure.is_closed() {
            return Err(self.terminal_error());
        }
        let metadata = self.stream_metadata().await?;
        let request = SendAgentMessageRequest {
            channel_id: self.channel_id.clone(),
            resource_id: self.resource_id.clone(),
            message_body: Some(body),
        };
        let response = self
            .transport()?
            .send_agent_message(&metadata, request)
            .await?;
        Ok(response.message_body)
    }
}

/// Closes the session when the last handle goes away.
struct CloseOnDrop(Arc<Inner>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close(SessionError::Closed);
    }
}

/// A long-lived message streaming session for one agent resource.
///
/// Cloning is cheap; all clones share the session. Dropping the last clone
/// closes it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
    _guard: Arc<CloseOnDrop>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("resource_id", &self.inner.resource_id)
            .field("channel_id", &self.inner.channel_id)
            .field("closed", &self.inner.closure.is_closed())
            .finish()
    }
}

impl Session {
    /// Connect using the instance metadata server and a gRPC channel.
    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        Self::builder(config).connect().await
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Send a message and wait for the service to acknowledge it.
    ///
    /// Retries on message timeout and ResourceExhausted; if those persist the
    /// last such error is returned and the caller may retry.
    pub async fn send(&self, body: MessageBody) -> Result<(), SessionError> {
        self.inner
            .send(body)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Receive the next message. Already acknowledged to the service.
    ///
    /// Call this continuously: the service disconnects streams whose queued
    /// messages go undrained for more than about 500ms, so hand messages off
    /// and call again promptly.
    pub async fn receive(&self) -> Result<MessageBody, SessionError> {
        self.inner.receive().await
    }

    /// Send one message over the unary RPC, outside the stream.
    pub async fn send_unary(&self, body: MessageBody) -> Result<Option<MessageBody>, SessionError> {
        self.inner
            .send_unary(body)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Close the session. Later calls have no effect.
    pub fn close(&self) {
        self.inner.close(SessionError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closure.is_closed()
    }

    /// The error that closed the session, if it is closed.
    pub fn close_error(&self) -> Option<SessionError> {
        self.inner.closure.cause()
    }

    pub fn resource_id(&self) -> &str {
        &self.inner.resource_id
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }
}

/// Builder for a [`Session`] with custom collaborators.
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    span: Option<Span>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
            identity: None,
            span: None,
        }
    }

    /// Use this transport instead of a gRPC channel.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use this identity source instead of the metadata server.
    pub fn identity(mut self, identity: impl IdentityProvider) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Parent span for everything the session logs.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Resolve identity, open the first stream and register it.
    pub async fn connect(self) -> Result<Session, SessionError> {
        let config = self.config;
        config.validate()?;

        let identity: Arc<dyn IdentityProvider> = match self.identity {
            Some(identity) => identity,
            None => Arc::new(match &config.metadata_host {
                Some(host) => MetadataServer::with_host(host.clone()),
                None => MetadataServer::new(),
            }),
        };
        let instance = identity.instance().await?;
        let resource_id = instance.resource_id();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let location = instance.location(config.regional);
                let channel = create_channel(&config.channel_config(&location)).await?;
                Arc::new(GrpcTransport::new(channel))
            }
        };

        let span = self.span.unwrap_or_else(|| {
            tracing::info_span!(
                "agent_session",
                resource_id = %resource_id,
                channel_id = %config.channel_id
            )
        });

        let inner = Arc::new(Inner::new(transport, identity, resource_id, &config, span));
        let established = inner
            .clone()
            .create_stream(ReconnectBackoff::new())
            .instrument(inner.span.clone())
            .await;
        if let Err(err) = established {
            inner.close(err.clone());
            return Err(err);
        }

        Ok(Session {
            _guard: Arc::new(CloseOnDrop(inner.clone())),
            inner,
        })
    }
}
