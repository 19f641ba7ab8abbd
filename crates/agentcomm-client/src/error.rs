// ABOUTME: Error types for the agentcomm-client crate.
// ABOUTME: Classifies session, send, stream, identity and transport failures.

use std::sync::Arc;

use thiserror::Error;
use tonic::Code;

/// Errors surfaced by a [`Session`](crate::Session).
///
/// Cloneable so a single terminal error can be reported to every waiter.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The caller closed the session.
    #[error("connection closed by caller")]
    Closed,

    /// The session is closed; carries the error that closed it.
    #[error("connection closed with err: {0}")]
    ConnectionClosed(#[source] Arc<SessionError>),

    /// The current stream generation ended before the write completed.
    #[error("stream closed")]
    StreamClosed,

    /// No response arrived within the response timeout.
    #[error("timed out waiting for response, MessageID: {message_id:?}")]
    MessageTimeout { message_id: String },

    /// The service is throttling this agent.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The instance identity or token could not be retrieved.
    #[error("error getting instance token: {0}")]
    IdentityUnavailable(String),

    /// The transport reported Unavailable too many times in a row.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The service answered a message with a non-OK status.
    #[error("unexpected status: {code:?}: {message}")]
    UnexpectedStatus { code: Code, message: String },

    /// The transport failed in a way that is not recoverable.
    #[error("unexpected transport error: {code:?}: {message}")]
    UnexpectedTransportError { code: Code, message: String },

    /// A header value could not be encoded as gRPC metadata.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Invalid server address format.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Failed to connect to the server.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Wrap a terminal cause as the error every later operation reports.
    pub fn connection_closed(cause: SessionError) -> Self {
        match cause {
            already @ SessionError::ConnectionClosed(_) => already,
            cause => SessionError::ConnectionClosed(Arc::new(cause)),
        }
    }

    /// The error that closed the session, if this is a closed-session error.
    pub fn close_cause(&self) -> Option<&SessionError> {
        match self {
            SessionError::ConnectionClosed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Whether a caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::MessageTimeout { .. }
                | SessionError::ResourceExhausted(_)
                | SessionError::StreamClosed
        )
    }

    /// Whether the session is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Closed | SessionError::ConnectionClosed(_))
    }
}

impl From<tonic::Status> for SessionError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::ResourceExhausted => SessionError::ResourceExhausted(message),
            Code::Unavailable => SessionError::TransportUnavailable(message),
            code => SessionError::UnexpectedTransportError { code, message },
        }
    }
}

impl From<tonic::transport::Error> for SessionError {
    fn from(err: tonic::transport::Error) -> Self {
        SessionError::ConnectionFailed(err.to_string())
    }
}
