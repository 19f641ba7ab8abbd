// ABOUTME: Client session for the agent communication service: one long-lived bidi stream per agent.
// ABOUTME: Provides acknowledged send and receive, response correlation, and automatic reconnection.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;

mod establish;
mod recv;
mod send;

// Session
pub use config::{KeepAliveSettings, SessionConfig, DEFAULT_RESPONSE_TIMEOUT};
pub use establish::STREAM_DEADLINE;
pub use session::{Session, SessionBuilder};

// Error types
pub use error::SessionError;

// Transport and identity seams
pub use identity::{IdentityProvider, InstanceIdentity, MetadataServer, TOKEN_AUDIENCE};
pub use stream::{OutboundStream, StreamReceiver, StreamSender, WriteError};
pub use transport::{
    GrpcTransport, MessageSink, MessageSource, StreamHandle, StreamMetadata, Transport,
};

// Channel creation
pub use channel::{create_channel, ChannelConfig, KeepAliveConfig};

// Retry policy
pub use backoff::{ReconnectBackoff, ReconnectDecision, StreamEnd};

// Re-export proto types for convenience
pub use agentcomm_proto;
pub use agentcomm_proto::MessageBody;
