// ABOUTME: Constructors and accessors on the generated envelope and body types.
// ABOUTME: Keeps payload wrapping (text bodies, acks, registration) out of callers.

use std::collections::HashMap;

use prost::Message;

use crate::google::cloud::agentcommunication::v1::{
    stream_agent_messages_request, stream_agent_messages_response, MessageBody, MessageResponse,
    RegisterConnection, StreamAgentMessagesRequest, StreamAgentMessagesResponse,
};
use crate::google::protobuf::Any;
use crate::google::rpc::Status;

/// Type URL used by [`MessageBody::text`] payloads.
pub const STRING_VALUE_TYPE_URL: &str = "type.googleapis.com/google.protobuf.StringValue";

impl MessageBody {
    /// Wrap raw bytes tagged with a type URL.
    pub fn from_bytes(type_url: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            labels: HashMap::new(),
            body: Some(Any {
                type_url: type_url.into(),
                value: value.into(),
            }),
        }
    }

    /// Wrap a string as a `google.protobuf.StringValue`.
    pub fn text(value: impl Into<String>) -> Self {
        // prost encodes a bare String with the StringValue wire layout.
        Self::from_bytes(STRING_VALUE_TYPE_URL, value.into().encode_to_vec())
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Decode the payload as text if it carries a `StringValue`.
    pub fn as_text(&self) -> Option<String> {
        let body = self.body.as_ref()?;
        if body.type_url != STRING_VALUE_TYPE_URL {
            return None;
        }
        String::decode(body.value.as_slice()).ok()
    }
}

impl StreamAgentMessagesRequest {
    /// Application message envelope.
    pub fn message(message_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            message_id: message_id.into(),
            r#type: Some(stream_agent_messages_request::Type::MessageBody(body)),
        }
    }

    /// Acknowledgement for an inbound message.
    pub fn acknowledgement(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            r#type: Some(stream_agent_messages_request::Type::MessageResponse(
                MessageResponse::default(),
            )),
        }
    }

    /// Registration envelope, sent once per stream.
    pub fn register(
        message_id: impl Into<String>,
        resource_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            r#type: Some(stream_agent_messages_request::Type::RegisterConnection(
                RegisterConnection {
                    resource_id: resource_id.into(),
                    channel_id: channel_id.into(),
                },
            )),
        }
    }

    pub fn is_acknowledgement(&self) -> bool {
        matches!(
            self.r#type,
            Some(stream_agent_messages_request::Type::MessageResponse(_))
        )
    }

    pub fn is_registration(&self) -> bool {
        matches!(
            self.r#type,
            Some(stream_agent_messages_request::Type::RegisterConnection(_))
        )
    }

    pub fn message_body(&self) -> Option<&MessageBody> {
        match &self.r#type {
            Some(stream_agent_messages_request::Type::MessageBody(body)) => Some(body),
            _ => None,
        }
    }
}

impl StreamAgentMessagesResponse {
    /// Server-initiated application message.
    pub fn message(message_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            message_id: message_id.into(),
            r#type: Some(stream_agent_messages_response::Type::MessageBody(body)),
        }
    }

    /// Reply to an agent envelope. `None` status means OK.
    pub fn response(message_id: impl Into<String>, status: Option<Status>) -> Self {
        Self {
            message_id: message_id.into(),
            r#type: Some(stream_agent_messages_response::Type::MessageResponse(
                MessageResponse { status },
            )),
        }
    }
}
