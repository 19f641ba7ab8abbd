// ABOUTME: Re-exports generated protobuf types and the gRPC client for the agent communication protocol.
// ABOUTME: Single source of truth for google.cloud.agentcommunication.v1 messages.

#![allow(clippy::derive_partial_eq_without_eq)]

/// Generated protobuf types, nested by proto package.
pub mod google {
    pub mod protobuf {
        tonic::include_proto!("google.protobuf");
    }

    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }

    pub mod cloud {
        pub mod agentcommunication {
            pub mod v1 {
                tonic::include_proto!("google.cloud.agentcommunication.v1");
            }
        }
    }
}

mod envelope;

// Re-export commonly used types at crate root for convenience
pub use envelope::STRING_VALUE_TYPE_URL;
pub use google::cloud::agentcommunication::v1::*;
pub use google::protobuf::Any;
pub use google::rpc::Status;

// Re-export client types under a client module
pub mod client {
    pub use super::google::cloud::agentcommunication::v1::agent_communication_client::AgentCommunicationClient;
}

pub use client::AgentCommunicationClient;
