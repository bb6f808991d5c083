//! In-process adapter for the Cursor Agent CLI.
//!
//! Each prompt runs `cursor-agent --print --output-format stream-json` in the
//! session's working directory. Its stdout is decoded into canonical
//! [`SessionUpdate`](agent_relay_protocol::SessionUpdate)s and published on a
//! bounded [`UpdateChannel`].

mod adapter;
pub mod channel;
pub mod command;
pub mod stream_json;

use agent_relay_session_store::StoreError;
use thiserror::Error;

pub use adapter::{CursorAdapter, CursorAdapterConfig};
pub use channel::{UpdateChannel, DEFAULT_CHANNEL_CAPACITY};
pub use stream_json::{is_trust_prompt, StreamDecoder, TRUST_SIGNATURE};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("cursor-agent binary not found")]
    AgentNotFound,
    #[error("cursor-agent is not authenticated: {message}")]
    NotAuthenticated { message: String },
    #[error("failed to create chat: {message}")]
    ChatCreationFailed { message: String },
    #[error("adapter already connected to chat {chat_id}")]
    AlreadyConnected { chat_id: String },
    #[error("adapter is not connected")]
    NotConnected,
    #[error("session {actual} does not match connected chat {expected}")]
    SessionMismatch { expected: String, actual: String },
    #[error("workspace trust confirmation required for chat {chat_id}")]
    TrustPromptPending { chat_id: String },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
