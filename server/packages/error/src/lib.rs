use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidArgument,
    UnknownAgent,
    NotHeadlessCapable,
    NotInstalled,
    NotAuthenticated,
    TrustPromptPending,
    AlreadyConnected,
    ChatCreationFailed,
    SessionNotFound,
    SessionUnavailable,
    UpstreamError,
    StorageError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "urn:agent-relay:error:invalid_argument",
            Self::UnknownAgent => "urn:agent-relay:error:unknown_agent",
            Self::NotHeadlessCapable => "urn:agent-relay:error:not_headless_capable",
            Self::NotInstalled => "urn:agent-relay:error:not_installed",
            Self::NotAuthenticated => "urn:agent-relay:error:not_authenticated",
            Self::TrustPromptPending => "urn:agent-relay:error:trust_prompt_pending",
            Self::AlreadyConnected => "urn:agent-relay:error:already_connected",
            Self::ChatCreationFailed => "urn:agent-relay:error:chat_creation_failed",
            Self::SessionNotFound => "urn:agent-relay:error:session_not_found",
            Self::SessionUnavailable => "urn:agent-relay:error:session_unavailable",
            Self::UpstreamError => "urn:agent-relay:error:upstream_error",
            Self::StorageError => "urn:agent-relay:error:storage_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "Invalid Argument",
            Self::UnknownAgent => "Unknown Agent",
            Self::NotHeadlessCapable => "Not Headless Capable",
            Self::NotInstalled => "Not Installed",
            Self::NotAuthenticated => "Not Authenticated",
            Self::TrustPromptPending => "Trust Prompt Pending",
            Self::AlreadyConnected => "Already Connected",
            Self::ChatCreationFailed => "Chat Creation Failed",
            Self::SessionNotFound => "Session Not Found",
            Self::SessionUnavailable => "Session Unavailable",
            Self::UpstreamError => "Upstream Error",
            Self::StorageError => "Storage Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::UnknownAgent => 400,
            Self::NotHeadlessCapable => 400,
            Self::NotInstalled => 404,
            Self::NotAuthenticated => 401,
            Self::TrustPromptPending => 409,
            Self::AlreadyConnected => 409,
            Self::ChatCreationFailed => 502,
            Self::SessionNotFound => 404,
            Self::SessionUnavailable => 503,
            Self::UpstreamError => 502,
            Self::StorageError => 500,
        }
    }
}

/// RFC 7807 problem body. The `error` extension always carries the
/// human-readable message so clients can read `{error}` directly.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("unknown agent: {agent}")]
    UnknownAgent { agent: String },
    #[error("agent cannot run unattended: {agent}")]
    NotHeadlessCapable { agent: String },
    #[error("agent not installed: {agent}")]
    NotInstalled { agent: String },
    #[error("agent not authenticated: {agent}")]
    NotAuthenticated {
        agent: String,
        message: Option<String>,
    },
    #[error("workspace trust confirmation required for session {session_id}")]
    TrustPromptPending { session_id: String },
    #[error("adapter already connected to session {session_id}")]
    AlreadyConnected { session_id: String },
    #[error("failed to create chat for {agent}: {message}")]
    ChatCreationFailed { agent: String, message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("{message}")]
    SessionUnavailable { session_id: String, message: String },
    #[error("upstream error: {message}")]
    UpstreamError { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidArgument { .. } => ErrorType::InvalidArgument,
            Self::UnknownAgent { .. } => ErrorType::UnknownAgent,
            Self::NotHeadlessCapable { .. } => ErrorType::NotHeadlessCapable,
            Self::NotInstalled { .. } => ErrorType::NotInstalled,
            Self::NotAuthenticated { .. } => ErrorType::NotAuthenticated,
            Self::TrustPromptPending { .. } => ErrorType::TrustPromptPending,
            Self::AlreadyConnected { .. } => ErrorType::AlreadyConnected,
            Self::ChatCreationFailed { .. } => ErrorType::ChatCreationFailed,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SessionUnavailable { .. } => ErrorType::SessionUnavailable,
            Self::UpstreamError { .. } => ErrorType::UpstreamError,
            Self::Storage { .. } => ErrorType::StorageError,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let message = self.to_string();
        let mut problem = ProblemDetails::new(self.error_type(), Some(message.clone()));

        let mut extensions = Map::new();
        extensions.insert("error".to_string(), Value::String(message));
        match self {
            Self::UnknownAgent { agent }
            | Self::NotHeadlessCapable { agent }
            | Self::NotInstalled { agent }
            | Self::ChatCreationFailed { agent, .. } => {
                extensions.insert("agent".to_string(), Value::String(agent.clone()));
            }
            Self::NotAuthenticated { agent, message } => {
                extensions.insert("agent".to_string(), Value::String(agent.clone()));
                if let Some(message) = message {
                    extensions.insert("details".to_string(), Value::String(message.clone()));
                }
            }
            Self::TrustPromptPending { session_id }
            | Self::AlreadyConnected { session_id }
            | Self::SessionNotFound { session_id }
            | Self::SessionUnavailable { session_id, .. } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::InvalidArgument { .. }
            | Self::UpstreamError { .. }
            | Self::Storage { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_error_message_and_status() {
        let err = RelayError::SessionUnavailable {
            session_id: "ses_1".to_string(),
            message: "session is still starting".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:agent-relay:error:session_unavailable");

        let body = serde_json::to_value(&problem).expect("serialize problem");
        assert_eq!(body["error"], "session is still starting");
        assert_eq!(body["sessionId"], "ses_1");
    }

    #[test]
    fn launch_errors_map_to_client_statuses() {
        let cases = [
            (RelayError::invalid_argument("bad dir"), 400),
            (
                RelayError::UnknownAgent {
                    agent: "nope".to_string(),
                },
                400,
            ),
            (
                RelayError::NotHeadlessCapable {
                    agent: "gemini".to_string(),
                },
                400,
            ),
            (
                RelayError::NotInstalled {
                    agent: "opencode".to_string(),
                },
                404,
            ),
            (
                RelayError::TrustPromptPending {
                    session_id: "chat".to_string(),
                },
                409,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.error_type().status_code(), status, "{err}");
        }
    }
}
