use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

mod merge;

pub use merge::{merge_message, merge_parts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    #[serde(alias = "assistant")]
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    ToolCall,
    ToolResult,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessagePart {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PartKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessagePart {
    pub fn text(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PartKind::Text,
            content: content.into(),
            tool_name: None,
            metadata: None,
        }
    }

    pub fn reasoning(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Reasoning,
            ..Self::text(id, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: MessageRole) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
            timestamp: None,
            model: None,
        }
    }

    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Concatenated content of every text part.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.kind == PartKind::Text)
            .map(|part| part.content.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Error,
}

/// One event on a session's canonical stream. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    SessionInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    AgentMessageChunk {
        text: String,
    },
    AgentThoughtChunk {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    Done {
        stop_reason: StopReason,
        #[serde(default)]
        text: String,
    },
    TrustPrompt {
        session_id: String,
        message: String,
    },
    Error {
        message: String,
    },
    Debug {
        stream: String,
        line: String,
    },
}

impl SessionUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionUpdate::SessionInfo { .. } => "session_info",
            SessionUpdate::AgentMessageChunk { .. } => "agent_message_chunk",
            SessionUpdate::AgentThoughtChunk { .. } => "agent_thought_chunk",
            SessionUpdate::ToolCall { .. } => "tool_call",
            SessionUpdate::Done { .. } => "done",
            SessionUpdate::TrustPrompt { .. } => "trust_prompt",
            SessionUpdate::Error { .. } => "error",
            SessionUpdate::Debug { .. } => "debug",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, SessionUpdate::Done { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    pub stop_reason: StopReason,
    pub text: String,
}
