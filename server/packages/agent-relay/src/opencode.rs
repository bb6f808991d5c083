//! Translation between OpenCode's native API shapes and the canonical
//! message/event protocol.

use std::collections::HashMap;

use agent_relay_protocol::{
    Message, MessagePart, MessageRole, PartKind, SessionUpdate, StopReason, ToolCallStatus,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A config PATCH body rewritten for OpenCode, plus the model it selects.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPatch {
    pub body: Value,
    pub model: Option<String>,
}

/// `{"model": {"providerID", "modelID"}}` and `{"provider", "model"}` both
/// collapse to `{"model": "provider/model"}`.
pub fn translate_config_patch(body: Value) -> ConfigPatch {
    let Value::Object(mut fields) = body else {
        return ConfigPatch { body, model: None };
    };

    let model = match fields.get("model") {
        Some(Value::Object(structured)) => {
            let provider = str_field(structured, &["providerID", "providerId", "provider"]);
            str_field(structured, &["modelID", "modelId", "id"])
                .map(|model| join_model(provider.as_deref(), &model))
        }
        Some(Value::String(model)) => {
            let model = model.clone();
            let provider = match fields.get("provider") {
                Some(Value::String(provider)) => Some(provider.clone()),
                _ => None,
            };
            if provider.is_some() {
                fields.remove("provider");
            }
            Some(join_model(provider.as_deref(), &model))
        }
        _ => None,
    };
    if let Some(model) = &model {
        fields.insert("model".to_string(), Value::String(model.clone()));
    }
    ConfigPatch {
        body: Value::Object(fields),
        model,
    }
}

fn join_model(provider: Option<&str>, model: &str) -> String {
    match provider.filter(|provider| !provider.is_empty()) {
        Some(provider) => format!("{provider}/{model}"),
        None => model.to_string(),
    }
}

fn str_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct NativeMessage {
    info: NativeMessageInfo,
    #[serde(default)]
    parts: Vec<NativePart>,
}

#[derive(Debug, Deserialize)]
struct NativeMessageInfo {
    id: String,
    role: String,
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(default)]
    time: Option<NativeTime>,
    #[serde(rename = "providerID", default)]
    provider_id: Option<String>,
    #[serde(rename = "modelID", default)]
    model_id: Option<String>,
}

impl NativeMessageInfo {
    fn role(&self) -> MessageRole {
        if self.role == "user" {
            MessageRole::User
        } else {
            MessageRole::Agent
        }
    }

    fn model(&self) -> Option<String> {
        self.model_id
            .as_deref()
            .filter(|model| !model.is_empty())
            .map(|model| join_model(self.provider_id.as_deref(), model))
    }
}

#[derive(Debug, Deserialize)]
struct NativeTime {
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum NativePart {
    Text {
        id: String,
        #[serde(rename = "messageID", default)]
        message_id: Option<String>,
        #[serde(default)]
        text: String,
    },
    Reasoning {
        id: String,
        #[serde(rename = "messageID", default)]
        message_id: Option<String>,
        #[serde(default)]
        text: String,
    },
    Tool {
        id: String,
        #[serde(rename = "messageID", default)]
        message_id: Option<String>,
        #[serde(rename = "callID", default)]
        call_id: Option<String>,
        #[serde(default)]
        tool: String,
        #[serde(default)]
        state: NativeToolState,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct NativeToolState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl NativeToolState {
    fn status(&self) -> ToolCallStatus {
        match self.status.as_deref() {
            Some("running") => ToolCallStatus::Running,
            Some("completed") => ToolCallStatus::Completed,
            Some("error") => ToolCallStatus::Failed,
            _ => ToolCallStatus::Pending,
        }
    }

    fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or("pending")
    }
}

/// Map `GET /session/:id/message` output into canonical messages. Entries
/// that do not look like OpenCode messages are skipped.
pub fn translate_messages(native: Value) -> Vec<Message> {
    let Value::Array(items) = native else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<NativeMessage>(item).ok())
        .map(|native| {
            let mut message = Message::new(native.info.id.clone(), native.info.role())
                .with_model(native.info.model());
            message.timestamp = native.info.time.as_ref().and_then(|time| time.created);
            message.parts = native.parts.into_iter().flat_map(translate_part).collect();
            message
        })
        .collect()
}

fn translate_part(part: NativePart) -> Vec<MessagePart> {
    match part {
        NativePart::Text { id, text, .. } => vec![MessagePart::text(id, text)],
        NativePart::Reasoning { id, text, .. } => vec![MessagePart::reasoning(id, text)],
        NativePart::Tool {
            id,
            call_id,
            tool,
            state,
            ..
        } => {
            let content = state
                .input
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_default();
            let mut parts = vec![MessagePart {
                id: id.clone(),
                kind: PartKind::ToolCall,
                content,
                tool_name: Some(tool.clone()),
                metadata: Some(json!({"callId": call_id, "status": state.status_label()})),
            }];
            let result = match (&state.output, &state.error) {
                (Some(output), _) => Some((output.clone(), false)),
                (None, Some(error)) => Some((error.clone(), true)),
                (None, None) => None,
            };
            if let Some((content, is_error)) = result {
                parts.push(MessagePart {
                    id: format!("{id}:result"),
                    kind: PartKind::ToolResult,
                    content,
                    tool_name: Some(tool),
                    metadata: Some(json!({
                        "callId": call_id,
                        "status": state.status_label(),
                        "isError": is_error,
                    })),
                });
            }
            parts
        }
        NativePart::Other => Vec::new(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum NativeEvent {
    #[serde(rename = "message.updated")]
    MessageUpdated { properties: MessageUpdatedProps },
    #[serde(rename = "message.part.updated")]
    PartUpdated { properties: PartUpdatedProps },
    #[serde(rename = "session.idle")]
    SessionIdle,
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(default)]
        properties: SessionErrorProps,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageUpdatedProps {
    info: NativeMessageInfo,
}

#[derive(Debug, Deserialize)]
struct PartUpdatedProps {
    part: NativePart,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionErrorProps {
    #[serde(default)]
    error: Option<Value>,
}

/// Rewrites OpenCode `/event` payloads into canonical updates. Holds the
/// per-stream state needed to turn part snapshots into deltas.
#[derive(Debug, Default)]
pub struct OpencodeEventTranslator {
    roles: HashMap<String, MessageRole>,
    seen_text: HashMap<String, usize>,
    tool_status: HashMap<String, ToolCallStatus>,
    turn_text: String,
    model: Option<String>,
}

impl OpencodeEventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate_data(&mut self, data: &str) -> Vec<SessionUpdate> {
        match serde_json::from_str::<NativeEvent>(data) {
            Ok(event) => self.translate(event),
            Err(err) => {
                tracing::debug!(error = %err, "dropping unrecognized opencode event");
                Vec::new()
            }
        }
    }

    fn translate(&mut self, event: NativeEvent) -> Vec<SessionUpdate> {
        match event {
            NativeEvent::MessageUpdated { properties } => {
                let info = properties.info;
                let role = info.role();
                self.roles.insert(info.id.clone(), role);
                let model = info.model();
                if role == MessageRole::Agent && model.is_some() && model != self.model {
                    self.model = model.clone();
                    return vec![SessionUpdate::SessionInfo {
                        session_id: info.session_id,
                        model,
                    }];
                }
                Vec::new()
            }
            NativeEvent::PartUpdated { properties } => self.translate_part(properties),
            NativeEvent::SessionIdle => vec![SessionUpdate::Done {
                stop_reason: StopReason::EndTurn,
                text: std::mem::take(&mut self.turn_text),
            }],
            NativeEvent::SessionError { properties } => vec![SessionUpdate::Error {
                message: error_message(properties.error.as_ref()),
            }],
            NativeEvent::Other => Vec::new(),
        }
    }

    fn translate_part(&mut self, properties: PartUpdatedProps) -> Vec<SessionUpdate> {
        let is_user = |message_id: &Option<String>, roles: &HashMap<String, MessageRole>| {
            message_id
                .as_ref()
                .and_then(|id| roles.get(id))
                .is_some_and(|role| *role == MessageRole::User)
        };
        match properties.part {
            NativePart::Text {
                id,
                message_id,
                text,
            } => {
                if is_user(&message_id, &self.roles) {
                    return Vec::new();
                }
                match self.new_text(&id, &text, properties.delta) {
                    Some(delta) => {
                        self.turn_text.push_str(&delta);
                        vec![SessionUpdate::AgentMessageChunk { text: delta }]
                    }
                    None => Vec::new(),
                }
            }
            NativePart::Reasoning {
                id,
                message_id,
                text,
            } => {
                if is_user(&message_id, &self.roles) {
                    return Vec::new();
                }
                self.new_text(&id, &text, properties.delta)
                    .map(|delta| vec![SessionUpdate::AgentThoughtChunk { text: delta }])
                    .unwrap_or_default()
            }
            NativePart::Tool {
                id,
                message_id,
                call_id,
                tool,
                state,
            } => {
                if is_user(&message_id, &self.roles) {
                    return Vec::new();
                }
                let status = state.status();
                if self.tool_status.insert(id.clone(), status) == Some(status) {
                    return Vec::new();
                }
                let output = match (state.output, state.error) {
                    (Some(output), _) => Some(Value::String(output)),
                    (None, Some(error)) => Some(json!({ "error": error })),
                    (None, None) => None,
                };
                vec![SessionUpdate::ToolCall {
                    tool_call_id: call_id.unwrap_or(id),
                    name: tool,
                    status,
                    input: state.input,
                    output,
                }]
            }
            NativePart::Other => Vec::new(),
        }
    }

    /// New text for a part: the explicit delta if present, otherwise the
    /// unseen suffix of the snapshot.
    fn new_text(&mut self, part_id: &str, snapshot: &str, delta: Option<String>) -> Option<String> {
        let seen = self.seen_text.get(part_id).copied().unwrap_or(0);
        let fresh = match delta.filter(|delta| !delta.is_empty()) {
            Some(delta) => delta,
            None => snapshot.get(seen..).unwrap_or_default().to_string(),
        };
        self.seen_text
            .insert(part_id.to_string(), snapshot.len().max(seen));
        (!fresh.is_empty()).then_some(fresh)
    }
}

fn error_message(error: Option<&Value>) -> String {
    let Some(error) = error else {
        return "session error".to_string();
    };
    error
        .pointer("/data/message")
        .or_else(|| error.get("message"))
        .or_else(|| error.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Incremental `text/event-stream` parser yielding each event's data.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data).join("\n"));
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }

    /// Data of a final event the stream ended without terminating.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        (!self.data.is_empty()).then(|| std::mem::take(&mut self.data).join("\n"))
    }
}
