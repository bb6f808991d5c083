use agent_relay_protocol::{SessionUpdate, StopReason, ToolCallStatus};
use serde::Deserialize;
use serde_json::Value;

/// Banner the CLI prints when the workspace has not been trusted yet.
pub const TRUST_SIGNATURE: &str = "Workspace Trust Required";

pub fn is_trust_prompt(line: &str) -> bool {
    line.contains(TRUST_SIGNATURE)
}

/// One line of `--output-format stream-json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    Thinking {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    ToolCall {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        tool_call: Option<Value>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl AssistantMessage {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind.as_deref().unwrap_or("text") == "text")
            .filter_map(|block| block.text.as_deref())
            .collect()
    }
}

/// Turns stream-json lines of one prompt into canonical updates.
///
/// Timestamped assistant lines are partial deltas. The untimestamped line
/// that repeats the whole reply is swallowed, and only used as the turn text
/// when no delta arrived.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    model: Option<String>,
    streamed: String,
    snapshot: Option<String>,
    result: Option<(StopReason, String)>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Malformed or unknown lines yield nothing.
    pub fn decode_line(&mut self, line: &str) -> Vec<SessionUpdate> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<StreamLine>(trimmed) {
            Ok(parsed) => self.decode(parsed),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed stream-json line");
                Vec::new()
            }
        }
    }

    pub fn decode(&mut self, line: StreamLine) -> Vec<SessionUpdate> {
        match line {
            StreamLine::System {
                subtype,
                model,
                session_id,
            } => {
                if subtype.as_deref().is_some_and(|s| s != "init") {
                    return Vec::new();
                }
                if model.is_some() {
                    self.model = model.clone();
                }
                vec![SessionUpdate::SessionInfo { session_id, model }]
            }
            StreamLine::Assistant {
                message,
                timestamp_ms: Some(_),
            } => {
                let text = message.text();
                if text.is_empty() {
                    return Vec::new();
                }
                self.streamed.push_str(&text);
                vec![SessionUpdate::AgentMessageChunk { text }]
            }
            StreamLine::Assistant {
                message,
                timestamp_ms: None,
            } => {
                self.snapshot = Some(message.text());
                Vec::new()
            }
            StreamLine::Thinking { subtype, text } => match (subtype.as_deref(), text) {
                (Some("delta") | None, Some(text)) if !text.is_empty() => {
                    vec![SessionUpdate::AgentThoughtChunk { text }]
                }
                _ => Vec::new(),
            },
            StreamLine::ToolCall {
                subtype,
                call_id,
                tool_call,
            } => decode_tool_call(subtype.as_deref(), call_id, tool_call)
                .into_iter()
                .collect(),
            StreamLine::Result { result, is_error } => {
                let stop_reason = if is_error {
                    StopReason::Error
                } else {
                    StopReason::EndTurn
                };
                let text = result
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| self.turn_text());
                self.result = Some((stop_reason, text.clone()));
                vec![SessionUpdate::Done { stop_reason, text }]
            }
            StreamLine::Other => Vec::new(),
        }
    }

    /// Closing `done` for a turn whose process exited without a result line.
    pub fn finish(&mut self, exited_cleanly: bool) -> Option<SessionUpdate> {
        if self.result.is_some() {
            return None;
        }
        let stop_reason = if exited_cleanly {
            StopReason::EndTurn
        } else {
            StopReason::Error
        };
        let text = self.turn_text();
        self.result = Some((stop_reason, text.clone()));
        Some(SessionUpdate::Done { stop_reason, text })
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn outcome(&self) -> Option<(StopReason, &str)> {
        self.result
            .as_ref()
            .map(|(stop_reason, text)| (*stop_reason, text.as_str()))
    }

    pub fn turn_text(&self) -> String {
        if self.streamed.is_empty() {
            self.snapshot.clone().unwrap_or_default()
        } else {
            self.streamed.clone()
        }
    }
}

fn decode_tool_call(
    subtype: Option<&str>,
    call_id: Option<String>,
    tool_call: Option<Value>,
) -> Option<SessionUpdate> {
    let object = tool_call.as_ref()?.as_object()?;
    let (key, body) = object.iter().next()?;
    let name = key.strip_suffix("ToolCall").unwrap_or(key).to_string();
    let input = body.get("args").cloned();
    let output = body.get("result").cloned();
    let status = match subtype {
        Some("started") => ToolCallStatus::Running,
        Some("completed") => {
            let failed = output
                .as_ref()
                .is_some_and(|result| result.get("error").is_some() || result.get("rejected").is_some());
            if failed {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Completed
            }
        }
        _ => ToolCallStatus::Pending,
    };
    Some(SessionUpdate::ToolCall {
        tool_call_id: call_id.unwrap_or_else(|| name.clone()),
        name,
        status,
        input,
        output,
    })
}
