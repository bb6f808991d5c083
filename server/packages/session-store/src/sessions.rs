use std::path::PathBuf;

use agent_relay_protocol::{merge_message, Message};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{JsonRecordStore, StoreError};

/// Durable per-session metadata. Created on first connect and updated in
/// place afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEntry {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub cwd: Option<PathBuf>,
    /// `Some(false)` records an explicit denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_trusted: Option<bool>,
    pub yolo: bool,
}

impl SessionEntry {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    records: JsonRecordStore<SessionEntry>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            records: JsonRecordStore::new(dir),
        }
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionEntry>, StoreError> {
        self.records.load(session_id)
    }

    pub fn upsert(&self, entry: &SessionEntry) -> Result<(), StoreError> {
        self.records.save(&entry.session_id, entry)
    }

    /// Apply `change` to the stored entry, starting from an empty one.
    pub fn update<F>(&self, session_id: &str, change: F) -> Result<SessionEntry, StoreError>
    where
        F: FnOnce(&mut SessionEntry),
    {
        self.records.update(session_id, |current| {
            let mut entry = current.unwrap_or_else(|| SessionEntry::new(session_id));
            entry.session_id = session_id.to_string();
            change(&mut entry);
            entry
        })
    }
}

/// Conversation transcripts, one ordered message list per session.
#[derive(Clone)]
pub struct MessageStore {
    records: JsonRecordStore<Vec<Message>>,
}

impl MessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            records: JsonRecordStore::new(dir),
        }
    }

    pub fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.records.load(session_id)?.unwrap_or_default())
    }

    pub fn save(&self, session_id: &str, messages: &Vec<Message>) -> Result<(), StoreError> {
        self.records.save(session_id, messages)
    }

    pub fn merge(&self, session_id: &str, message: Message) -> Result<Vec<Message>, StoreError> {
        self.records.update(session_id, |current| {
            let mut messages = current.unwrap_or_default();
            merge_message(&mut messages, message);
            messages
        })
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_protocol::{MessagePart, MessageRole};

    use super::*;

    #[test]
    fn update_creates_then_edits_entry() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let store = SessionStore::new(temp_dir.path());

        let created = store
            .update("chat-1", |entry| entry.workspace_trusted = Some(false))
            .expect("create");
        assert_eq!(created.session_id, "chat-1");
        assert_eq!(created.workspace_trusted, Some(false));

        let updated = store
            .update("chat-1", |entry| {
                entry.workspace_trusted = Some(true);
                entry.model = Some("sonnet-4".to_string());
            })
            .expect("update");
        assert_eq!(updated.workspace_trusted, Some(true));
        assert_eq!(store.get("chat-1").expect("get"), Some(updated));
    }

    #[test]
    fn entry_serializes_camel_case() {
        let entry = SessionEntry {
            cwd: Some(PathBuf::from("/tmp/proj")),
            yolo: true,
            ..SessionEntry::new("chat-2")
        };
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["sessionId"], "chat-2");
        assert_eq!(value["cwd"], "/tmp/proj");
        assert_eq!(value["yolo"], true);
        assert!(value.get("workspaceTrusted").is_none());
    }

    #[test]
    fn merge_accumulates_transcript() {
        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let store = MessageStore::new(temp_dir.path());

        let user = Message::new("user-1", MessageRole::User)
            .with_part(MessagePart::text("user-1-text", "hi"));
        store.merge("chat-1", user.clone()).expect("merge user");
        store.merge("chat-1", user).expect("merge user again");
        let reply = Message::new("msg-1", MessageRole::Agent)
            .with_part(MessagePart::text("msg-1-text", "hello"));
        let transcript = store.merge("chat-1", reply).expect("merge reply");

        assert_eq!(transcript.len(), 2);
        assert_eq!(store.load("chat-1").expect("load"), transcript);
        assert!(store.load("other").expect("load other").is_empty());
    }
}
