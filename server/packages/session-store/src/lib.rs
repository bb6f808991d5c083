use std::path::{Path, PathBuf};

use thiserror::Error;

mod record;
mod sessions;
mod settings;

pub use record::{validate_key, JsonRecordStore};
pub use sessions::{MessageStore, SessionEntry, SessionStore};
pub use settings::{AgentSettings, SettingsStore};

pub const DATA_DIR_ENV: &str = "AGENT_RELAY_DATA_DIR";
const DEFAULT_DATA_DIR_NAME: &str = ".agent-relay";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid record key {key:?}")]
    InvalidKey { key: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Root data directory: explicit flag, then `AGENT_RELAY_DATA_DIR`, then
/// `~/.agent-relay`.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_DATA_DIR_NAME)
}

/// The three stores one agent family persists under `<root>/<agent>/`.
#[derive(Clone)]
pub struct AgentStores {
    pub settings: SettingsStore,
    pub sessions: SessionStore,
    pub messages: MessageStore,
}

impl AgentStores {
    pub fn open(root: &Path, agent: &str) -> Result<Self, StoreError> {
        validate_key(agent)?;
        let base = root.join(agent);
        Ok(Self {
            settings: SettingsStore::new(base.join("settings.json")),
            sessions: SessionStore::new(base.join("sessions")),
            messages: MessageStore::new(base.join("messages")),
        })
    }
}
