use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::record::{read_json, write_json_atomic};
use crate::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub binary_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Last model chosen through the relay, in `provider/model` form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
}

/// Single-file settings for one agent family.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AgentSettings, StoreError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, settings: &AgentSettings) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json_atomic(&self.path, settings)
    }

    pub fn update<F>(&self, change: F) -> Result<AgentSettings, StoreError>
    where
        F: FnOnce(&mut AgentSettings),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut settings: AgentSettings = read_json(&self.path)?.unwrap_or_default();
        change(&mut settings);
        write_json_atomic(&self.path, &settings)?;
        Ok(settings)
    }
}
