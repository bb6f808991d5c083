//! Best-effort model selection for freshly started OpenCode servers.
//!
//! Failures here never reach the launch caller. The session manager logs the
//! returned [`DefaultModelError`] and moves on.

use agent_relay_session_store::{SettingsStore, StoreError};
use serde_json::{json, Value};
use thiserror::Error;

const PREFERRED_PROVIDERS: [&str; 4] = ["anthropic", "openai", "google", "opencode"];

#[derive(Debug, Error)]
pub enum DefaultModelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{path} answered {status}")]
    Status { path: &'static str, status: u16 },
    #[error("no provider default available")]
    NoPreference,
    #[error("settings unavailable: {0}")]
    Settings(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultModelOutcome {
    AlreadySet(String),
    Applied(String),
}

pub async fn apply_default_model(
    client: &reqwest::Client,
    base_url: &str,
    settings: &SettingsStore,
) -> Result<DefaultModelOutcome, DefaultModelError> {
    let config: Value = get_json(client, base_url, "/config").await?;
    if let Some(model) = configured_model(&config) {
        return Ok(DefaultModelOutcome::AlreadySet(model.to_string()));
    }

    let model = match settings.load()?.preferred_model.filter(|model| !model.is_empty()) {
        Some(model) => model,
        None => {
            let providers: Value = get_json(client, base_url, "/config/providers").await?;
            pick_provider_default(&providers).ok_or(DefaultModelError::NoPreference)?
        }
    };

    let response = client
        .patch(format!("{base_url}/config"))
        .json(&json!({ "model": model }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(DefaultModelError::Status {
            path: "/config",
            status: response.status().as_u16(),
        });
    }
    Ok(DefaultModelOutcome::Applied(model))
}

pub fn configured_model(config: &Value) -> Option<&str> {
    config
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())
}

/// `provider/model` from the `default` map of `GET /config/providers`.
pub fn pick_provider_default(providers: &Value) -> Option<String> {
    let defaults = providers.get("default")?.as_object()?;
    let preferred = PREFERRED_PROVIDERS.iter().find_map(|provider| {
        defaults
            .get(*provider)
            .and_then(Value::as_str)
            .map(|model| (provider.to_string(), model))
    });
    let (provider, model) = preferred.or_else(|| {
        defaults
            .iter()
            .find_map(|(provider, model)| model.as_str().map(|model| (provider.clone(), model)))
    })?;
    Some(format!("{provider}/{model}"))
}

async fn get_json(
    client: &reqwest::Client,
    base_url: &str,
    path: &'static str,
) -> Result<Value, DefaultModelError> {
    let response = client.get(format!("{base_url}{path}")).send().await?;
    if !response.status().is_success() {
        return Err(DefaultModelError::Status {
            path,
            status: response.status().as_u16(),
        });
    }
    Ok(response.json().await?)
}
