use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay_agent_management::{
    parse_agent, resolve_binary, AdapterKind, AgentError, AgentId,
};
use agent_relay_cursor_adapter::{
    command::default_cli_config_path, AdapterError, CursorAdapter, CursorAdapterConfig,
    DEFAULT_CHANNEL_CAPACITY,
};
use agent_relay_error::RelayError;
use agent_relay_session_store::{resolve_data_dir, AgentSettings, AgentStores, SettingsStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use utoipa::ToSchema;

use crate::default_model::{apply_default_model, DefaultModelError, DefaultModelOutcome};
use crate::server_process::{find_available_port, ServerLaunch, ServerProcess};

const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub data_dir: PathBuf,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub exit_poll_interval: Duration,
    pub channel_capacity: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub cli_config_path: Option<PathBuf>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: resolve_data_dir(None),
            health_interval: Duration::from_millis(500),
            health_timeout: Duration::from_secs(30),
            exit_poll_interval: Duration::from_millis(200),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_page_size: 20,
            max_page_size: 100,
            cli_config_path: default_cli_config_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Error,
    Stopped,
}

impl SessionStatus {
    /// `error` and `stopped` are absorbing; nothing moves back to `starting`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running | Self::Error) => true,
            (Self::Running, Self::Error) => true,
            (Self::Stopped, _) => false,
            (_, Self::Stopped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub project_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub created_at: i64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionPage {
    pub sessions: Vec<SessionInfo>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Clone)]
pub enum SessionBackend {
    Server(Arc<ServerProcess>),
    InProcess(Arc<CursorAdapter>),
}

/// Snapshot of a registered session plus a handle to its backend.
#[derive(Clone)]
pub struct AgentSession {
    pub info: SessionInfo,
    pub backend: SessionBackend,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub agent_id: String,
    pub project_dir: PathBuf,
    pub api_key: Option<String>,
    pub resume_session_id: Option<String>,
    pub debug: bool,
}

struct SessionRecord {
    seq: u64,
    info: SessionInfo,
    backend: SessionBackend,
}

struct Inner {
    config: SessionManagerConfig,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    next_seq: AtomicU64,
    http: reqwest::Client,
}

/// Registry of live agent sessions. Cheap to clone; every clone shares the
/// same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                http: reqwest::Client::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn stores(&self, agent: AgentId) -> Result<AgentStores, RelayError> {
        AgentStores::open(&self.inner.config.data_dir, agent.as_str()).map_err(|err| {
            RelayError::Storage {
                message: err.to_string(),
            }
        })
    }

    pub async fn launch(&self, request: LaunchRequest) -> Result<SessionInfo, RelayError> {
        if !request.project_dir.is_dir() {
            return Err(RelayError::invalid_argument(format!(
                "project directory does not exist: {}",
                request.project_dir.display()
            )));
        }
        let agent = parse_agent(&request.agent_id).map_err(agent_error)?;
        if !agent.headless_capable() {
            return Err(agent_error(AgentError::NotHeadlessCapable { agent }));
        }

        let stores = self.stores(agent)?;
        let settings = stores.settings.load().unwrap_or_else(|err| {
            tracing::warn!(agent = %agent, error = %err, "ignoring unreadable agent settings");
            AgentSettings::default()
        });
        let api_key = request
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| settings.api_key.clone());

        match agent.adapter_kind() {
            AdapterKind::Server => {
                self.launch_server(agent, &request, api_key, settings, stores)
                    .await
            }
            AdapterKind::InProcess => {
                self.launch_in_process(agent, &request, api_key, settings, stores)
                    .await
            }
            AdapterKind::Terminal => Err(agent_error(AgentError::NotHeadlessCapable { agent })),
        }
    }

    async fn launch_server(
        &self,
        agent: AgentId,
        request: &LaunchRequest,
        api_key: Option<String>,
        settings: AgentSettings,
        stores: AgentStores,
    ) -> Result<SessionInfo, RelayError> {
        let binary =
            resolve_binary(agent, settings.binary_path.as_deref()).map_err(agent_error)?;
        let held = self.held_ports().await;
        let port = find_available_port(&held)?;
        let id = self.next_session_id();

        let launch = ServerLaunch {
            agent,
            binary,
            port,
            cwd: request.project_dir.clone(),
            api_key,
            log_path: Some(
                self.inner
                    .config
                    .data_dir
                    .join(agent.as_str())
                    .join("logs")
                    .join(format!("{id}.log")),
            ),
        };
        let process = tokio::task::spawn_blocking(move || ServerProcess::spawn(&launch))
            .await
            .map_err(|err| RelayError::UpstreamError {
                message: err.to_string(),
            })??;
        let process = Arc::new(process);

        let info = self
            .register(
                &id,
                agent,
                &request.project_dir,
                Some(port),
                SessionStatus::Starting,
                None,
                SessionBackend::Server(process.clone()),
            )
            .await;
        tracing::info!(session_id = %id, agent = %agent, port, "session starting");

        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(self.clone().await_ready(
            id.clone(),
            agent,
            process.clone(),
            done_rx,
            stores.settings,
        ));
        tokio::spawn(self.clone().watch_exit(id, process, done_tx));
        Ok(info)
    }

    async fn launch_in_process(
        &self,
        agent: AgentId,
        request: &LaunchRequest,
        api_key: Option<String>,
        settings: AgentSettings,
        stores: AgentStores,
    ) -> Result<SessionInfo, RelayError> {
        let adapter = Arc::new(CursorAdapter::new(
            CursorAdapterConfig {
                binary_override: settings.binary_path,
                api_key,
                cli_config_path: self.inner.config.cli_config_path.clone(),
                channel_capacity: self.inner.config.channel_capacity,
            },
            stores,
        ));
        let chat_id = adapter
            .connect(
                &request.project_dir,
                request.resume_session_id.as_deref(),
                request.debug,
            )
            .await
            .map_err(|err| adapter_error(agent, err))?;

        let id = self.next_session_id();
        let info = self
            .register(
                &id,
                agent,
                &request.project_dir,
                None,
                SessionStatus::Running,
                Some(chat_id.clone()),
                SessionBackend::InProcess(adapter),
            )
            .await;
        tracing::info!(session_id = %id, agent = %agent, chat_id = %chat_id, "session running");
        Ok(info)
    }

    #[allow(clippy::too_many_arguments)]
    async fn register(
        &self,
        id: &str,
        agent: AgentId,
        project_dir: &Path,
        port: Option<u16>,
        status: SessionStatus,
        chat_id: Option<String>,
        backend: SessionBackend,
    ) -> SessionInfo {
        let info = SessionInfo {
            id: id.to_string(),
            agent_id: agent,
            agent_name: agent.display_name().to_string(),
            project_dir: project_dir.display().to_string(),
            port,
            created_at: chrono::Utc::now().timestamp_millis(),
            status,
            error: None,
            chat_id,
        };
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.lock().await.insert(
            id.to_string(),
            SessionRecord {
                seq,
                info: info.clone(),
                backend,
            },
        );
        info
    }

    async fn await_ready(
        self,
        id: String,
        agent: AgentId,
        process: Arc<ServerProcess>,
        mut done: watch::Receiver<bool>,
        settings: SettingsStore,
    ) {
        let Some(health_path) = agent.health_path() else {
            self.transition(&id, SessionStatus::Running, None).await;
            return;
        };
        let url = format!("{}{health_path}", process.base_url());
        let deadline = Instant::now() + self.inner.config.health_timeout;

        loop {
            if *done.borrow() {
                return;
            }
            let healthy = self
                .inner
                .http
                .get(&url)
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
                .await
                .map(|response| response.status().is_success())
                .unwrap_or(false);
            if healthy {
                if self.transition(&id, SessionStatus::Running, None).await {
                    tracing::info!(session_id = %id, "session running");
                    let client = self.inner.http.clone();
                    let base_url = process.base_url();
                    let session_id = id.clone();
                    tokio::spawn(async move {
                        log_default_model(
                            &session_id,
                            apply_default_model(&client, &base_url, &settings).await,
                        );
                    });
                }
                return;
            }
            if Instant::now() >= deadline {
                let message = format!(
                    "agent server did not become healthy within {}s",
                    self.inner.config.health_timeout.as_secs()
                );
                tracing::warn!(session_id = %id, "{message}");
                self.transition(&id, SessionStatus::Error, Some(message))
                    .await;
                return;
            }
            tokio::select! {
                _ = sleep(self.inner.config.health_interval) => {}
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn watch_exit(self, id: String, process: Arc<ServerProcess>, done: watch::Sender<bool>) {
        if let Some(status) = process
            .wait_for_exit(self.inner.config.exit_poll_interval)
            .await
        {
            let message = format!("agent process exited with {status}");
            if self
                .transition(&id, SessionStatus::Error, Some(message.clone()))
                .await
            {
                tracing::warn!(session_id = %id, pid = process.pid(), "{message}");
            }
        }
        let _ = done.send(true);
    }

    async fn transition(&self, id: &str, next: SessionStatus, error: Option<String>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(record) = sessions.get_mut(id) else {
            return false;
        };
        if !record.info.status.can_transition_to(next) {
            return false;
        }
        record.info.status = next;
        record.info.error = error;
        true
    }

    pub async fn list(&self, page: Option<usize>, page_size: Option<usize>) -> SessionPage {
        let entries: Vec<(u64, SessionInfo)> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .map(|record| (record.seq, record.info.clone()))
                .collect()
        };
        paginate(
            entries,
            page.unwrap_or(1),
            page_size.unwrap_or(self.inner.config.default_page_size),
            self.inner.config.max_page_size,
        )
    }

    pub async fn get(&self, id: &str) -> Option<AgentSession> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(id).map(|record| AgentSession {
            info: record.info.clone(),
            backend: record.backend.clone(),
        })
    }

    /// Remove and terminate a session. Unknown ids are a no-op.
    pub async fn stop(&self, id: &str) -> Option<SessionInfo> {
        let removed = self.inner.sessions.lock().await.remove(id);
        let mut record = removed?;
        record.info.status = SessionStatus::Stopped;
        match &record.backend {
            SessionBackend::Server(process) => process.terminate(),
            SessionBackend::InProcess(adapter) => adapter.shutdown(),
        }
        tracing::info!(session_id = %id, agent = %record.info.agent_id, "session stopped");
        Some(record.info)
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub async fn find_adapter_by_chat(&self, chat_id: &str) -> Option<Arc<CursorAdapter>> {
        let sessions = self.inner.sessions.lock().await;
        sessions.values().find_map(|record| match &record.backend {
            SessionBackend::InProcess(adapter)
                if adapter.chat_id().as_deref() == Some(chat_id) =>
            {
                Some(adapter.clone())
            }
            _ => None,
        })
    }

    async fn held_ports(&self) -> HashSet<u16> {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .values()
            .filter_map(|record| record.info.port)
            .collect()
    }

    fn next_session_id(&self) -> String {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "ses_{:x}{:04x}",
            chrono::Utc::now().timestamp_millis(),
            seq & 0xffff
        )
    }
}

fn paginate(
    mut entries: Vec<(u64, SessionInfo)>,
    page: usize,
    page_size: usize,
    max_page_size: usize,
) -> SessionPage {
    entries.sort_by(|(a_seq, a), (b_seq, b)| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b_seq.cmp(a_seq))
    });
    let page = page.max(1);
    let page_size = page_size.clamp(1, max_page_size.max(1));
    let total = entries.len();
    let total_pages = total.div_ceil(page_size);
    let sessions = entries
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .map(|(_, info)| info)
        .collect();
    SessionPage {
        sessions,
        page,
        page_size,
        total,
        total_pages,
    }
}

fn log_default_model(session_id: &str, outcome: Result<DefaultModelOutcome, DefaultModelError>) {
    match outcome {
        Ok(DefaultModelOutcome::Applied(model)) => {
            tracing::info!(session_id, model = %model, "applied default model");
        }
        Ok(DefaultModelOutcome::AlreadySet(model)) => {
            tracing::debug!(session_id, model = %model, "model already configured");
        }
        Err(DefaultModelError::NoPreference) => {
            tracing::debug!(session_id, "no default model to apply");
        }
        Err(err) => {
            tracing::warn!(session_id, error = %err, "failed to apply default model");
        }
    }
}

pub(crate) fn agent_error(err: AgentError) -> RelayError {
    match err {
        AgentError::UnsupportedAgent { agent } => RelayError::UnknownAgent { agent },
        AgentError::BinaryNotFound { agent } => RelayError::NotInstalled {
            agent: agent.to_string(),
        },
        AgentError::NotHeadlessCapable { agent } => RelayError::NotHeadlessCapable {
            agent: agent.to_string(),
        },
    }
}

pub(crate) fn adapter_error(agent: AgentId, err: AdapterError) -> RelayError {
    match err {
        AdapterError::AgentNotFound => RelayError::NotInstalled {
            agent: agent.to_string(),
        },
        AdapterError::NotAuthenticated { message } => RelayError::NotAuthenticated {
            agent: agent.to_string(),
            message: Some(message),
        },
        AdapterError::ChatCreationFailed { message } => RelayError::ChatCreationFailed {
            agent: agent.to_string(),
            message,
        },
        AdapterError::AlreadyConnected { chat_id } => RelayError::AlreadyConnected {
            session_id: chat_id,
        },
        AdapterError::SessionMismatch { .. } => RelayError::invalid_argument(err.to_string()),
        AdapterError::NotConnected => RelayError::SessionUnavailable {
            session_id: String::new(),
            message: err.to_string(),
        },
        AdapterError::TrustPromptPending { chat_id } => RelayError::TrustPromptPending {
            session_id: chat_id,
        },
        AdapterError::Spawn { .. } => RelayError::UpstreamError {
            message: err.to_string(),
        },
        AdapterError::Store(err) => RelayError::Storage {
            message: err.to_string(),
        },
    }
}
