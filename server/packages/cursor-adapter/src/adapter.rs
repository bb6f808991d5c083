use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use agent_relay_agent_management::{extended_path, resolve_binary, AgentId};
use agent_relay_protocol::{
    Message, MessagePart, MessageRole, PromptResult, SessionUpdate, StopReason,
};
use agent_relay_session_store::{AgentStores, SessionEntry};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::channel::{UpdateChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::command::{
    check_status_output, default_cli_config_path, parse_chat_id, read_cli_model, PromptInvocation,
};
use crate::stream_json::{is_trust_prompt, StreamDecoder};
use crate::AdapterError;

#[derive(Debug, Clone)]
pub struct CursorAdapterConfig {
    /// Explicit binary, checked before PATH.
    pub binary_override: Option<PathBuf>,
    pub api_key: Option<String>,
    /// Defaults to `~/.cursor/cli-config.json`.
    pub cli_config_path: Option<PathBuf>,
    pub channel_capacity: usize,
}

impl Default for CursorAdapterConfig {
    fn default() -> Self {
        Self {
            binary_override: None,
            api_key: None,
            cli_config_path: default_cli_config_path(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPrompt {
    text: String,
    model: Option<String>,
    user_message_id: String,
}

#[derive(Debug, Default)]
struct AdapterState {
    binary: Option<PathBuf>,
    chat_id: Option<String>,
    model: Option<String>,
    cwd: Option<PathBuf>,
    debug: bool,
    pending: Option<PendingPrompt>,
}

enum TurnEnd {
    Exited { success: bool },
    TrustPrompt { line: String },
    Cancelled,
}

/// The prompt subprocess of the turn in flight.
struct RunningTurn {
    child: Child,
    /// Fired by `kill_running`. Ends the reader even while a grandchild
    /// still holds the pipes.
    cancel: Option<oneshot::Sender<()>>,
}

/// Talks to the Cursor Agent CLI by spawning one subprocess per prompt.
pub struct CursorAdapter {
    config: CursorAdapterConfig,
    stores: AgentStores,
    state: Mutex<AdapterState>,
    running: Mutex<Option<RunningTurn>>,
    prompt_lock: tokio::sync::Mutex<()>,
    updates: Arc<UpdateChannel>,
}

impl CursorAdapter {
    pub fn new(config: CursorAdapterConfig, stores: AgentStores) -> Self {
        let updates = Arc::new(UpdateChannel::new(config.channel_capacity));
        Self {
            config,
            stores,
            state: Mutex::new(AdapterState::default()),
            running: Mutex::new(None),
            prompt_lock: tokio::sync::Mutex::new(()),
            updates,
        }
    }

    pub fn updates(&self) -> Arc<UpdateChannel> {
        self.updates.clone()
    }

    pub fn stores(&self) -> &AgentStores {
        &self.stores
    }

    pub fn chat_id(&self) -> Option<String> {
        self.state().chat_id.clone()
    }

    pub fn model(&self) -> Option<String> {
        self.state().model.clone()
    }

    pub fn has_pending_prompt(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Verify the CLI is usable and bind this adapter to a chat, either
    /// `resume_session_id` or a freshly created one.
    pub async fn connect(
        &self,
        project_dir: &Path,
        resume_session_id: Option<&str>,
        debug: bool,
    ) -> Result<String, AdapterError> {
        let _turn = self.prompt_lock.lock().await;
        if let Some(chat_id) = self.chat_id() {
            return Err(AdapterError::AlreadyConnected { chat_id });
        }

        let binary = resolve_binary(AgentId::Cursor, self.config.binary_override.as_deref())
            .map_err(|_| AdapterError::AgentNotFound)?;
        self.check_auth(&binary, project_dir).await?;
        let detected_model = self
            .config
            .cli_config_path
            .as_deref()
            .and_then(read_cli_model);

        let entry = match resume_session_id {
            Some(chat_id) => self.stores.sessions.update(chat_id, |entry| {
                if entry.model.is_none() {
                    entry.model = detected_model.clone();
                }
                if entry.cwd.is_none() {
                    entry.cwd = Some(project_dir.to_path_buf());
                }
            })?,
            None => {
                let chat_id = self.create_chat(&binary, project_dir).await?;
                let entry = SessionEntry {
                    model: detected_model.clone(),
                    cwd: Some(project_dir.to_path_buf()),
                    ..SessionEntry::new(chat_id)
                };
                self.stores.sessions.upsert(&entry)?;
                entry
            }
        };

        {
            let mut state = self.state();
            state.binary = Some(binary);
            state.chat_id = Some(entry.session_id.clone());
            state.model = entry.model.clone();
            state.cwd = entry.cwd.clone();
            state.debug = debug;
        }
        tracing::info!(
            chat_id = %entry.session_id,
            model = ?entry.model,
            resumed = resume_session_id.is_some(),
            "cursor adapter connected"
        );
        self.updates.push(SessionUpdate::SessionInfo {
            session_id: Some(entry.session_id.clone()),
            model: entry.model.clone(),
        });
        Ok(entry.session_id)
    }

    pub async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        model: Option<String>,
    ) -> Result<PromptResult, AdapterError> {
        self.ensure_session(session_id)?;
        self.run_prompt(session_id, text.to_string(), model, false, None)
            .await
    }

    /// Re-run the prompt that hit the trust banner, this time with `--trust`.
    /// Returns `false` when nothing was waiting.
    pub fn retry_prompt_with_trust(self: &Arc<Self>, session_id: &str) -> Result<bool, AdapterError> {
        self.ensure_session(session_id)?;
        let Some(pending) = self.state().pending.take() else {
            return Ok(false);
        };

        let adapter = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let outcome = adapter
                .run_prompt(
                    &session_id,
                    pending.text,
                    pending.model,
                    true,
                    Some(pending.user_message_id),
                )
                .await;
            match outcome {
                Ok(result) => tracing::info!(
                    chat_id = %session_id,
                    stop_reason = ?result.stop_reason,
                    "trusted retry finished"
                ),
                Err(err) => tracing::warn!(
                    chat_id = %session_id,
                    error = %err,
                    "trusted retry failed"
                ),
            }
        });
        Ok(true)
    }

    /// Record the user's answer to a trust prompt. Accepting also replays the
    /// cached prompt.
    pub fn respond_to_trust(self: &Arc<Self>, session_id: &str, trust: bool) -> Result<bool, AdapterError> {
        self.ensure_session(session_id)?;
        self.stores
            .sessions
            .update(session_id, |entry| entry.workspace_trusted = Some(trust))?;
        if trust {
            self.retry_prompt_with_trust(session_id)
        } else {
            self.state().pending = None;
            Ok(false)
        }
    }

    /// Best-effort kill of the in-flight prompt subprocess.
    pub fn cancel(&self, session_id: &str) -> Result<(), AdapterError> {
        self.ensure_session(session_id)?;
        self.kill_running();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.kill_running();
        self.updates.close();
    }

    async fn run_prompt(
        &self,
        session_id: &str,
        text: String,
        model_override: Option<String>,
        trust_retry: bool,
        user_message_id: Option<String>,
    ) -> Result<PromptResult, AdapterError> {
        let _turn = self.prompt_lock.lock().await;

        let entry = match model_override.as_deref().filter(|model| !model.is_empty()) {
            Some(model) => {
                let entry = self
                    .stores
                    .sessions
                    .update(session_id, |entry| entry.model = Some(model.to_string()))?;
                self.state().model = entry.model.clone();
                entry
            }
            None => self
                .stores
                .sessions
                .get(session_id)?
                .unwrap_or_else(|| SessionEntry::new(session_id)),
        };
        let (binary, cwd, debug, model) = {
            let state = self.state();
            (
                state.binary.clone(),
                entry.cwd.clone().or_else(|| state.cwd.clone()),
                state.debug,
                entry.model.clone().or_else(|| state.model.clone()),
            )
        };
        let binary = binary.ok_or(AdapterError::NotConnected)?;
        let trust = trust_retry || entry.workspace_trusted == Some(true);

        let started_ms = now_ms();
        let user_message_id = user_message_id.unwrap_or_else(|| format!("user-{started_ms}"));
        self.stores.messages.merge(
            session_id,
            Message::new(user_message_id.clone(), MessageRole::User)
                .with_part(MessagePart::text(format!("{user_message_id}-text"), text.clone()))
                .with_timestamp(started_ms),
        )?;

        let invocation = PromptInvocation {
            chat_id: session_id,
            prompt: &text,
            model: model.as_deref(),
            trust,
            force: entry.yolo,
        };
        let mut command = self.command(&binary, cwd.as_deref());
        command
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawned_at = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(chat_id = %session_id, error = %err, "failed to spawn prompt process");
                self.updates.push(SessionUpdate::Error {
                    message: format!("failed to start {}: {err}", binary.display()),
                });
                self.updates.push(SessionUpdate::Done {
                    stop_reason: StopReason::Error,
                    text: String::new(),
                });
                return Ok(PromptResult {
                    stop_reason: StopReason::Error,
                    text: String::new(),
                });
            }
        };
        tracing::info!(
            chat_id = %session_id,
            pid = child.id().unwrap_or(0),
            trust = trust,
            model = ?model,
            "prompt process spawned"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.running_guard() = Some(RunningTurn {
            child,
            cancel: Some(cancel_tx),
        });

        let mut decoder = StreamDecoder::new();
        let end = self
            .read_turn(session_id, stdout, stderr, cancel_rx, &mut decoder, debug, !trust)
            .await;

        let finished = self.running_guard().take();
        let success = match finished {
            Some(RunningTurn { mut child, .. }) => {
                if matches!(end, TurnEnd::TrustPrompt { .. }) {
                    let _ = child.start_kill();
                }
                match child.wait().await {
                    Ok(status) => status.success(),
                    Err(err) => {
                        tracing::warn!(chat_id = %session_id, error = %err, "failed to reap prompt process");
                        false
                    }
                }
            }
            None => false,
        };
        let success = match end {
            TurnEnd::TrustPrompt { line } => {
                tracing::info!(chat_id = %session_id, "workspace trust required");
                self.state().pending = Some(PendingPrompt {
                    text,
                    model: model_override,
                    user_message_id,
                });
                self.updates.push(SessionUpdate::TrustPrompt {
                    session_id: session_id.to_string(),
                    message: line.trim().to_string(),
                });
                return Err(AdapterError::TrustPromptPending {
                    chat_id: session_id.to_string(),
                });
            }
            TurnEnd::Exited { success: streams_ok } => success && streams_ok,
            TurnEnd::Cancelled => false,
        };

        if let Some(model) = decoder.model() {
            self.state().model = Some(model.to_string());
        }
        if let Some(done) = decoder.finish(success) {
            self.updates.push(done);
        }
        let (stop_reason, reply) = decoder
            .outcome()
            .map(|(stop_reason, text)| (stop_reason, text.to_string()))
            .unwrap_or((StopReason::Error, String::new()));

        if !reply.is_empty() {
            let agent_message_id = format!("agent-{started_ms}");
            self.stores.messages.merge(
                session_id,
                Message::new(agent_message_id.clone(), MessageRole::Agent)
                    .with_part(MessagePart::text(format!("{agent_message_id}-text"), reply.clone()))
                    .with_timestamp(now_ms())
                    .with_model(decoder.model().map(str::to_string).or(model)),
            )?;
        }
        tracing::info!(
            chat_id = %session_id,
            stop_reason = ?stop_reason,
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "prompt finished"
        );
        Ok(PromptResult {
            stop_reason,
            text: reply,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_turn(
        &self,
        session_id: &str,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        mut cancel: oneshot::Receiver<()>,
        decoder: &mut StreamDecoder,
        debug: bool,
        watch_trust: bool,
    ) -> TurnEnd {
        let mut stdout_lines = stdout.map(LineReader::new);
        let mut stderr_lines = stderr.map(LineReader::new);
        let mut line_count: u64 = 0;

        loop {
            let (line, from_stdout) = tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_lines.is_some() => (line, true),
                line = next_line(&mut stderr_lines), if stderr_lines.is_some() => (line, false),
                _ = &mut cancel, if stdout_lines.is_some() || stderr_lines.is_some() => {
                    tracing::info!(chat_id = %session_id, total_lines = line_count, "prompt cancelled");
                    return TurnEnd::Cancelled;
                }
                else => break,
            };
            let Some(line) = line else {
                if from_stdout {
                    stdout_lines = None;
                } else {
                    stderr_lines = None;
                }
                continue;
            };

            if watch_trust && is_trust_prompt(&line) {
                self.kill_running();
                return TurnEnd::TrustPrompt { line };
            }
            if !from_stdout {
                tracing::info!(chat_id = %session_id, "agent stderr: {}", line);
                continue;
            }

            line_count += 1;
            if debug {
                self.updates.push(SessionUpdate::Debug {
                    stream: "stdout".to_string(),
                    line: line.clone(),
                });
            }
            for update in decoder.decode_line(&line) {
                self.updates.push(update);
            }
        }

        tracing::debug!(chat_id = %session_id, total_lines = line_count, "prompt output ended");
        TurnEnd::Exited { success: true }
    }

    async fn check_auth(&self, binary: &Path, project_dir: &Path) -> Result<(), AdapterError> {
        let output = self
            .command(binary, Some(project_dir))
            .arg("status")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| AdapterError::Spawn {
                command: format!("{} status", binary.display()),
                source: err,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        check_status_output(output.status.success(), &stdout, &stderr)
            .map_err(|message| AdapterError::NotAuthenticated { message })
    }

    async fn create_chat(&self, binary: &Path, project_dir: &Path) -> Result<String, AdapterError> {
        let output = self
            .command(binary, Some(project_dir))
            .arg("create-chat")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| AdapterError::ChatCreationFailed {
                message: err.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdapterError::ChatCreationFailed {
                message: format!("create-chat exited with {}: {}", output.status, stderr.trim()),
            });
        }
        parse_chat_id(&stdout).ok_or_else(|| AdapterError::ChatCreationFailed {
            message: "create-chat printed no chat id".to_string(),
        })
    }

    fn command(&self, binary: &Path, cwd: Option<&Path>) -> Command {
        let mut command = Command::new(binary);
        command.env("PATH", extended_path());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        if let (Some(key), Some(env)) = (self.config.api_key.as_deref(), AgentId::Cursor.api_key_env()) {
            command.env(env, key);
        }
        command
    }

    fn ensure_session(&self, session_id: &str) -> Result<(), AdapterError> {
        match self.chat_id() {
            Some(chat_id) if chat_id == session_id => Ok(()),
            Some(chat_id) => Err(AdapterError::SessionMismatch {
                expected: chat_id,
                actual: session_id.to_string(),
            }),
            None => Err(AdapterError::NotConnected),
        }
    }

    fn kill_running(&self) {
        if let Some(turn) = self.running_guard().as_mut() {
            if let Err(err) = turn.child.start_kill() {
                tracing::debug!(error = %err, "prompt process already gone");
            }
            if let Some(cancel) = turn.cancel.take() {
                let _ = cancel.send(());
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_guard(&self) -> MutexGuard<'_, Option<RunningTurn>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Newline-delimited reader that tolerates output which is not UTF-8.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// `None` at end of stream. Bytes of a read interrupted by `select!`
    /// stay in `buf` and are completed by the next call.
    async fn next_line(&mut self) -> Option<String> {
        if let Err(err) = self.reader.read_until(b'\n', &mut self.buf).await {
            tracing::debug!(error = %err, "prompt output read failed");
            return None;
        }
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\n', '\r']).to_string())
    }
}

async fn next_line<R>(lines: &mut Option<LineReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines.as_mut() {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
