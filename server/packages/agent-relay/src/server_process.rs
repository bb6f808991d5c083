use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agent_relay_agent_management::{extended_path, AgentId};
use agent_relay_error::RelayError;
use tokio::time::sleep;

const PORT_ATTEMPTS: usize = 16;

/// Everything needed to start a server-backed agent.
#[derive(Debug, Clone)]
pub struct ServerLaunch {
    pub agent: AgentId,
    pub binary: PathBuf,
    pub port: u16,
    pub cwd: PathBuf,
    pub api_key: Option<String>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum ExitPoll {
    Running,
    Exited(ExitStatus),
    /// The handle was released by an explicit stop.
    Released,
}

/// A supervised agent HTTP server listening on a loopback port.
#[derive(Debug)]
pub struct ServerProcess {
    port: u16,
    pid: u32,
    child: Arc<StdMutex<Option<Child>>>,
}

impl ServerProcess {
    pub fn spawn(launch: &ServerLaunch) -> Result<Self, RelayError> {
        let args = launch
            .agent
            .server_args(launch.port)
            .ok_or_else(|| RelayError::invalid_argument(format!("{} has no server mode", launch.agent)))?;

        let mut command = Command::new(&launch.binary);
        command
            .args(&args)
            .current_dir(&launch.cwd)
            .env("PATH", extended_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(open_server_log(launch.log_path.as_deref()));
        if let (Some(key), Some(env)) = (launch.api_key.as_deref(), launch.agent.api_key_env()) {
            command.env(env, key);
        }

        tracing::info!(
            agent = %launch.agent,
            program = ?launch.binary,
            args = ?args,
            cwd = ?launch.cwd,
            "spawning agent server"
        );
        let child = command.spawn().map_err(|err| {
            tracing::error!(agent = %launch.agent, error = %err, "failed to spawn agent server");
            RelayError::UpstreamError {
                message: format!("failed to start {}: {err}", launch.binary.display()),
            }
        })?;
        let pid = child.id();
        tracing::info!(agent = %launch.agent, pid, port = launch.port, "agent server spawned");

        Ok(Self {
            port: launch.port,
            pid,
            child: Arc::new(StdMutex::new(Some(child))),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn poll_exit(&self) -> ExitPoll {
        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(_) => return ExitPoll::Released,
        };
        let Some(child) = guard.as_mut() else {
            return ExitPoll::Released;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                *guard = None;
                ExitPoll::Exited(status)
            }
            Ok(None) => ExitPoll::Running,
            Err(err) => {
                tracing::warn!(pid = self.pid, error = %err, "failed to poll agent server");
                ExitPoll::Running
            }
        }
    }

    /// Polls until the process exits or is released. Returns the exit status
    /// only for an exit the relay did not cause.
    pub async fn wait_for_exit(&self, interval: Duration) -> Option<ExitStatus> {
        loop {
            match self.poll_exit() {
                ExitPoll::Running => sleep(interval).await,
                ExitPoll::Exited(status) => return Some(status),
                ExitPoll::Released => return None,
            }
        }
    }

    pub fn terminate(&self) {
        kill_child(&self.child);
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        kill_child(&self.child);
    }
}

/// Ask the OS for a free loopback port, skipping ports already held by
/// live sessions.
pub fn find_available_port(held: &HashSet<u16>) -> Result<u16, RelayError> {
    for _ in 0..PORT_ATTEMPTS {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| RelayError::UpstreamError {
            message: format!("failed to allocate port: {err}"),
        })?;
        let port = listener
            .local_addr()
            .map_err(|err| RelayError::UpstreamError {
                message: format!("failed to allocate port: {err}"),
            })?
            .port();
        drop(listener);
        if !held.contains(&port) {
            return Ok(port);
        }
    }
    Err(RelayError::UpstreamError {
        message: "no free local port available".to_string(),
    })
}

fn open_server_log(path: Option<&Path>) -> Stdio {
    let Some(path) = path else {
        return Stdio::null();
    };
    let opened = path
        .parent()
        .map(fs::create_dir_all)
        .transpose()
        .and_then(|_| OpenOptions::new().create(true).append(true).open(path));
    match opened {
        Ok(file) => file.into(),
        Err(err) => {
            tracing::warn!(path = ?path, error = %err, "failed to open agent server log");
            Stdio::null()
        }
    }
}

fn kill_child(child: &Arc<StdMutex<Option<Child>>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}
