use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const OPENCODE_HEALTH_PATH: &str = "/global/health";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Opencode,
    Cursor,
    Gemini,
}

/// How the relay reaches an agent once a session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Long-lived local HTTP server reached through the reverse proxy.
    Server,
    /// One short-lived CLI subprocess per prompt.
    InProcess,
    /// Interactive terminal only. Cannot be launched unattended.
    Terminal,
}

impl AgentId {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentId::Opencode => "opencode",
            AgentId::Cursor => "cursor",
            AgentId::Gemini => "gemini",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentId::Opencode => "OpenCode",
            AgentId::Cursor => "Cursor Agent",
            AgentId::Gemini => "Gemini CLI",
        }
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            AgentId::Opencode => "opencode",
            AgentId::Cursor => "cursor-agent",
            AgentId::Gemini => "gemini",
        }
    }

    /// Secondary names checked on PATH when the primary binary is absent.
    pub fn binary_aliases(self) -> &'static [&'static str] {
        match self {
            AgentId::Cursor => &["agent"],
            AgentId::Opencode | AgentId::Gemini => &[],
        }
    }

    pub fn adapter_kind(self) -> AdapterKind {
        match self {
            AgentId::Opencode => AdapterKind::Server,
            AgentId::Cursor => AdapterKind::InProcess,
            AgentId::Gemini => AdapterKind::Terminal,
        }
    }

    pub fn headless_capable(self) -> bool {
        !matches!(self.adapter_kind(), AdapterKind::Terminal)
    }

    pub fn health_path(self) -> Option<&'static str> {
        match self {
            AgentId::Opencode => Some(OPENCODE_HEALTH_PATH),
            AgentId::Cursor | AgentId::Gemini => None,
        }
    }

    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            AgentId::Opencode => Some("ANTHROPIC_API_KEY"),
            AgentId::Cursor => Some("CURSOR_API_KEY"),
            AgentId::Gemini => Some("GEMINI_API_KEY"),
        }
    }

    /// Arguments that start the agent as a loopback HTTP server on `port`.
    pub fn server_args(self, port: u16) -> Option<Vec<String>> {
        match self {
            AgentId::Opencode => Some(vec![
                "serve".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--hostname".to_string(),
                "127.0.0.1".to_string(),
            ]),
            AgentId::Cursor | AgentId::Gemini => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "opencode" => Some(AgentId::Opencode),
            "cursor" | "cursor-agent" => Some(AgentId::Cursor),
            "gemini" => Some(AgentId::Gemini),
            _ => None,
        }
    }

    pub fn all() -> &'static [AgentId] {
        &[AgentId::Opencode, AgentId::Cursor, AgentId::Gemini]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: AgentId,
    pub display_name: String,
    pub adapter_kind: AdapterKind,
    pub headless: bool,
    pub binary_path: Option<String>,
}

impl AgentInfo {
    pub fn detect(agent: AgentId, override_path: Option<&Path>) -> Self {
        let binary_path = resolve_binary(agent, override_path)
            .ok()
            .map(|path| path.to_string_lossy().into_owned());
        Self {
            id: agent,
            display_name: agent.display_name().to_string(),
            adapter_kind: agent.adapter_kind(),
            headless: agent.headless_capable(),
            binary_path,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported agent {agent}")]
    UnsupportedAgent { agent: String },
    #[error("binary not found for {agent}")]
    BinaryNotFound { agent: AgentId },
    #[error("{agent} cannot run without a terminal")]
    NotHeadlessCapable { agent: AgentId },
}

pub fn parse_agent(value: &str) -> Result<AgentId, AgentError> {
    AgentId::parse(value).ok_or_else(|| AgentError::UnsupportedAgent {
        agent: value.to_string(),
    })
}

/// Resolve the executable for `agent`: an existing override first, then the
/// primary binary name on PATH, then each alias.
pub fn resolve_binary(agent: AgentId, override_path: Option<&Path>) -> Result<PathBuf, AgentError> {
    let path_var = std::env::var_os("PATH");
    resolve_binary_in(agent, override_path, path_var.as_deref())
}

pub fn resolve_binary_in(
    agent: AgentId,
    override_path: Option<&Path>,
    path_var: Option<&OsStr>,
) -> Result<PathBuf, AgentError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }
    let Some(path_var) = path_var else {
        return Err(AgentError::BinaryNotFound { agent });
    };
    std::iter::once(agent.binary_name())
        .chain(agent.binary_aliases().iter().copied())
        .find_map(|name| find_in_path(name, path_var))
        .ok_or(AgentError::BinaryNotFound { agent })
}

pub fn find_in_path(binary_name: &str, path_var: &OsStr) -> Option<PathBuf> {
    for path in std::env::split_paths(path_var) {
        let candidate = path.join(binary_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let candidate_exe = path.join(format!("{binary_name}.exe"));
            if candidate_exe.is_file() {
                return Some(candidate_exe);
            }
        }
    }
    None
}

/// PATH handed to spawned agents: common user install locations ahead of the
/// inherited value, without duplicates.
pub fn extended_path() -> OsString {
    let inherited = std::env::var_os("PATH");
    extended_path_from(dirs::home_dir().as_deref(), inherited.as_deref())
}

pub fn extended_path_from(home: Option<&Path>, inherited: Option<&OsStr>) -> OsString {
    let mut entries: Vec<PathBuf> = Vec::new();
    if let Some(home) = home {
        entries.push(home.join(".local/bin"));
        entries.push(home.join(".opencode/bin"));
        entries.push(home.join(".bun/bin"));
    }
    entries.push(PathBuf::from("/usr/local/bin"));
    entries.push(PathBuf::from("/opt/homebrew/bin"));
    if let Some(inherited) = inherited {
        entries.extend(std::env::split_paths(inherited));
    }

    let mut unique: Vec<PathBuf> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.as_os_str().is_empty() || unique.contains(&entry) {
            continue;
        }
        unique.push(entry);
    }
    std::env::join_paths(&unique)
        .unwrap_or_else(|_| inherited.map(OsStr::to_os_string).unwrap_or_default())
}
