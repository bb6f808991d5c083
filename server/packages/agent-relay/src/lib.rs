//! Session orchestration and protocol adaptation for coding agents.

pub mod cli;
pub mod default_model;
pub mod opencode;
pub mod proxy;
pub mod router;
pub mod server_process;
pub mod session_manager;
