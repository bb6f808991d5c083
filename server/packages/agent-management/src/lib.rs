pub mod agents;

pub use agents::{
    extended_path, extended_path_from, find_in_path, parse_agent, resolve_binary,
    resolve_binary_in, AdapterKind, AgentError, AgentId, AgentInfo,
};
