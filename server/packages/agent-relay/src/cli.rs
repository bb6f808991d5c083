use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agent_relay_session_store::resolve_data_dir;
use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{
    build_router_with_state, shutdown_sessions, AgentListResponse, AppState,
    CreateSessionRequest, StopSessionResponse,
};
use crate::session_manager::{SessionInfo, SessionManagerConfig, SessionPage};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay", version)]
#[command(about = "Launch coding agents and talk to them through one API")]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Defaults to $AGENT_RELAY_DATA_DIR, then ~/.agent-relay.
    #[arg(long = "data-dir", short = 'd')]
    data_dir: Option<PathBuf>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Inspect registered agents.
    Agents(AgentsArgs),
    /// Create, list and stop sessions.
    Sessions(SessionsArgs),
}

#[derive(Args, Debug)]
pub struct AgentsArgs {
    #[command(subcommand)]
    command: AgentsCommand,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    command: SessionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum AgentsCommand {
    /// List registered agents and their resolved binaries.
    List(ClientArgs),
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List live sessions, newest first.
    List(ListSessionsArgs),
    /// Launch a session for an agent.
    Create(CreateSessionArgs),
    /// Stop a session.
    Stop(StopSessionArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListSessionsArgs {
    #[arg(long)]
    page: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct CreateSessionArgs {
    /// Agent id, e.g. `opencode` or `cursor`.
    agent: String,
    #[arg(long, short = 'C')]
    project_dir: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    resume: Option<String>,
    #[arg(long)]
    debug: bool,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct StopSessionArgs {
    session_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Api(subcommand) => run_api(&subcommand.command),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = SessionManagerConfig {
        data_dir: resolve_data_dir(server.data_dir.clone()),
        ..SessionManagerConfig::default()
    };
    let data_dir = config.data_dir.clone();
    let state = Arc::new(AppState::new(config));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, data_dir = ?data_dir, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down, stopping sessions");
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_api(command: &ApiCommand) -> Result<(), CliError> {
    match command {
        ApiCommand::Agents(subcommand) => run_agents(&subcommand.command),
        ApiCommand::Sessions(subcommand) => run_sessions(&subcommand.command),
    }
}

fn run_agents(command: &AgentsCommand) -> Result<(), CliError> {
    match command {
        AgentsCommand::List(args) => {
            let ctx = ClientContext::new(args)?;
            let response = ctx.get(&format!("{API_PREFIX}/agents"))?;
            print_json_response::<AgentListResponse>(response)
        }
    }
}

fn run_sessions(command: &SessionsCommand) -> Result<(), CliError> {
    match command {
        SessionsCommand::List(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.get_with_query(
                &format!("{API_PREFIX}/sessions"),
                &[
                    ("page", args.page.map(|page| page.to_string())),
                    ("page_size", args.page_size.map(|size| size.to_string())),
                ],
            )?;
            print_json_response::<SessionPage>(response)
        }
        SessionsCommand::Create(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let project_dir = match &args.project_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir()?,
            };
            let body = CreateSessionRequest {
                agent_id: args.agent.clone(),
                project_dir: project_dir.to_string_lossy().into_owned(),
                api_key: args.api_key.clone(),
                resume_session_id: args.resume.clone(),
                debug: args.debug,
            };
            let response = ctx.post(&format!("{API_PREFIX}/sessions"), &body)?;
            print_json_response::<SessionInfo>(response)
        }
        SessionsCommand::Stop(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let response = ctx.delete_with_query(
                &format!("{API_PREFIX}/sessions"),
                &[("id", Some(args.session_id.clone()))],
            )?;
            print_json_response::<StopSessionResponse>(response)
        }
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        // No origins configured: deny all cross-origin requests.
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.request(method, self.url(path));
        for (key, value) in query {
            if let Some(value) = value {
                builder = builder.query(&[(key, value)]);
            }
        }
        builder
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path, &[]).send()?)
    }

    fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path, query).send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path, &[]).json(body).send()?)
    }

    fn delete_with_query(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::DELETE, path, query).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        AgentRelayCli::command().debug_assert();
    }

    #[test]
    fn server_flags_parse() {
        let cli = AgentRelayCli::try_parse_from([
            "agent-relay",
            "server",
            "--port",
            "9000",
            "--data-dir",
            "/srv/relay",
            "-O",
            "http://localhost:5173",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, 9000);
        assert_eq!(args.host, DEFAULT_HOST);
        assert_eq!(args.data_dir, Some(PathBuf::from("/srv/relay")));
        assert!(build_cors_layer(&args).is_ok());
    }

    #[test]
    fn bad_cors_origin_is_rejected() {
        let cli = AgentRelayCli::try_parse_from(["agent-relay", "server", "-O", "bad\norigin"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
