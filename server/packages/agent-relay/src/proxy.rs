//! Per-session request surface under `/v1/sessions/:id/proxy/*path`.
//!
//! Server-backed sessions are forwarded to the agent's loopback server, with
//! the config, event and message endpoints translated. In-process sessions
//! answer the same paths directly from their adapter.

use std::convert::Infallible;
use std::sync::Arc;

use agent_relay_cursor_adapter::CursorAdapter;
use agent_relay_error::RelayError;
use agent_relay_protocol::SessionUpdate;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures::{future, stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::opencode::{
    translate_config_patch, translate_messages, OpencodeEventTranslator, SseDecoder,
};
use crate::server_process::ServerProcess;
use crate::session_manager::{
    adapter_error, AgentSession, SessionBackend, SessionManager, SessionStatus,
};

const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// An inbound request addressed to one session.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    text: String,
    #[serde(default)]
    model: Option<String>,
}

pub async fn proxy_session(
    manager: &SessionManager,
    session_id: &str,
    request: ProxyRequest,
) -> Result<Response, RelayError> {
    let session = available_session(manager, session_id).await?;
    let path = request.path.trim_matches('/').to_string();
    match &session.backend {
        SessionBackend::Server(process) => {
            proxy_server(manager, &session, process, &path, request).await
        }
        SessionBackend::InProcess(adapter) => {
            proxy_in_process(&session, adapter, &path, request).await
        }
    }
}

async fn available_session(
    manager: &SessionManager,
    session_id: &str,
) -> Result<AgentSession, RelayError> {
    let unavailable = |message: String| RelayError::SessionUnavailable {
        session_id: session_id.to_string(),
        message,
    };
    let Some(session) = manager.get(session_id).await else {
        return Err(unavailable(format!(
            "session {session_id} not found or no longer available"
        )));
    };
    match session.info.status {
        SessionStatus::Running => Ok(session),
        SessionStatus::Starting => Err(unavailable("session is still starting".to_string())),
        SessionStatus::Error => Err(unavailable(
            session
                .info
                .error
                .clone()
                .unwrap_or_else(|| "session failed".to_string()),
        )),
        SessionStatus::Stopped => Err(unavailable("session has been stopped".to_string())),
    }
}

async fn proxy_server(
    manager: &SessionManager,
    session: &AgentSession,
    process: &ServerProcess,
    path: &str,
    request: ProxyRequest,
) -> Result<Response, RelayError> {
    let base_url = process.base_url();
    let segments: Vec<&str> = path.split('/').collect();
    match (&request.method, segments.as_slice()) {
        (&Method::PATCH, ["config"]) => {
            patch_config(manager, session, &base_url, request).await
        }
        (&Method::GET, ["event"]) => translated_events(manager.http(), &base_url).await,
        (&Method::GET, ["session", _, "message"]) => {
            let url = upstream_url(&base_url, path, request.query.as_deref());
            let response = manager
                .http()
                .get(url)
                .send()
                .await
                .map_err(upstream_error)?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return relay_response(response);
            }
            let native: Value = response.json().await.map_err(upstream_error)?;
            Ok(Json(translate_messages(native)).into_response())
        }
        _ => forward_raw(manager.http(), &base_url, path, request).await,
    }
}

async fn patch_config(
    manager: &SessionManager,
    session: &AgentSession,
    base_url: &str,
    request: ProxyRequest,
) -> Result<Response, RelayError> {
    let body: Value = serde_json::from_slice(&request.body)
        .map_err(|err| RelayError::invalid_argument(format!("invalid config body: {err}")))?;
    let patch = translate_config_patch(body);
    let response = manager
        .http()
        .patch(format!("{base_url}/config"))
        .json(&patch.body)
        .send()
        .await
        .map_err(upstream_error)?;

    if response.status().is_success() {
        if let Some(model) = patch.model {
            let saved = manager.stores(session.info.agent_id).and_then(|stores| {
                stores
                    .settings
                    .update(|settings| settings.preferred_model = Some(model.clone()))
                    .map_err(|err| RelayError::Storage {
                        message: err.to_string(),
                    })
            });
            if let Err(err) = saved {
                tracing::warn!(session_id = %session.info.id, error = %err, "failed to remember model");
            }
        }
    }
    relay_response(response)
}

async fn translated_events(client: &reqwest::Client, base_url: &str) -> Result<Response, RelayError> {
    let response = client
        .get(format!("{base_url}/event"))
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(upstream_error)?;
    if !response.status().is_success() {
        return relay_response(response);
    }

    // A trailing `None` marks the end of the upstream body so an
    // unterminated final event is still delivered.
    let events = response
        .bytes_stream()
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .scan(
            (SseDecoder::new(), OpencodeEventTranslator::new(), false),
            |(decoder, translator, ended), chunk| {
                if *ended {
                    return future::ready(None);
                }
                let data = match chunk {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "agent event stream ended");
                        *ended = true;
                        decoder.finish().into_iter().collect()
                    }
                    None => {
                        *ended = true;
                        decoder.finish().into_iter().collect()
                    }
                };
                let updates = data
                    .iter()
                    .flat_map(|data| translator.translate_data(data))
                    .collect::<Vec<_>>();
                future::ready(Some(updates))
            },
        )
        .flat_map(|updates| stream::iter(updates.into_iter().map(update_event)));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn forward_raw(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    request: ProxyRequest,
) -> Result<Response, RelayError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|err| RelayError::invalid_argument(err.to_string()))?;
    let mut builder = client.request(method, upstream_url(base_url, path, request.query.as_deref()));
    for (name, value) in request.headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.to_vec());
    }
    let response = builder.send().await.map_err(upstream_error)?;
    relay_response(response)
}

fn relay_response(response: reqwest::Response) -> Result<Response, RelayError> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|err| RelayError::UpstreamError {
            message: err.to_string(),
        })?;
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    Ok(relayed)
}

async fn proxy_in_process(
    session: &AgentSession,
    adapter: &Arc<CursorAdapter>,
    path: &str,
    request: ProxyRequest,
) -> Result<Response, RelayError> {
    let agent = session.info.agent_id;
    let chat_id = adapter
        .chat_id()
        .or_else(|| session.info.chat_id.clone())
        .ok_or_else(|| RelayError::SessionUnavailable {
            session_id: session.info.id.clone(),
            message: "adapter is not connected".to_string(),
        })?;

    match (&request.method, path) {
        (&Method::POST, "prompt") => {
            let body: PromptBody = serde_json::from_slice(&request.body).map_err(|err| {
                RelayError::invalid_argument(format!("invalid prompt body: {err}"))
            })?;
            if body.text.trim().is_empty() {
                return Err(RelayError::invalid_argument("prompt text is required"));
            }
            let result = adapter
                .send_prompt(&chat_id, &body.text, body.model)
                .await
                .map_err(|err| adapter_error(agent, err))?;
            Ok(Json(result).into_response())
        }
        (&Method::POST, "cancel") => {
            adapter
                .cancel(&chat_id)
                .map_err(|err| adapter_error(agent, err))?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        (&Method::GET, "event") => {
            let updates = adapter.updates();
            let events = stream::unfold(updates, |updates| async move {
                let update = updates.recv().await?;
                Some((update_event(update), updates))
            });
            Ok(Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response())
        }
        (&Method::GET, "message") => {
            let messages = adapter
                .stores()
                .messages
                .load(&chat_id)
                .map_err(|err| RelayError::Storage {
                    message: err.to_string(),
                })?;
            Ok(Json(messages).into_response())
        }
        (&Method::GET, "session") => Ok(Json(json!({
            "chatId": chat_id,
            "model": adapter.model(),
        }))
        .into_response()),
        _ => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("{} {path} is not supported for {agent}", request.method) })),
        )
            .into_response()),
    }
}

fn update_event(update: SessionUpdate) -> Result<Event, Infallible> {
    Ok(Event::default()
        .json_data(&update)
        .unwrap_or_else(|_| Event::default().comment(update.kind())))
}

fn upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("{base_url}/{path}?{query}"),
        None => format!("{base_url}/{path}"),
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn upstream_error(err: reqwest::Error) -> RelayError {
    RelayError::UpstreamError {
        message: err.to_string(),
    }
}
