//! MCP over streamable HTTP.
//!
//! One endpoint, `/mcp`:
//!
//! - `POST` carries JSON-RPC frames (single or batched). Requests get a JSON
//!   response, notifications get `202 Accepted` with no body.
//! - `GET` opens an SSE stream for server-initiated messages, with a comment
//!   keep-alive until the client leaves or the server shuts down.
//! - `DELETE` terminates a session.
//!
//! Session state is advisory: requests carrying an unknown session id, or
//! none, are served all the same.

pub mod jsonrpc;
pub mod session;
pub mod tools;

use crate::constants::{MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER};
use crate::server::Gateway;
use crate::telemetry::RequestContext;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{self, BoxStream, StreamExt};
use jsonrpc::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use session::{is_valid_session_id, negotiate_protocol_version};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct InitializeParams {
    #[serde(default, rename = "protocolVersion")]
    protocol_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

type RpcResult = Result<Value, (i64, String)>;

/// Per-POST dispatch state.
struct Dispatcher<'a> {
    gateway: &'a Gateway,
    cancel: &'a CancellationToken,
    ctx: &'a RequestContext,
    session_id: Option<&'a str>,
    created_session: Option<String>,
}

impl Dispatcher<'_> {
    /// Handle one frame; `None` means nothing is sent back.
    async fn handle_frame(&mut self, frame: Value) -> Option<JsonRpcResponse> {
        let id_hint = frame.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(frame) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    id_hint,
                    INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ))
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(
                request.response_id(),
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
        }

        if request.is_notification() {
            self.handle_notification(&request);
            return None;
        }

        debug!("{} method={}", self.ctx.log_prefix(), request.method);
        let id = request.response_id();
        Some(match self.handle_request(&request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err((code, message)) => JsonRpcResponse::failure(id, code, message),
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "initialized" | "notifications/initialized" => {
                if let Some(id) = self.session_id {
                    self.gateway.sessions().mark_ready(id);
                }
            }
            other => debug!("{} ignoring notification {}", self.ctx.log_prefix(), other),
        }
    }

    async fn handle_request(&mut self, request: &JsonRpcRequest) -> RpcResult {
        match request.method.as_str() {
            "initialize" => self.initialize(request.params.as_ref()),
            "initialized" | "notifications/initialized" => {
                self.handle_notification(request);
                Ok(json!({}))
            }
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = tools::list_tools(&self.gateway.model());
                serde_json::to_value(tools)
                    .map(|tools| json!({ "tools": tools }))
                    .map_err(|e| (INTERNAL_ERROR, format!("failed to encode tools: {e}")))
            }
            "tools/call" => self.call_tool(request.params.as_ref()).await,
            other => Err((METHOD_NOT_FOUND, format!("method '{other}' not found"))),
        }
    }

    fn initialize(&mut self, params: Option<&Value>) -> RpcResult {
        let requested = params
            .cloned()
            .map(serde_json::from_value::<InitializeParams>)
            .transpose()
            .map_err(|e| (INVALID_PARAMS, format!("invalid initialize params: {e}")))?
            .and_then(|p| p.protocol_version);

        // Unknown versions degrade to the default without complaint.
        let (version, _) = negotiate_protocol_version(requested.as_deref());
        let session = self.gateway.sessions().create(version);
        info!(
            "{} initialize: session={} protocol={}",
            self.ctx.log_prefix(),
            session.id,
            version
        );
        self.created_session = Some(session.id.clone());

        let model = self.gateway.model();
        Ok(json!({
            "protocolVersion": version,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": model.name, "version": model.version },
        }))
    }

    async fn call_tool(&self, params: Option<&Value>) -> RpcResult {
        let params: CallToolParams = params
            .cloned()
            .ok_or_else(|| (INVALID_PARAMS, "missing params".to_string()))
            .and_then(|p| {
                serde_json::from_value(p)
                    .map_err(|e| (INVALID_PARAMS, format!("invalid tools/call params: {e}")))
            })?;

        let arguments = params
            .arguments
            .as_ref()
            .map(tools::encode_arguments)
            .unwrap_or_default();

        let executor = self.gateway.executor();
        let output = tools::call_tool(&executor, self.cancel, &params.name, &arguments).await;
        if output.is_error {
            debug!(
                "{} tools/call {} failed: {}",
                self.ctx.log_prefix(),
                params.name,
                output.text
            );
        }
        Ok(output.to_json())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn rpc_response(status: StatusCode, body: impl serde::Serialize) -> Response {
    (status, Json(body)).into_response()
}

/// `POST /mcp`
pub async fn post(State(gateway): State<Gateway>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = RequestContext::new("mcp");
    // Dropping the handler (client gone) cancels the driver call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let frame: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("parse error: {e}")),
            )
        }
    };

    if let Some(requested) = header_str(&headers, MCP_PROTOCOL_VERSION_HEADER) {
        let (version, known) = negotiate_protocol_version(Some(requested));
        if !known {
            warn!(
                "{} unsupported protocol version '{}', using {}",
                ctx.log_prefix(),
                requested,
                version
            );
        }
    }

    let mut dispatcher = Dispatcher {
        gateway: &gateway,
        cancel: &cancel,
        ctx: &ctx,
        session_id: header_str(&headers, MCP_SESSION_ID_HEADER),
        created_session: None,
    };

    let mut response = match frame {
        Value::Array(frames) if frames.is_empty() => rpc_response(
            StatusCode::BAD_REQUEST,
            JsonRpcResponse::failure(Value::Null, INVALID_REQUEST, "empty batch"),
        ),
        Value::Array(frames) => {
            let mut replies = Vec::with_capacity(frames.len());
            for frame in frames {
                if let Some(reply) = dispatcher.handle_frame(frame).await {
                    replies.push(reply);
                }
            }
            if replies.is_empty() {
                StatusCode::ACCEPTED.into_response()
            } else {
                rpc_response(StatusCode::OK, replies)
            }
        }
        frame => match dispatcher.handle_frame(frame).await {
            None => StatusCode::ACCEPTED.into_response(),
            Some(reply) => {
                let status = match &reply.error {
                    Some(e) if e.code == INVALID_REQUEST => StatusCode::BAD_REQUEST,
                    _ => StatusCode::OK,
                };
                rpc_response(status, reply)
            }
        },
    };

    if let Some(id) = dispatcher.created_session {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
    }
    debug!("{} completed in {:?}", ctx.log_prefix(), ctx.elapsed());
    response
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}

fn relay(rx: broadcast::Receiver<Value>) -> BoxStream<'static, Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let event = Event::default().event("message").data(message.to_string());
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE stream lagged, {} messages dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// `GET /mcp`
pub async fn stream(State(gateway): State<Gateway>, headers: HeaderMap) -> Response {
    if !accepts_event_stream(&headers) {
        return (
            StatusCode::BAD_REQUEST,
            "GET /mcp requires Accept: text/event-stream",
        )
            .into_response();
    }

    let session_id = header_str(&headers, MCP_SESSION_ID_HEADER);
    let messages = match session_id.and_then(|id| gateway.sessions().get(id)) {
        Some(session) => relay(session.subscribe()),
        None => stream::pending::<Result<Event, Infallible>>().boxed(),
    };
    debug!(session = ?session_id, "SSE stream opened");

    let mut shutdown = gateway.shutdown().signal();
    let events = messages.take_until(async move { shutdown.recv().await });

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(gateway.sse_keepalive())
                .text("keep-alive"),
        )
        .into_response()
}

/// `DELETE /mcp`
pub async fn delete(State(gateway): State<Gateway>, headers: HeaderMap) -> Response {
    match header_str(&headers, MCP_SESSION_ID_HEADER) {
        None => (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id header").into_response(),
        Some(id) if !is_valid_session_id(id) => {
            (StatusCode::BAD_REQUEST, "malformed Mcp-Session-Id header").into_response()
        }
        Some(id) => {
            gateway.sessions().remove(id);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}
