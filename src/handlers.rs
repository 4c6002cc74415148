//! HTTP handlers for the query facade, liveness probe and documentation.

use crate::connector::Row;
use crate::mcp::tools::input_schema;
use crate::model::Model;
use crate::server::Gateway;
use crate::telemetry::RequestContext;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Body of every `POST /query/{name}` response.
///
/// `results` is always present, empty on failure.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub error: String,
    pub results: Vec<Row>,
}

impl QueryResponse {
    fn ok(results: Vec<Row>) -> Self {
        Self {
            success: true,
            error: String::new(),
            results,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            results: Vec::new(),
        }
    }
}

/// Decode a facade body into JSON-encoded arguments.
///
/// An empty body is an empty argument set.
pub(crate) fn decode_query_body(body: &[u8]) -> Result<HashMap<String, String>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map.into_iter().map(|(k, v)| (k, v.to_string())).collect()),
        Ok(_) => Err("request body must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON body: {e}")),
    }
}

/// `POST /query/{name}`
pub async fn query(
    State(gateway): State<Gateway>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let ctx = RequestContext::new("http");

    let args = match decode_query_body(&body) {
        Ok(args) => args,
        Err(message) => {
            debug!("{} rejected body for {}: {}", ctx.log_prefix(), name, message);
            return (StatusCode::BAD_REQUEST, Json(QueryResponse::failed(message))).into_response();
        }
    };

    // Dropping the handler (client gone) cancels the driver call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match gateway.executor().execute(&cancel, &name, &args).await {
        Ok(rows) => {
            debug!(
                "{} {} returned {} rows in {:?}",
                ctx.log_prefix(),
                name,
                rows.len(),
                ctx.elapsed()
            );
            (StatusCode::OK, Json(QueryResponse::ok(rows))).into_response()
        }
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                warn!("{} {} failed: {}", ctx.log_prefix(), name, e);
            }
            (status, Json(QueryResponse::failed(e.to_string()))).into_response()
        }
    }
}

/// `GET /heartbeat`
pub async fn heartbeat() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// `GET /llms.txt`
pub async fn llms_txt(State(gateway): State<Gateway>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        render_llms_txt(&gateway.model()),
    )
        .into_response()
}

/// `GET /docs`
pub async fn docs(State(gateway): State<Gateway>) -> Json<Value> {
    Json(render_docs(&gateway.model()))
}

/// Markdown index of every query in the model.
pub fn render_llms_txt(model: &Model) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", model.name);
    let _ = writeln!(
        out,
        "> Version {}. Each query is served at `POST /query/<name>` and as an MCP tool at `/mcp`.\n",
        model.version
    );
    let _ = writeln!(out, "## Queries\n");

    for query in &model.queries {
        let _ = writeln!(out, "### {}\n", query.name);
        if !query.description.is_empty() {
            let _ = writeln!(out, "{}\n", query.description);
        }
        let _ = writeln!(out, "- Endpoint: `POST /query/{}`", query.name);
        if let Some(adapter) = query.adapter_name() {
            let _ = writeln!(out, "- Adapter: `{adapter}`");
        }
        if query.inputs.is_empty() {
            let _ = writeln!(out, "- Inputs: none");
        } else {
            let _ = writeln!(out, "- Inputs:");
            for input in &query.inputs {
                let presence = if input.optional { "optional" } else { "required" };
                let _ = write!(out, "  - `{}` ({}, {}", input.name, input.input_type, presence);
                if let Some(default) = &input.default {
                    let _ = write!(out, ", default `{default}`");
                }
                let _ = write!(out, ")");
                if !input.description.is_empty() {
                    let _ = write!(out, ": {}", input.description);
                }
                out.push('\n');
            }
        }
        if let Some(data) = &query.data {
            let _ = writeln!(out, "- Returns: {data}");
        }
        out.push('\n');
    }

    out
}

/// JSON description of the model's queries.
pub fn render_docs(model: &Model) -> Value {
    let queries: Vec<Value> = model
        .queries
        .iter()
        .map(|query| {
            let policy = model.effective_cache_policy(query);
            json!({
                "name": query.name,
                "description": query.description,
                "endpoint": format!("/query/{}", query.name),
                "adapter": query.adapter_name(),
                "inputs": query.inputs.iter().map(|input| json!({
                    "name": input.name,
                    "type": input.input_type.as_str(),
                    "optional": input.optional,
                    "default": input.default,
                    "description": input.description,
                })).collect::<Vec<_>>(),
                "inputSchema": input_schema(query),
                "data": query.data,
                "cache": { "enabled": policy.is_active(), "ttl": policy.ttl_seconds },
            })
        })
        .collect();

    json!({
        "name": model.name,
        "version": model.version,
        "endpoints": {
            "query": "/query/{name}",
            "mcp": "/mcp",
            "heartbeat": "/heartbeat",
            "llms": "/llms.txt",
        },
        "queries": queries,
    })
}
