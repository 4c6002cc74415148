//! Binary RPC facade.
//!
//! Each frame is a big-endian length prefix followed by a bincode-encoded
//! envelope. Arguments, rows and schemas cross the boundary as JSON text so
//! their types survive the trip. A connection handles one request at a time;
//! clients open several connections for concurrency.

use crate::constants::RPC_MAX_FRAME_LENGTH;
use crate::mcp::tools::{call_tool, list_tools, ToolDescriptor};
use crate::server::Gateway;
use crate::telemetry::RequestContext;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised by the RPC client or a connection task.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected response to request {0}")]
    UnexpectedResponse(u64),
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: RpcMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcMethod {
    /// Run a query. Each input value is JSON text.
    ExecuteQuery {
        query_name: String,
        inputs: HashMap<String, String>,
    },
    ListTools,
    /// Run a query as a tool. Each argument value is JSON text.
    CallTool {
        name: String,
        arguments: HashMap<String, String>,
    },
}

/// Response envelope. `id` echoes the request; it is 0 when the request
/// could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: RpcResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResult {
    ExecuteQuery(ExecuteQueryResponse),
    ListTools(Vec<RpcTool>),
    CallTool(CallToolResponse),
    /// The frame was not a valid request.
    Error(String),
}

/// Mirrors the HTTP facade body; each entry of `results` is one JSON row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteQueryResponse {
    pub success: bool,
    pub error: String,
    pub results: Vec<String>,
}

impl ExecuteQueryResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcTool {
    pub name: String,
    pub description: String,
    /// JSON schema of the inputs, as JSON text.
    pub input_schema: String,
}

impl From<ToolDescriptor> for RpcTool {
    fn from(tool: ToolDescriptor) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResponse {
    pub content: String,
    pub is_error: bool,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(RPC_MAX_FRAME_LENGTH)
        .new_codec()
}

/// Answer one request against the gateway's current runtime.
pub async fn dispatch(
    gateway: &Gateway,
    cancel: &CancellationToken,
    request: RpcRequest,
) -> RpcResponse {
    let ctx = RequestContext::new("rpc");
    let id = request.id;

    let result = match request.method {
        RpcMethod::ExecuteQuery { query_name, inputs } => {
            let response = match gateway.executor().execute(cancel, &query_name, &inputs).await {
                Ok(rows) => match rows
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<Result<Vec<_>, _>>()
                {
                    Ok(results) => ExecuteQueryResponse {
                        success: true,
                        error: String::new(),
                        results,
                    },
                    Err(e) => ExecuteQueryResponse::failed(format!("Failed to encode rows: {e}")),
                },
                Err(e) => ExecuteQueryResponse::failed(e.to_string()),
            };
            debug!(
                "{} ExecuteQuery {} success={} in {:?}",
                ctx.log_prefix(),
                query_name,
                response.success,
                ctx.elapsed()
            );
            RpcResult::ExecuteQuery(response)
        }
        RpcMethod::ListTools => RpcResult::ListTools(
            list_tools(&gateway.model())
                .into_iter()
                .map(RpcTool::from)
                .collect(),
        ),
        RpcMethod::CallTool { name, arguments } => {
            let output = call_tool(&gateway.executor(), cancel, &name, &arguments).await;
            debug!(
                "{} CallTool {} is_error={} in {:?}",
                ctx.log_prefix(),
                name,
                output.is_error,
                ctx.elapsed()
            );
            RpcResult::CallTool(CallToolResponse {
                content: output.text,
                is_error: output.is_error,
            })
        }
    };

    RpcResponse { id, result }
}

/// Bind `addr` and serve until the gateway's shutdown signal.
pub async fn serve(gateway: Gateway, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, gateway).await
}

/// Serve on an already bound listener.
///
/// Stops accepting on shutdown, then waits for open connections to finish
/// the request they are working on.
pub async fn serve_on(listener: TcpListener, gateway: Gateway) -> anyhow::Result<()> {
    info!("RPC server listening on {}", listener.local_addr()?);

    let mut shutdown = gateway.shutdown().signal();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("RPC server received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("RPC connection from {}", peer);
                    let gateway = gateway.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, gateway).await {
                            debug!("RPC connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("RPC accept failed: {}", e),
            },
        }
        while connections.try_join_next().is_some() {}
    }

    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(stream: TcpStream, gateway: Gateway) -> Result<(), RpcError> {
    let mut framed = Framed::new(stream, codec());
    let mut shutdown = gateway.shutdown().signal();

    // Aborting the connection task cancels its driver call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else { break };
        let frame = frame?;

        let response = match bincode::deserialize::<RpcRequest>(&frame) {
            Ok(request) => dispatch(&gateway, &cancel, request).await,
            Err(e) => RpcResponse {
                id: 0,
                result: RpcResult::Error(format!("Malformed request: {e}")),
            },
        };
        framed
            .send(Bytes::from(bincode::serialize(&response)?))
            .await?;
    }

    Ok(())
}

/// Client for the binary RPC facade.
pub struct RpcClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, codec()),
            next_id: 0,
        })
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, method: RpcMethod) -> Result<RpcResult, RpcError> {
        self.next_id += 1;
        let id = self.next_id;

        let request = bincode::serialize(&RpcRequest { id, method })?;
        self.framed.send(Bytes::from(request)).await?;

        let frame = self.framed.next().await.ok_or(RpcError::Closed)??;
        let response: RpcResponse = bincode::deserialize(&frame)?;
        match response.result {
            RpcResult::Error(message) => Err(RpcError::Remote(message)),
            _ if response.id != id => Err(RpcError::UnexpectedResponse(id)),
            result => Ok(result),
        }
    }

    pub async fn execute_query(
        &mut self,
        query_name: impl Into<String>,
        inputs: HashMap<String, String>,
    ) -> Result<ExecuteQueryResponse, RpcError> {
        let method = RpcMethod::ExecuteQuery {
            query_name: query_name.into(),
            inputs,
        };
        match self.call(method).await? {
            RpcResult::ExecuteQuery(response) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse(self.next_id)),
        }
    }

    pub async fn list_tools(&mut self) -> Result<Vec<RpcTool>, RpcError> {
        match self.call(RpcMethod::ListTools).await? {
            RpcResult::ListTools(tools) => Ok(tools),
            _ => Err(RpcError::UnexpectedResponse(self.next_id)),
        }
    }

    pub async fn call_tool(
        &mut self,
        name: impl Into<String>,
        arguments: HashMap<String, String>,
    ) -> Result<CallToolResponse, RpcError> {
        let method = RpcMethod::CallTool {
            name: name.into(),
            arguments,
        };
        match self.call(method).await? {
            RpcResult::CallTool(response) => Ok(response),
            _ => Err(RpcError::UnexpectedResponse(self.next_id)),
        }
    }

    /// Send a raw frame, bypassing the envelope encoding.
    pub async fn send_raw(&mut self, frame: Vec<u8>) -> Result<RpcResponse, RpcError> {
        self.framed.send(Bytes::from(frame)).await?;
        let frame = self.framed.next().await.ok_or(RpcError::Closed)??;
        Ok(bincode::deserialize(&frame)?)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    #[test]
    fn test_tool_schema_travels_as_json_text() {
        let model = Model::from_yaml_str(
            r#"
adapters:
  - { name: kv, connector: redis, connection_string: "redis://localhost" }
queries:
  - name: get-key
    description: Read a key
    use: [kv]
    statement: "GET {{ inputs.key }}"
    inputs:
      - { name: key, type: string }
"#,
        )
        .unwrap();

        let tool = RpcTool::from(list_tools(&model).remove(0));
        assert_eq!(tool.name, "get-key");
        let schema: serde_json::Value = serde_json::from_str(&tool.input_schema).unwrap();
        assert_eq!(schema["required"][0], "key");
    }

    #[test]
    fn test_failed_response_has_no_rows() {
        let response = ExecuteQueryResponse::failed("nope");
        assert!(!response.success);
        assert!(response.results.is_empty());
    }
}
