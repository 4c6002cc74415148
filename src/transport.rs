//! HTTP transport.
//!
//! Serves every surface of the gateway from one axum router:
//!
//! - `POST /query/{name}`: per-query facade
//! - `POST|GET|DELETE|OPTIONS /mcp`: MCP streamable HTTP
//! - `GET /heartbeat`: liveness probe
//! - `GET /llms.txt`, `GET /docs`: model documentation
//!
//! Handlers resolve the current runtime on every request, so a model reload
//! is picked up without rebinding the listener.

use crate::config::{env_flag, env_parse};
use crate::constants::{
    DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_BODY_SIZE,
    DEFAULT_READ_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS, MCP_PATH,
    MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER,
};
use crate::handlers;
use crate::mcp;
use crate::server::Gateway;
use crate::shutdown::ShutdownSignal;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method, Request};
use axum::routing::{get, post};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Host to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Enable request tracing via tower-http TraceLayer.
    pub enable_tracing: bool,

    /// Hard per-request deadline in seconds. The SSE stream is exempt.
    pub request_timeout_seconds: u64,

    /// Seconds a client has to send complete request headers.
    pub read_timeout_seconds: u64,

    /// Seconds a connection may go without reads or writes before it closes.
    pub idle_timeout_seconds: u64,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HTTP_HOST.to_string(),
            port: DEFAULT_HTTP_PORT,
            enable_tracing: true,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
            read_timeout_seconds: DEFAULT_READ_TIMEOUT_SECS,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl HttpConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("TERSE_HTTP_HOST") {
            if !host.trim().is_empty() {
                config.host = host.trim().to_string();
            }
        }
        if let Some(port) = env_parse("TERSE_HTTP_PORT") {
            config.port = port;
        }
        if let Some(tracing) = env_flag("TERSE_HTTP_TRACING") {
            config.enable_tracing = tracing;
        }
        if let Some(timeout) = env_parse::<u64>("TERSE_HTTP_TIMEOUT").filter(|t| *t > 0) {
            config.request_timeout_seconds = timeout;
        }
        if let Some(timeout) = env_parse::<u64>("TERSE_HTTP_READ_TIMEOUT").filter(|t| *t > 0) {
            config.read_timeout_seconds = timeout;
        }
        if let Some(timeout) = env_parse::<u64>("TERSE_HTTP_IDLE_TIMEOUT").filter(|t| *t > 0) {
            config.idle_timeout_seconds = timeout;
        }
        if let Some(max) = env_parse::<usize>("TERSE_HTTP_MAX_BODY").filter(|m| *m > 0) {
            config.max_body_size = max;
        }

        config
    }

    /// `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build the application router for a gateway.
pub fn router(gateway: Gateway, config: &HttpConfig) -> Router {
    let timeout = TimeoutLayer::new(Duration::from_secs(config.request_timeout_seconds));

    // GET /mcp is a long-lived stream and must not inherit the request deadline.
    // OPTIONS is answered by the CORS layer.
    let mcp_routes = get(mcp::stream).merge(
        post(mcp::post)
            .delete(mcp::delete)
            .layer(timeout.clone()),
    );

    let app = Router::new()
        .route("/query/{name}", post(handlers::query))
        .route("/heartbeat", get(handlers::heartbeat))
        .route("/llms.txt", get(handlers::llms_txt))
        .route("/docs", get(handlers::docs))
        .layer(timeout)
        .route(MCP_PATH, mcp_routes.layer(mcp_cors()))
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .with_state(gateway);

    if config.enable_tracing {
        app.layer(TraceLayer::new_for_http())
    } else {
        app
    }
}

fn mcp_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(MCP_PROTOCOL_VERSION_HEADER),
            HeaderName::from_static(MCP_SESSION_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(MCP_SESSION_ID_HEADER)])
}

/// Bind the configured address and serve until the gateway's shutdown signal.
///
/// Returns once every in-flight request has finished; callers bound the wait
/// with the drain timeout.
pub async fn serve(gateway: Gateway, config: HttpConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    serve_on(listener, gateway, config).await
}

/// Serve on an already bound listener.
///
/// Each connection gets a header read deadline and is closed once it has
/// seen no traffic for the idle timeout.
pub async fn serve_on(
    listener: TcpListener,
    gateway: Gateway,
    config: HttpConfig,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    let mut shutdown_signal = gateway.shutdown().signal();
    let app = router(gateway.clone(), &config);
    let limits = ConnectionLimits {
        read_timeout: Duration::from_secs(config.read_timeout_seconds),
        idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
    };

    info!("HTTP server listening on http://{}", local);
    info!("MCP endpoint: http://{}{}", local, MCP_PATH);
    if config.enable_tracing {
        info!("Request tracing enabled");
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_signal.recv() => {
                info!("HTTP server received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("HTTP accept failed: {}", e);
                        continue;
                    }
                };
                debug!(%peer, "HTTP connection accepted");
                connections.spawn(serve_connection(
                    stream,
                    app.clone(),
                    limits,
                    gateway.shutdown().signal(),
                ));
            }
        }
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    read_timeout: Duration,
    idle_timeout: Duration,
}

async fn serve_connection(
    stream: TcpStream,
    app: Router,
    limits: ConnectionLimits,
    mut shutdown_signal: ShutdownSignal,
) {
    let activity = Activity::new();
    let tracked = TokioIo::new(TrackedStream {
        inner: stream,
        activity: Arc::clone(&activity),
    });
    let service =
        TowerToHyperService::new(app.map_request(|req: Request<Incoming>| req.map(Body::new)));

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.read_timeout);
    let conn = builder.serve_connection_with_upgrades(tracked, service);
    tokio::pin!(conn);

    // First idle period or shutdown asks hyper to finish the in-flight
    // request; a second idle period drops the socket.
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("HTTP connection ended: {}", e);
                }
                return;
            }
            _ = shutdown_signal.recv(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = activity.idle_for(limits.idle_timeout) => {
                if draining {
                    debug!("Dropping idle HTTP connection");
                    return;
                }
                debug!("Closing idle HTTP connection");
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Last read or write on a connection, as milliseconds since it opened.
struct Activity {
    opened: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    fn touch(&self) {
        let now = self.opened.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    /// Resolve once the connection has gone `idle` without traffic.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let last = self.opened + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

struct TrackedStream {
    inner: TcpStream,
    activity: Arc<Activity>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            self.activity.touch();
        }
        result
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
