//! Centralized constants for the gateway.
//!
//! This module contains the magic numbers and default values used throughout
//! the codebase, making them easy to find, understand, and modify.

use std::time::Duration;

// =============================================================================
// HTTP Constants
// =============================================================================

/// Default HTTP bind host.
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default per-request hard deadline in seconds (not applied to SSE).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default time a client has to send complete request headers.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 15;

/// Default time a connection may sit without reads or writes before closing.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default maximum request body size in bytes.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Interval between SSE keep-alive comments.
pub const DEFAULT_SSE_KEEPALIVE_SECS: u64 = 10;

/// SSE keep-alive interval as Duration.
pub const DEFAULT_SSE_KEEPALIVE: Duration = Duration::from_secs(DEFAULT_SSE_KEEPALIVE_SECS);

// =============================================================================
// MCP Constants
// =============================================================================

/// Streamable HTTP endpoint path.
pub const MCP_PATH: &str = "/mcp";

/// `Mcp-Session-Id` header name.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// `MCP-Protocol-Version` header name.
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Protocol version assumed when the client sends none or an unknown one.
pub const MCP_DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version this server speaks.
pub const MCP_SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Number of random bytes in a session id.
pub const MCP_SESSION_ID_BYTES: usize = 16;

/// Capacity of the per-session server-initiated message channel.
pub const MCP_SESSION_CHANNEL_CAPACITY: usize = 128;

// =============================================================================
// Cache Constants
// =============================================================================

/// Default maximum cache cost in MiB.
pub const DEFAULT_CACHE_MAX_COST_MB: u64 = 128;

/// Default TTL applied when a policy enables caching without a TTL.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 60;

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default time the HTTP server is given to drain in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 15;

/// Default drain timeout as Duration.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS);

// =============================================================================
// RPC Constants
// =============================================================================

/// Maximum size of one RPC frame in bytes.
pub const RPC_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

// =============================================================================
// Logging Constants
// =============================================================================

/// Default truncation length for statement logging.
pub const LOG_STATEMENT_TRUNCATE_LENGTH: usize = 200;

// =============================================================================
// Telemetry Constants
// =============================================================================

/// Upper bounds (inclusive, in milliseconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: &[u64] = &[1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_durations() {
        assert_eq!(DEFAULT_SSE_KEEPALIVE, Duration::from_secs(10));
        assert_eq!(DEFAULT_DRAIN_TIMEOUT, Duration::from_secs(15));
    }

    #[test]
    fn test_default_protocol_is_supported() {
        assert!(MCP_SUPPORTED_PROTOCOL_VERSIONS.contains(&MCP_DEFAULT_PROTOCOL_VERSION));
    }

    #[test]
    fn test_latency_buckets_sorted() {
        assert!(LATENCY_BUCKETS_MS.windows(2).all(|w| w[0] < w[1]));
    }
}
