//! # Terse Gateway
//!
//! A declarative data-access gateway. A model file names data-source
//! adapters and parameterised statements ("queries"); the gateway exposes
//! every query as:
//!
//! - **HTTP**: `POST /query/{name}` with a JSON body of inputs
//! - **MCP**: a tool over streamable HTTP JSON-RPC at `/mcp`
//! - **RPC**: a method on the length-delimited bincode facade
//!
//! ## Pipeline
//!
//! Each call validates and coerces the inputs, expands `{{ env.X }}` and
//! `{{ inputs.X }}` placeholders, probes the result cache, runs the statement
//! on the adapter's connector (PostgreSQL, SQL Server, Redis or MongoDB) and
//! admits the rows to the cache when the query's policy allows.

pub mod cache;
pub mod config;
pub mod connector;
pub mod constants;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod mcp;
pub mod model;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use connector::{ConnectorFactory, DriverFactory};
pub use error::GatewayError;
pub use executor::Executor;
pub use model::Model;
pub use server::Gateway;
