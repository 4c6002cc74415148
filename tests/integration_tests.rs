//! Integration tests against a real PostgreSQL server.
//!
//! These tests support two modes:
//! 1. **Testcontainers** (default): starts a PostgreSQL container
//! 2. **External server**: connects to an existing server via `PG_HOST`
//!
//! ## Running with testcontainers (requires Docker):
//! ```bash
//! cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Running against an external server:
//! ```bash
//! PG_HOST=localhost PG_PORT=5432 PG_PASSWORD=postgres \
//!   cargo test --test integration_tests -- --ignored --test-threads=1
//! ```

#![cfg(feature = "postgres")]

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use terse_gateway::transport::{router, HttpConfig};
use terse_gateway::{Config, DriverFactory, Gateway, GatewayError, Model};
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Check if we should use an external server (vs testcontainers).
fn use_external_server() -> bool {
    std::env::var("PG_HOST").is_ok()
}

/// Test database connection source.
#[allow(dead_code)] // Variants held for lifetime management (Drop trait)
enum TestDatabaseSource {
    External,
    Container(Box<ContainerAsync<Postgres>>),
}

/// Helper struct to manage the test database.
struct TestDatabase {
    #[allow(dead_code)] // Held for lifetime management (Drop trait on Container)
    source: TestDatabaseSource,
    host: String,
    port: u16,
    password: String,
}

impl TestDatabase {
    async fn new() -> Self {
        if use_external_server() {
            Self::from_external()
        } else {
            Self::from_testcontainer().await
        }
    }

    fn from_external() -> Self {
        let host = std::env::var("PG_HOST").expect("PG_HOST must be set");
        let port = std::env::var("PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432);
        let password = std::env::var("PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string());

        eprintln!("Using external PostgreSQL at {}:{}", host, port);

        Self {
            source: TestDatabaseSource::External,
            host,
            port,
            password,
        }
    }

    async fn from_testcontainer() -> Self {
        eprintln!("Starting PostgreSQL container via testcontainers...");

        let container = Postgres::default()
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start PostgreSQL container: {}", e));

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        eprintln!("PostgreSQL container ready at {}:{}", host, port);

        Self {
            source: TestDatabaseSource::Container(Box::new(container)),
            host: host.to_string(),
            port,
            password: "postgres".to_string(),
        }
    }

    fn connection_string(&self) -> String {
        format!(
            "postgres://postgres:{}@{}:{}/postgres",
            self.password, self.host, self.port
        )
    }

    /// Run setup statements outside the gateway.
    async fn setup(&self, sql: &str) {
        let (client, connection) = tokio_postgres::connect(&self.connection_string(), NoTls)
            .await
            .expect("Failed to connect to PostgreSQL");
        tokio::spawn(connection);
        client
            .batch_execute(sql)
            .await
            .expect("Setup statements failed");
    }

    /// Start a gateway with the real driver factory over this database.
    async fn gateway(&self, queries: &str) -> Gateway {
        let model = format!(
            r#"
name: integration
adapters:
  - name: pg
    connector: postgres
    connection_string: "{}"
    options: {{ application_name: terse-gateway-tests }}
queries:
{}"#,
            self.connection_string(),
            queries
        );
        Gateway::start(
            Model::from_yaml_str(&model).expect("model must parse"),
            Arc::new(DriverFactory),
            &Config::new("integration.yaml"),
        )
        .await
        .expect("gateway must start")
    }
}

fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Connector tests
// =============================================================================

mod connector_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_simple_query() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway("  - { name: one, use: [pg], statement: \"SELECT 1 AS one, 'x' AS letter\" }\n")
            .await;

        let rows = gateway
            .executor()
            .execute(&CancellationToken::new(), "one", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(
            terse_gateway::connector::rows_to_json(&rows),
            r#"[{"one":1,"letter":"x"}]"#
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_data_types() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway(
                r#"  - name: types
    use: [pg]
    statement: >-
      SELECT 42::int8 AS big, 1.5::float8 AS ratio, true AS flag,
             12.340::numeric(10,3) AS amount, NULL::text AS nothing,
             '2024-01-02 03:04:05'::timestamp AS at,
             '2024-01-02'::date AS day,
             'a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11'::uuid AS id,
             '{"k":[1,2]}'::jsonb AS doc,
             ARRAY[1,2,3]::int4[] AS nums
"#,
            )
            .await;

        let rows = gateway
            .executor()
            .execute(&CancellationToken::new(), "types", &HashMap::new())
            .await
            .unwrap();
        let row: Value =
            serde_json::from_str(&terse_gateway::connector::rows_to_json(&rows)).unwrap();

        assert_eq!(
            row[0],
            json!({
                "big": 42,
                "ratio": 1.5,
                "flag": true,
                "amount": "12.340",
                "nothing": null,
                "at": "2024-01-02T03:04:05Z",
                "day": "2024-01-02",
                "id": "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11",
                "doc": {"k": [1, 2]},
                "nums": [1, 2, 3]
            })
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_invalid_query_syntax() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway("  - { name: broken, use: [pg], statement: \"SELEC 1\" }\n")
            .await;

        let err = gateway
            .executor()
            .execute(&CancellationToken::new(), "broken", &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Execution(_)));
        assert!(err.to_string().contains("syntax error"));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_reconnects_after_backend_terminated() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway("  - { name: one, use: [pg], statement: \"SELECT 1 AS one\" }\n")
            .await;
        let executor = gateway.executor();
        let cancel = CancellationToken::new();

        executor.execute(&cancel, "one", &HashMap::new()).await.unwrap();

        db.setup(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE application_name = 'terse-gateway-tests'",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let rows = executor.execute(&cancel, "one", &HashMap::new()).await.unwrap();
        assert_eq!(terse_gateway::connector::rows_to_json(&rows), r#"[{"one":1}]"#);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_cancellation_stops_statement() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway("  - { name: slow, use: [pg], statement: \"SELECT pg_sleep(30)\" }\n")
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            gateway.executor().execute(&cancel, "slow", &HashMap::new()),
        )
        .await
        .expect("cancelled statement must return promptly");
        assert!(result.is_err());
    }
}

// =============================================================================
// End-to-end tests
// =============================================================================

mod end_to_end_tests {
    use super::*;

    const USERS: &str = r#"
        DROP TABLE IF EXISTS gateway_users;
        CREATE TABLE gateway_users (id TEXT PRIMARY KEY, name TEXT NOT NULL, age INT);
        INSERT INTO gateway_users VALUES ('42', 'a', 30), ('43', 'O''Brien', NULL);
    "#;

    const QUERIES: &str = r#"  - name: get-user-by-id
    use: [pg]
    statement: "SELECT id, name FROM gateway_users WHERE id = {{ inputs.userId }}"
    inputs:
      - { name: userId, type: string }
    cache: { enabled: true, ttl: 60 }
  - name: users-older-than
    use: [pg]
    statement: "SELECT id FROM gateway_users WHERE age > {{ inputs.age }} ORDER BY id"
    inputs:
      - { name: age, type: int, optional: true, default: "18" }
"#;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_query_facade() {
        let db = TestDatabase::new().await;
        db.setup(USERS).await;
        let gateway = db.gateway(QUERIES).await;
        let app = router(gateway.clone(), &HttpConfig::default());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/query/get-user-by-id")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"userId":"42"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"success":true,"error":"","results":[{"id":"42","name":"a"}]}"#
        );
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_quoting_and_defaults() {
        let db = TestDatabase::new().await;
        db.setup(USERS).await;
        let gateway = db.gateway(QUERIES).await;
        let executor = gateway.executor();
        let cancel = CancellationToken::new();

        // A single quote in the input is doubled, not interpreted.
        let rows = executor
            .execute(&cancel, "get-user-by-id", &args(&[("userId", r#""O'Brien""#)]))
            .await
            .unwrap();
        assert!(rows.is_empty());

        let rows = executor
            .execute(&cancel, "users-older-than", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(terse_gateway::connector::rows_to_json(&rows), r#"[{"id":"42"}]"#);

        let rows = executor
            .execute(&cancel, "users-older-than", &args(&[("age", "40")]))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_cached_result_survives_table_change() {
        let db = TestDatabase::new().await;
        db.setup(USERS).await;
        let gateway = db.gateway(QUERIES).await;
        let executor = gateway.executor();
        let cancel = CancellationToken::new();
        let input = args(&[("userId", r#""42""#)]);

        let first = executor
            .execute(&cancel, "get-user-by-id", &input)
            .await
            .unwrap();
        db.setup("UPDATE gateway_users SET name = 'changed' WHERE id = '42'")
            .await;
        let second = executor
            .execute(&cancel, "get-user-by-id", &input)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.runtime().cache().stats().hits, 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_shutdown_closes_driver_connections() {
        let db = TestDatabase::new().await;
        let gateway = db
            .gateway("  - { name: one, use: [pg], statement: \"SELECT 1 AS one\" }\n")
            .await;
        let controller = Arc::clone(gateway.shutdown());

        controller.graceful_shutdown(&gateway, async {}).await;

        assert_eq!(gateway.runtime().connectors().count(), 0);
        let err = gateway
            .executor()
            .execute(&CancellationToken::new(), "one", &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("adapter 'pg' not found"));
    }
}
