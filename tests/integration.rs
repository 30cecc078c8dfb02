//! Integration tests for the sandbox pipeline and the metadata store.
//!
//! Downstream servers are replaced by fixture invokers behind the
//! `ToolInvoker` seam; nothing here spawns a subprocess or loads the
//! embedding model.


use mcp_of_mcps::db::Database;
use mcp_of_mcps::overview;
use mcp_of_mcps::registry::ServerRegistry;
use mcp_of_mcps::sandbox::Sandbox;
use serde_json::{Value, json};
use std::sync::Arc;
use test_utils::{FixtureInvoker, sandbox_server, server_info, tool_entry};

/// A sandbox with one materialized `weather/get_forecast` stub, plus the
/// registry it was materialized from.
fn weather_sandbox(dir: &tempfile::TempDir) -> (Sandbox, ServerRegistry, Arc<Database>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut registry = ServerRegistry::new(db.clone());
    registry
        .add_server(server_info(
            "weather",
            vec![tool_entry("get_forecast", "weather predictions")],
        ))
        .unwrap();

    let sandbox = Sandbox::new(&dir.path().join("sandbox"));
    sandbox.materialize(registry.all_servers()).unwrap();
    (sandbox, registry, db)
}

#[tokio::test]
async fn composition_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    let invoker = FixtureInvoker::echo();
    let servers = vec![sandbox_server("weather", Some(invoker.clone()))];

    let outcome = sandbox
        .run(
            "module.exports = require('./weather/get_forecast.cjs')({lat:0,lon:0});",
            &servers,
        )
        .await;

    let value = outcome.value.unwrap();
    assert_eq!(value["_meta"]["serverName"], "weather");
    assert_eq!(value["_meta"]["toolName"], "get_forecast");
    assert_eq!(value["isError"], false);
    assert_eq!(value["content"][0]["text"], "called get_forecast");

    // the downstream saw the wire name and the caller's arguments
    let calls = invoker.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "get_forecast");
    assert_eq!(calls[0].1, json!({"lat": 0, "lon": 0}));

    // and the response was captured for schema inference
    assert_eq!(outcome.captures.len(), 1);
    assert_eq!(outcome.captures[0].0, "weather");
    assert_eq!(outcome.captures[0].1.len(), 1);
    assert_eq!(outcome.captures[0].1[0].tool_name, "get_forecast");
}

#[tokio::test]
async fn stub_requires_as_function() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    let servers = vec![sandbox_server("weather", Some(FixtureInvoker::echo()))];

    let outcome = sandbox
        .run(
            "module.exports = typeof require('./weather/get_forecast.cjs');",
            &servers,
        )
        .await;

    assert_eq!(outcome.value.unwrap(), json!("function"));
}

#[tokio::test]
async fn non_promise_export_returns_directly() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    let servers = vec![sandbox_server("weather", None)];

    let outcome = sandbox.run("module.exports = {answer: 42};", &servers).await;
    assert_eq!(outcome.value.unwrap(), json!({"answer": 42}));
}

#[tokio::test]
async fn empty_export_is_null() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    let servers = vec![sandbox_server("weather", None)];

    let outcome = sandbox.run("const unused = 1;", &servers).await;
    assert_eq!(outcome.value.unwrap(), Value::Null);
}

#[tokio::test]
async fn forbidden_require_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    let servers = vec![sandbox_server("weather", None)];

    let outcome = sandbox
        .run("module.exports = require('../outside.cjs');", &servers)
        .await;
    let err = outcome.value.unwrap_err().to_string();
    assert!(err.contains("sandbox root"), "unexpected error: {err}");
}

#[tokio::test]
async fn missing_client_throws_from_stub() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _registry, _db) = weather_sandbox(&dir);
    // server exists in the sandbox but has no connected client
    let servers = vec![sandbox_server("weather", None)];

    let outcome = sandbox
        .run(
            "module.exports = require('./weather/get_forecast.cjs')({});",
            &servers,
        )
        .await;
    let err = outcome.value.unwrap_err().to_string();
    assert!(err.contains("no connected client"), "unexpected error: {err}");
}

#[tokio::test]
async fn script_failure_still_captures_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, mut registry, db) = weather_sandbox(&dir);
    let servers = vec![sandbox_server("weather", Some(FixtureInvoker::echo()))];

    let outcome = sandbox
        .run(
            "module.exports = (async () => {\n\
               await require('./weather/get_forecast.cjs')({});\n\
               throw new Error('boom');\n\
             })();",
            &servers,
        )
        .await;

    let err = outcome.value.unwrap_err().to_string();
    assert!(err.contains("boom"), "unexpected error: {err}");

    // the call that happened before the failure still reaches the store
    assert_eq!(outcome.captures[0].1.len(), 1);
    sandbox.drain_outputs(outcome.captures, &mut registry).unwrap();
    let row = db.get_tool("weather", "get_forecast").unwrap().unwrap();
    assert!(row.output_schema.is_some());
    assert!(!row.original_output_schema);
}

#[tokio::test]
async fn capture_order_matches_observation_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut registry = ServerRegistry::new(db);
    registry
        .add_server(server_info(
            "multi",
            vec![tool_entry("alpha", "first"), tool_entry("beta", "second")],
        ))
        .unwrap();
    let sandbox = Sandbox::new(&dir.path().join("sandbox"));
    sandbox.materialize(registry.all_servers()).unwrap();

    let servers = vec![sandbox_server("multi", Some(FixtureInvoker::echo()))];
    let outcome = sandbox
        .run(
            "module.exports = (async () => {\n\
               await require('./multi/beta.cjs')({});\n\
               await require('./multi/alpha.cjs')({});\n\
               return 'done';\n\
             })();",
            &servers,
        )
        .await;

    assert_eq!(outcome.value.unwrap(), json!("done"));
    let calls = &outcome.captures[0].1;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].tool_name, "beta");
    assert_eq!(calls[1].tool_name, "alpha");
}

#[tokio::test]
async fn drain_infers_schema_and_second_run_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, mut registry, db) = weather_sandbox(&dir);
    let invoker = FixtureInvoker::with_response(json!({
        "content": [{"type": "text", "text": "21.5"}],
        "structuredContent": {"temperature": 21.5, "unit": "C"},
        "isError": false,
    }));
    let servers = vec![sandbox_server("weather", Some(invoker))];
    let code = "module.exports = require('./weather/get_forecast.cjs')({});";

    let outcome = sandbox.run(code, &servers).await;
    let first_json = serde_json::to_string(&outcome.value.unwrap()).unwrap();
    let recorded = sandbox.drain_outputs(outcome.captures, &mut registry).unwrap();
    assert_eq!(recorded, 1);

    let row = db.get_tool("weather", "get_forecast").unwrap().unwrap();
    let expected = json!({
        "type": "object",
        "properties": {
            "temperature": {"type": "number"},
            "unit": {"type": "string"},
        }
    });
    assert_eq!(row.output_schema, Some(expected.clone()));
    let first_stamp = row.last_updated;

    // in-memory registry updated in lockstep
    assert_eq!(
        registry.get_tool("weather", "get_forecast").unwrap().output_schema,
        Some(expected)
    );

    // identical second run: byte-identical output, no store churn
    let outcome = sandbox.run(code, &servers).await;
    let second_json = serde_json::to_string(&outcome.value.unwrap()).unwrap();
    assert_eq!(first_json, second_json);
    let recorded = sandbox.drain_outputs(outcome.captures, &mut registry).unwrap();
    assert_eq!(recorded, 0);
    let row = db.get_tool("weather", "get_forecast").unwrap().unwrap();
    assert_eq!(row.last_updated, first_stamp);
}

#[tokio::test]
async fn inferred_drain_never_replaces_original_schema() {
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, mut registry, db) = weather_sandbox(&dir);

    let original = json!({"type": "object", "properties": {"temperature": {"type": "number"}}});
    db.save_or_update("weather", "get_forecast", Some(&original), true)
        .unwrap();

    let invoker = FixtureInvoker::with_response(json!({
        "content": [],
        "structuredContent": {"something": "else"},
        "isError": false,
    }));
    let servers = vec![sandbox_server("weather", Some(invoker))];
    let outcome = sandbox
        .run("module.exports = require('./weather/get_forecast.cjs')({});", &servers)
        .await;
    outcome.value.unwrap();
    sandbox.drain_outputs(outcome.captures, &mut registry).unwrap();

    let row = db.get_tool("weather", "get_forecast").unwrap().unwrap();
    assert!(row.original_output_schema);
    assert_eq!(row.output_schema, Some(original));
}

#[test]
fn original_schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcps.db");
    let schema = json!({"type": "object", "properties": {"temperature": {"type": "number"}}});

    {
        let db = Database::open(&path).unwrap();
        db.save_or_update("weather", "get_forecast", Some(&schema), true)
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let row = db.get_tool("weather", "get_forecast").unwrap().unwrap();
    assert!(row.original_output_schema);
    assert_eq!(row.output_schema, Some(schema));
}

#[test]
fn orphan_cleanup_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcps.db");

    // first boot persisted rows for servers A and B
    {
        let db = Database::open(&path).unwrap();
        db.save_or_update("A", "t", None, false).unwrap();
        db.save_or_update("B", "t", None, false).unwrap();
    }

    // second boot only brings up A
    let db = Arc::new(Database::open(&path).unwrap());
    let mut registry = ServerRegistry::new(db.clone());
    registry
        .add_server(server_info("A", vec![tool_entry("t", "")]))
        .unwrap();
    let removed = registry.reconcile_orphans().unwrap();

    assert_eq!(removed, 1);
    assert_eq!(db.list_all_servers().unwrap(), vec!["A"]);
}

#[tokio::test]
async fn servers_overview_end_to_end() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut registry = ServerRegistry::new(db);
    registry
        .add_server(server_info(
            "weather",
            vec![tool_entry("get_forecast", "weather predictions")],
        ))
        .unwrap();

    let text = overview::servers_overview(registry.all_servers());
    let tool_lines: Vec<&str> = text
        .lines()
        .filter(|line| line.contains('/') && !line.starts_with('#') && !line.contains(' '))
        .collect();
    assert_eq!(tool_lines, vec!["weather/get_forecast"]);
}
