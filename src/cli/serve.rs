// src/cli/serve.rs
// Startup orchestration and the upstream stdio transport

use super::Cli;
use anyhow::Result;
use mcp_of_mcps::config::{self, StatePaths};
use mcp_of_mcps::connections::ConnectionManager;
use mcp_of_mcps::db::Database;
use mcp_of_mcps::embeddings::EmbeddingClient;
use mcp_of_mcps::index::{IndexRecord, VectorIndex};
use mcp_of_mcps::mcp::MetaServer;
use mcp_of_mcps::registry::ServerRegistry;
use mcp_of_mcps::sandbox::Sandbox;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Bring the whole meta-server up and serve MCP over stdio until the client
/// disconnects.
///
/// A single downstream server failing to spawn or register is non-fatal;
/// failing to open the metadata store, to build the vector index, or to bind
/// the upstream transport aborts startup.
pub async fn run(cli: Cli) -> Result<()> {
    let descriptors = config::load_descriptors(cli.config, cli.config_file)?;
    let paths = StatePaths::default();

    let db = Arc::new(Database::open(&paths.database)?);
    let embeddings = Arc::new(EmbeddingClient::new()?);
    info!(model = embeddings.model_name(), "Embedding model loaded");

    let connections = ConnectionManager::connect_all(&descriptors).await;
    info!(
        connected = connections.len(),
        configured = descriptors.len(),
        "Downstream connections established"
    );

    let mut registry = ServerRegistry::new(db.clone());
    registry.register_all(&connections).await;
    registry.reconcile_orphans()?;

    let index = Arc::new(VectorIndex::new(&paths.vector_index, embeddings));
    index.rebuild(&index_records(&registry)).await?;

    let sandbox = Arc::new(Sandbox::new(&paths.sandbox));
    sandbox.materialize(registry.all_servers())?;

    let stats = db.stats()?;
    info!(
        servers = registry.server_count(),
        tools = registry.total_tool_count(),
        persisted_tools = stats.tool_count,
        original_schemas = stats.original_schema_count,
        "Startup complete"
    );

    let server = MetaServer::new(Arc::new(RwLock::new(registry)), index, sandbox);
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;
    service.waiting().await?;

    connections.shutdown();
    Ok(())
}

fn index_records(registry: &ServerRegistry) -> Vec<IndexRecord> {
    registry
        .all_servers()
        .flat_map(|server| {
            server.tools.iter().map(|tool| IndexRecord {
                server_name: server.name.clone(),
                tool_name: tool.name.clone(),
                description: tool.description.clone(),
            })
        })
        .collect()
}
