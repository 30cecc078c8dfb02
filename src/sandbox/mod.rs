// src/sandbox/mod.rs
// Sandbox: stub materialization, script runs, and the post-run schema drain

pub mod engine;
pub mod schema;
mod stubs;

pub use engine::{CaptureMap, CapturedCall, SandboxServer, ScriptOutcome, ToolInvoker};

use crate::db::SaveOutcome;
use crate::error::{MetaError, Result};
use crate::registry::{ServerInfo, ServerRegistry};
use async_trait::async_trait;
use rmcp::RoleClient;
use rmcp::model::CallToolRequestParam;
use rmcp::service::Peer;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Live `ToolInvoker` over a connected downstream peer.
pub struct PeerInvoker {
    server_name: String,
    peer: Peer<RoleClient>,
}

impl PeerInvoker {
    pub fn new(server_name: String, peer: Peer<RoleClient>) -> Self {
        Self { server_name, peer }
    }
}

#[async_trait]
impl ToolInvoker for PeerInvoker {
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<Value> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            _ => None,
        };

        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
                meta: Default::default(),
                task: Default::default(),
            })
            .await
            .map_err(|e| {
                MetaError::Sandbox(format!(
                    "tool call '{}' on '{}' failed: {e}",
                    tool_name, self.server_name
                ))
            })?;

        Ok(serde_json::to_value(&result)?)
    }
}

/// Owns the stub tree and runs user scripts against it.
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wipe and regenerate the stub tree: one `<server>/<title>.cjs` file
    /// per registered tool.
    pub fn materialize<'a>(
        &self,
        servers: impl IntoIterator<Item = &'a ServerInfo>,
    ) -> Result<usize> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;

        let mut written = 0;
        for server in servers {
            let dir = self.root.join(&server.name);
            std::fs::create_dir_all(&dir)?;
            for tool in &server.tools {
                let path = dir.join(format!("{}.cjs", tool.title));
                std::fs::write(&path, stubs::stub_source(&server.name, &tool.name))?;
                written += 1;
            }
        }

        info!(stubs = written, root = %self.root.display(), "Sandbox stubs materialized");
        Ok(written)
    }

    /// Project the registry into the servers a script may see. Connected
    /// servers get a live invoker; the rest appear without one and their
    /// stubs throw on use.
    pub fn snapshot_servers(registry: &ServerRegistry) -> Vec<SandboxServer> {
        registry
            .all_servers()
            .map(|server| SandboxServer {
                name: server.name.clone(),
                invoker: server.peer.clone().map(|peer| {
                    Arc::new(PeerInvoker::new(server.name.clone(), peer)) as Arc<dyn ToolInvoker>
                }),
            })
            .collect()
    }

    /// Execute one script against a fresh interpreter context.
    pub async fn run(&self, code: &str, servers: &[SandboxServer]) -> ScriptOutcome {
        engine::run_script(&self.root, code, servers).await
    }

    /// Drain captured outputs through the registry, which writes the store
    /// and its in-memory tools in lockstep. Runs after success and failure
    /// alike; schemas that came from the server itself are never replaced.
    pub fn drain_outputs(
        &self,
        captures: CaptureMap,
        registry: &mut ServerRegistry,
    ) -> Result<usize> {
        let mut recorded = 0;
        for (server, calls) in captures {
            for call in calls {
                let observed = schema::response_value(&call.raw_response);
                let inferred = schema::infer_schema(observed);
                match registry.record_inferred_schema(&server, &call.tool_name, &inferred)? {
                    SaveOutcome::Unchanged => {}
                    _ => recorded += 1,
                }
            }
        }
        if recorded > 0 {
            debug!(schemas = recorded, "Recorded inferred output schemas");
        }
        Ok(recorded)
    }
}
