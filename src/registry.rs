// src/registry.rs
// Server registry - the authoritative merged view of live connections and
// persisted schemas

use crate::connections::ConnectionManager;
use crate::db::{Database, SaveOutcome};
use crate::error::{MetaError, Result};
use rmcp::RoleClient;
use rmcp::service::Peer;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory descriptor of one downstream tool.
///
/// `name` is the downstream-canonical identifier used on the wire; `title`
/// is the sanitized alias used for stub filenames, script identifiers, and
/// tool paths.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub name: String,
    pub title: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub original_output_schema: bool,
}

/// One registered downstream server with its live handle and tools.
#[derive(Clone)]
pub struct ServerInfo {
    pub name: String,
    pub instructions: Option<String>,
    pub peer: Option<Peer<RoleClient>>,
    pub tools: Vec<ToolEntry>,
}

impl ServerInfo {
    pub fn tool_by_title(&self, title: &str) -> Option<&ToolEntry> {
        self.tools.iter().find(|t| t.title == title)
    }

    pub fn tool_by_name(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Authoritative view of what tools exist. Owned by the dispatcher; all
/// iteration is name-ordered via the BTreeMap.
pub struct ServerRegistry {
    db: Arc<Database>,
    servers: BTreeMap<String, ServerInfo>,
}

impl ServerRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            servers: BTreeMap::new(),
        }
    }

    /// Register a single connected server: fetch its live tool list, assign
    /// titles, persist schemas, and inject persisted originals for tools
    /// that arrived without one.
    pub async fn register_server(&mut self, name: &str, connections: &ConnectionManager) -> Result<()> {
        if self.servers.contains_key(name) {
            return Err(MetaError::DuplicateServer(name.to_string()));
        }
        let info = self.fetch_server(name, connections).await?;
        info!(server = %name, tools = info.tools.len(), "Registered MCP server");
        self.servers.insert(name.to_string(), info);
        Ok(())
    }

    /// Register every connected server concurrently. Per-server failures are
    /// logged and skipped; the registry still comes up with the rest.
    pub async fn register_all(&mut self, connections: &ConnectionManager) {
        let this = &*self;
        let fetched = futures::future::join_all(connections.names().into_iter().map(|name| {
            async move {
                let result = this.fetch_server(&name, connections).await;
                (name, result)
            }
        }))
        .await;

        for (name, result) in fetched {
            match result {
                Ok(info) => {
                    info!(server = %name, tools = info.tools.len(), "Registered MCP server");
                    self.servers.insert(name, info);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to register MCP server");
                }
            }
        }
    }

    async fn fetch_server(&self, name: &str, connections: &ConnectionManager) -> Result<ServerInfo> {
        let connection = connections
            .get(name)
            .ok_or_else(|| MetaError::MissingHandle(name.to_string()))?;

        let peer = connection.peer();
        let live_tools = peer
            .list_all_tools()
            .await
            .map_err(|e| MetaError::ToolDiscovery {
                server: name.to_string(),
                message: e.to_string(),
            })?;

        let mut taken_titles: HashSet<String> = HashSet::new();
        let mut tools = Vec::with_capacity(live_tools.len());

        for live in live_tools {
            let tool_name = live.name.to_string();
            let title = unique_title(&sanitize(&tool_name), &mut taken_titles);
            let description = live
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string();
            let input_schema = Value::Object((*live.input_schema).clone());
            let live_schema: Option<Value> =
                live.output_schema.as_ref().map(|s| Value::Object((**s).clone()));

            let mut entry = ToolEntry {
                name: tool_name,
                title,
                description,
                input_schema,
                output_schema: None,
                original_output_schema: false,
            };

            match live_schema {
                Some(schema) => {
                    // A schema straight from the server always wins.
                    self.db.save_or_update(name, &entry.name, Some(&schema), true)?;
                    entry.output_schema = Some(schema);
                    entry.original_output_schema = true;
                }
                None => {
                    let persisted = self.db.get_tool(name, &entry.name)?;
                    match persisted {
                        Some(row) if row.original_output_schema && row.output_schema.is_some() => {
                            // The server stopped sending its schema; keep the
                            // one it sent in a previous run.
                            debug!(server = %name, tool = %entry.name, "Injecting persisted output schema");
                            entry.output_schema = row.output_schema;
                            entry.original_output_schema = true;
                        }
                        _ => {
                            // First sight: record the tool so orphan
                            // reconciliation knows about this server.
                            self.db.save_or_update(name, &entry.name, None, false)?;
                        }
                    }
                }
            }

            tools.push(entry);
        }

        Ok(ServerInfo {
            name: name.to_string(),
            instructions: connection.instructions().map(String::from),
            peer: Some(peer),
            tools,
        })
    }

    /// Insert a pre-built server. Used by `register_server` internally; also
    /// the entry point for registries assembled without live connections.
    pub fn add_server(&mut self, info: ServerInfo) -> Result<()> {
        if self.servers.contains_key(&info.name) {
            return Err(MetaError::DuplicateServer(info.name));
        }
        self.servers.insert(info.name.clone(), info);
        Ok(())
    }

    /// Delete persisted rows for every server that is in the store but not
    /// registered. Returns the number of servers cleaned up.
    pub fn reconcile_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for server in self.db.list_all_servers()? {
            if !self.servers.contains_key(&server) {
                let rows = self.db.delete_server_tools(&server)?;
                info!(server = %server, rows, "Removed orphaned server from metadata store");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Record an output schema inferred from an observed response, writing
    /// the store and the in-memory tool in lockstep. Schemas that came from
    /// the server itself are never replaced (in either place).
    pub fn record_inferred_schema(
        &mut self,
        server: &str,
        tool_name: &str,
        schema: &Value,
    ) -> Result<SaveOutcome> {
        let outcome = self.db.save_or_update(server, tool_name, Some(schema), false)?;
        if let Some(info) = self.servers.get_mut(server) {
            if let Some(tool) = info.tools.iter_mut().find(|t| t.name == tool_name) {
                if !tool.original_output_schema {
                    tool.output_schema = Some(schema.clone());
                }
            }
        }
        Ok(outcome)
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerInfo> {
        self.servers.get(name)
    }

    pub fn get_tool(&self, server: &str, title: &str) -> Option<&ToolEntry> {
        self.servers.get(server).and_then(|s| s.tool_by_title(title))
    }

    /// All servers in name order.
    pub fn all_servers(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.values()
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn total_tool_count(&self) -> usize {
        self.servers.values().map(|s| s.tools.len()).sum()
    }

    pub fn clear(&mut self) {
        self.servers.clear();
    }
}

/// Sanitize a downstream tool name into an identifier- and filename-safe
/// title: every run of characters outside `[A-Za-z0-9_]` becomes one `_`,
/// and a leading digit gets a `_` prefix.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_invalid = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            prev_invalid = false;
        } else if !prev_invalid {
            out.push('_');
            prev_invalid = true;
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Make a sanitized title unique within its server by appending `_2`, `_3`,
/// ... on collision. Marks the chosen title as taken.
fn unique_title(base: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}_{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_runs() {
        assert_eq!(sanitize("get-forecast"), "get_forecast");
        assert_eq!(sanitize("a.b/c"), "a_b_c");
        assert_eq!(sanitize("a---b"), "a_b");
        assert_eq!(sanitize("a_-b"), "a__b");
    }

    #[test]
    fn sanitize_prefixes_leading_digit() {
        assert_eq!(sanitize("2fa_check"), "_2fa_check");
    }

    #[test]
    fn sanitize_handles_empty_and_symbols() {
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("!!!"), "_");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for name in ["get-forecast", "2fa!check", "a.b/c", "weird  name", "_ok_"] {
            let once = sanitize(name);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn titles_are_unique_within_server() {
        let mut taken = HashSet::new();
        assert_eq!(unique_title("t", &mut taken), "t");
        assert_eq!(unique_title("t", &mut taken), "t_2");
        assert_eq!(unique_title("t", &mut taken), "t_3");
        assert_eq!(unique_title("other", &mut taken), "other");
    }
}
