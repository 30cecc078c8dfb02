// src/mcp/mod.rs
// Upstream MCP server - routes the four meta-tools to the registry,
// formatter, vector index, and sandbox

use crate::index::VectorIndex;
use crate::overview;
use crate::registry::ServerRegistry;
use crate::sandbox::Sandbox;

use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext, wrapper::Parameters},
    model::{
        CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Upstream server state shared by every meta-tool handler.
#[derive(Clone)]
pub struct MetaServer {
    pub registry: Arc<RwLock<ServerRegistry>>,
    pub index: Arc<VectorIndex>,
    pub sandbox: Arc<Sandbox>,
    tool_router: ToolRouter<Self>,
}

impl MetaServer {
    pub fn new(
        registry: Arc<RwLock<ServerRegistry>>,
        index: Arc<VectorIndex>,
        sandbox: Arc<Sandbox>,
    ) -> Self {
        Self {
            registry,
            index,
            sandbox,
            tool_router: Self::tool_router(),
        }
    }
}

// Request types for the meta-tools

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SemanticSearchRequest {
    #[schemars(description = "Natural-language description of the tool you need")]
    pub query: String,
    #[schemars(description = "Max results (default 5)")]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolsOverviewRequest {
    #[schemars(description = "Tool paths to inspect, each \"server/tool\"")]
    pub tool_paths: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunCodeRequest {
    #[schemars(
        description = "CommonJS code. require('./server/tool.cjs') loads a tool stub; assign the result (value or promise) to module.exports"
    )]
    pub code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultEntry {
    server_name: String,
    tool_name: String,
    description: String,
    similarity_score: String,
    full_path: String,
}

fn text_result(result: Result<String, String>) -> Result<CallToolResult, ErrorData> {
    match result {
        Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Err(e) => Ok(CallToolResult::error(vec![Content::text(e)])),
    }
}

#[tool_router]
impl MetaServer {
    #[tool(
        description = "Search the tools of all connected MCP servers by meaning. Returns the closest matches with their full paths for get_tools_overview."
    )]
    async fn semantic_search_tools(
        &self,
        Parameters(req): Parameters<SemanticSearchRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        text_result(self.handle_semantic_search(req).await)
    }

    #[tool(
        description = "List every connected MCP server and its tools as plain text. Start here to see what exists."
    )]
    async fn get_mcps_servers_overview(&self) -> Result<CallToolResult, ErrorData> {
        let registry = self.registry.read().await;
        text_result(Ok(overview::servers_overview(registry.all_servers())))
    }

    #[tool(
        description = "Fetch full schemas and example usage for specific tools by path (\"server/tool\"). Only the tools you ask for are returned."
    )]
    async fn get_tools_overview(
        &self,
        Parameters(req): Parameters<ToolsOverviewRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let registry = self.registry.read().await;
        text_result(
            overview::tools_overview(&registry, &req.tool_paths)
                .map_err(|e| format!("Error: {e}")),
        )
    }

    #[tool(
        description = "Run CommonJS code that composes tool calls inside a sandbox. Intermediate results stay out of your context; only module.exports comes back, JSON-stringified."
    )]
    async fn run_functions_code(
        &self,
        Parameters(req): Parameters<RunCodeRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        text_result(self.handle_run_code(req).await)
    }
}

impl MetaServer {
    async fn handle_semantic_search(
        &self,
        req: SemanticSearchRequest,
    ) -> Result<String, String> {
        let limit = req.limit.unwrap_or(5) as usize;
        let hits = self
            .index
            .search(&req.query, limit)
            .await
            .map_err(|e| format!("Error: {e}"))?;

        let registry = self.registry.read().await;
        let entries: Vec<SearchResultEntry> = hits
            .into_iter()
            .map(|hit| {
                let title = registry
                    .get_server(&hit.server_name)
                    .and_then(|s| s.tool_by_name(&hit.tool_name))
                    .map(|t| t.title.clone())
                    .unwrap_or_else(|| hit.tool_name.clone());
                SearchResultEntry {
                    full_path: format!("{}/{}", hit.server_name, title),
                    server_name: hit.server_name,
                    tool_name: hit.tool_name,
                    description: hit.description,
                    similarity_score: format!("{:.3}", hit.score),
                }
            })
            .collect();

        serde_json::to_string_pretty(&entries).map_err(|e| format!("Error: {e}"))
    }

    async fn handle_run_code(&self, req: RunCodeRequest) -> Result<String, String> {
        let servers = {
            let registry = self.registry.read().await;
            Sandbox::snapshot_servers(&registry)
        };

        let outcome = self.sandbox.run(&req.code, &servers).await;

        // The drain runs whether the script succeeded or not, so partial
        // fan-outs still teach the store their output shapes.
        {
            let mut registry = self.registry.write().await;
            if let Err(e) = self.sandbox.drain_outputs(outcome.captures, &mut registry) {
                debug!(error = %e, "Failed to drain sandbox outputs");
            }
        }

        match outcome.value {
            Ok(value) => serde_json::to_string(&value).map_err(|e| format!("Error: {e}")),
            Err(e) => Err(format!("Error: {e}")),
        }
    }
}

impl ServerHandler for MetaServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "mcp-of-mcps".into(),
                title: Some("MCP of MCPs".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Aggregates many MCP servers behind one endpoint. Discover tools with \
                 get_mcps_servers_overview or semantic_search_tools, load schemas for \
                 the few you need with get_tools_overview, then compose calls with \
                 run_functions_code so intermediate results never enter your context."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            // Handler errors are never thrown across the transport: both
            // unknown tools and argument-shape violations come back as the
            // standard error envelope.
            if !self.tool_router.has_route(request.name.as_ref()) {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "Tool '{}' not found",
                    request.name
                ))]));
            }

            let ctx = ToolCallContext::new(self, request, context);
            match self.tool_router.call(ctx).await {
                Ok(result) => Ok(result),
                Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error: {}",
                    e.message
                ))])),
            }
        }
    }
}
