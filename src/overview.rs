// src/overview.rs
// Discovery artifacts: the plain-text servers overview and the per-tool
// JSON overview with example usage

use crate::error::{MetaError, Result};
use crate::registry::{ServerInfo, ServerRegistry};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Render the full server/tool listing as a deterministic plain-text
/// document: one header per server (name order), one `server/title` line per
/// tool (title order), and a standing hint about `get_tools_overview`.
pub fn servers_overview<'a>(servers: impl Iterator<Item = &'a ServerInfo>) -> String {
    let mut out = String::new();

    for server in servers {
        out.push_str(&format!(
            "# {} mcp server instructions: {}\n",
            server.name,
            server.instructions.as_deref().unwrap_or_default()
        ));

        let mut titles: Vec<&str> = server.tools.iter().map(|t| t.title.as_str()).collect();
        titles.sort_unstable();
        for title in titles {
            out.push_str(&format!("{}/{}\n", server.name, title));
        }
        out.push('\n');
    }

    out.push_str(
        "Call get_tools_overview with a list of tool paths (e.g. \"server/tool\") \
         to fetch input schemas and example usage for the tools you need.",
    );
    out
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolOverview<'a> {
    name: &'a str,
    title: &'a str,
    description: &'a str,
    input_schema: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<&'a Value>,
    example_usage: String,
}

/// Build the JSON overview for a list of `server/title` tool paths.
///
/// A malformed path or an unknown server fails the whole call; an unknown
/// tool inside a known server is skipped with a warning and the rest of the
/// array is still returned.
pub fn tools_overview(registry: &ServerRegistry, paths: &[String]) -> Result<String> {
    let mut entries = Vec::with_capacity(paths.len());

    for path in paths {
        let (server_name, title) = parse_tool_path(path)?;

        let server = registry
            .get_server(server_name)
            .ok_or_else(|| MetaError::NotFound(format!("server '{server_name}' not found")))?;

        let Some(tool) = server.tool_by_title(title) else {
            warn!(server = %server_name, tool = %title, "Tool path not found, skipping");
            continue;
        };

        entries.push(ToolOverview {
            name: &tool.name,
            title: &tool.title,
            description: &tool.description,
            input_schema: &tool.input_schema,
            output_schema: tool.output_schema.as_ref(),
            example_usage: example_usage(server_name, &tool.title),
        });
    }

    Ok(serde_json::to_string_pretty(&entries)?)
}

/// Split a `server/title` tool path.
pub fn parse_tool_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('/') {
        Some((server, title)) if !server.is_empty() && !title.is_empty() => Ok((server, title)),
        _ => Err(MetaError::Argument(format!(
            "invalid tool path '{path}': expected \"server/tool\""
        ))),
    }
}

/// The literal usage snippet shown to the client for one tool.
fn example_usage(server: &str, title: &str) -> String {
    format!(
        "const {title} = require('./{server}/{title}.cjs');\nmodule.exports = {title}({{ /* your parameters here */ }});"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::registry::ToolEntry;
    use serde_json::json;
    use std::sync::Arc;

    fn tool(name: &str, description: &str) -> ToolEntry {
        ToolEntry {
            name: name.to_string(),
            title: crate::registry::sanitize(name),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
            output_schema: None,
            original_output_schema: false,
        }
    }

    fn server(name: &str, instructions: Option<&str>, tools: Vec<ToolEntry>) -> ServerInfo {
        ServerInfo {
            name: name.to_string(),
            instructions: instructions.map(String::from),
            peer: None,
            tools,
        }
    }

    fn registry_with(servers: Vec<ServerInfo>) -> ServerRegistry {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut registry = ServerRegistry::new(db);
        for s in servers {
            registry.add_server(s).unwrap();
        }
        registry
    }

    #[test]
    fn overview_lists_servers_and_tools_sorted() {
        let registry = registry_with(vec![
            server("time", None, vec![tool("now", "current time")]),
            server(
                "weather",
                Some("Forecasts for coordinates"),
                vec![tool("get_forecast", "weather predictions")],
            ),
        ]);

        let text = servers_overview(registry.all_servers());
        assert!(text.contains("# time mcp server instructions: \n"));
        assert!(text.contains("# weather mcp server instructions: Forecasts for coordinates\n"));
        assert!(text.contains("weather/get_forecast\n"));
        assert!(text.contains("time/now\n"));
        assert!(text.contains("get_tools_overview"));
        // time sorts before weather
        let time_pos = text.find("# time").unwrap();
        let weather_pos = text.find("# weather").unwrap();
        assert!(time_pos < weather_pos);
    }

    #[test]
    fn tools_overview_emits_example_usage() {
        let registry = registry_with(vec![server(
            "weather",
            None,
            vec![tool("get_forecast", "weather predictions")],
        )]);

        let json_text =
            tools_overview(&registry, &["weather/get_forecast".to_string()]).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["name"], "get_forecast");
        assert_eq!(
            parsed[0]["exampleUsage"],
            "const get_forecast = require('./weather/get_forecast.cjs');\nmodule.exports = get_forecast({ /* your parameters here */ });"
        );
        assert!(parsed[0].get("outputSchema").is_none());
    }

    #[test]
    fn tools_overview_includes_output_schema_when_known() {
        let mut entry = tool("get_forecast", "weather predictions");
        entry.output_schema = Some(json!({"type": "object"}));
        let registry = registry_with(vec![server("weather", None, vec![entry])]);

        let json_text =
            tools_overview(&registry, &["weather/get_forecast".to_string()]).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed[0]["outputSchema"], json!({"type": "object"}));
    }

    #[test]
    fn malformed_path_fails() {
        let registry = registry_with(vec![server("weather", None, vec![])]);
        let err = tools_overview(&registry, &["no-slash".to_string()]).unwrap_err();
        assert!(err.to_string().contains("no-slash"));
    }

    #[test]
    fn unknown_server_fails() {
        let registry = registry_with(vec![server("weather", None, vec![])]);
        assert!(tools_overview(&registry, &["nope/tool".to_string()]).is_err());
    }

    #[test]
    fn unknown_tool_is_skipped() {
        let registry = registry_with(vec![server(
            "weather",
            None,
            vec![tool("get_forecast", "weather predictions")],
        )]);

        let json_text = tools_overview(
            &registry,
            &[
                "weather/missing".to_string(),
                "weather/get_forecast".to_string(),
            ],
        )
        .unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["title"], "get_forecast");
    }
}
