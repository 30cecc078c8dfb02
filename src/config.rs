// src/config.rs
// Server descriptors, CLI config resolution, and on-disk state layout

use crate::error::{MetaError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Configuration for one downstream MCP server.
///
/// `name` is the namespace key for tool paths, sandbox directories, and the
/// metadata store; it must be unique across the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Relative paths of everything this process persists under the working
/// directory. All three are created on demand and intended to be
/// git-ignored.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub database: PathBuf,
    pub vector_index: PathBuf,
    pub sandbox: PathBuf,
}

impl Default for StatePaths {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".database/mcps.db"),
            vector_index: PathBuf::from(".vector-index"),
            sandbox: PathBuf::from(".sandbox"),
        }
    }
}

/// Resolve descriptors from the two mutually-exclusive CLI flags.
pub fn load_descriptors(
    config: Option<String>,
    config_file: Option<PathBuf>,
) -> Result<Vec<ServerDescriptor>> {
    let raw = match (config, config_file) {
        (Some(json), None) => json,
        (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
            MetaError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?,
        (None, None) => {
            return Err(MetaError::Config(
                "either --config or --config-file is required".into(),
            ));
        }
        (Some(_), Some(_)) => {
            return Err(MetaError::Config(
                "--config and --config-file are mutually exclusive".into(),
            ));
        }
    };
    parse_descriptors(&raw)
}

/// Parse a configuration document into server descriptors.
///
/// Accepts either a bare JSON array of `{name, command, args}` objects or
/// the conventional `{"mcpServers": {name: {command, args}}}` map.
pub fn parse_descriptors(raw: &str) -> Result<Vec<ServerDescriptor>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| MetaError::Config(format!("configuration is not valid JSON: {e}")))?;

    let descriptors: Vec<ServerDescriptor> = match &value {
        Value::Array(_) => serde_json::from_value(value)
            .map_err(|e| MetaError::Config(format!("invalid server descriptor: {e}")))?,
        Value::Object(map) => {
            let servers = map
                .get("mcpServers")
                .and_then(|v| v.as_object())
                .ok_or_else(|| {
                    MetaError::Config("expected an array of servers or an \"mcpServers\" object".into())
                })?;
            let mut out = Vec::with_capacity(servers.len());
            for (name, entry) in servers {
                let command = entry
                    .get("command")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MetaError::Config(format!("server '{name}' is missing a command"))
                    })?
                    .to_string();
                let args = entry
                    .get("args")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                out.push(ServerDescriptor {
                    name: name.clone(),
                    command,
                    args,
                });
            }
            out
        }
        _ => {
            return Err(MetaError::Config(
                "expected an array of servers or an \"mcpServers\" object".into(),
            ));
        }
    };

    validate_descriptors(&descriptors)?;
    Ok(descriptors)
}

fn validate_descriptors(descriptors: &[ServerDescriptor]) -> Result<()> {
    if descriptors.is_empty() {
        return Err(MetaError::Config("no downstream servers configured".into()));
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for desc in descriptors {
        if !is_valid_server_name(&desc.name) {
            return Err(MetaError::Config(format!(
                "server name '{}' is invalid: use only letters, digits, '-' and '_'",
                desc.name
            )));
        }
        if desc.command.trim().is_empty() {
            return Err(MetaError::Config(format!(
                "server '{}' has an empty command",
                desc.name
            )));
        }
        if !seen.insert(desc.name.as_str()) {
            return Err(MetaError::Config(format!(
                "duplicate server name '{}'",
                desc.name
            )));
        }
    }
    Ok(())
}

/// Server names become sandbox directory components and overview path
/// segments, so the charset is locked down at the configuration boundary.
fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Ensure the parent directory of a state file exists.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mcp_servers_map() {
        let raw = r#"{
            "mcpServers": {
                "weather": {"command": "echo-mcp", "args": ["weather-fixture"]},
                "time": {"command": "time-mcp"}
            }
        }"#;
        let mut descs = parse_descriptors(raw).unwrap();
        descs.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[1].name, "weather");
        assert_eq!(descs[1].command, "echo-mcp");
        assert_eq!(descs[1].args, vec!["weather-fixture"]);
        assert!(descs[0].args.is_empty());
    }

    #[test]
    fn parses_descriptor_array() {
        let raw = r#"[{"name": "weather", "command": "echo-mcp", "args": []}]"#;
        let descs = parse_descriptors(raw).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].name, "weather");
    }

    #[test]
    fn rejects_duplicate_names() {
        let raw = r#"[
            {"name": "a", "command": "x"},
            {"name": "a", "command": "y"}
        ]"#;
        let err = parse_descriptors(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_unsafe_server_name() {
        let raw = r#"[{"name": "a/b", "command": "x"}]"#;
        assert!(parse_descriptors(raw).is_err());
    }

    #[test]
    fn rejects_missing_command() {
        let raw = r#"{"mcpServers": {"a": {"args": []}}}"#;
        assert!(parse_descriptors(raw).is_err());
    }
}
