// src/connections.rs
// Downstream MCP connection manager - spawns each configured server as a
// child process and keeps the client handles alive for the process lifetime

use crate::config::ServerDescriptor;
use crate::error::{MetaError, Result};
use rmcp::model::ClientInfo;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::{RoleClient, serve_client};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// A connected downstream server.
pub struct ManagedConnection {
    peer: Peer<RoleClient>,
    instructions: Option<String>,
    /// Keep the RunningService alive to prevent transport shutdown.
    /// Dropping this cancels the transport and kills the child process.
    _service: RunningService<RoleClient, ClientInfo>,
}

impl ManagedConnection {
    pub fn peer(&self) -> Peer<RoleClient> {
        self.peer.clone()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }
}

/// Owns every downstream client handle, keyed by server name.
pub struct ConnectionManager {
    clients: HashMap<String, ManagedConnection>,
}

impl ConnectionManager {
    /// Connect to all configured servers concurrently. A server that fails
    /// to spawn or to complete the handshake is logged and skipped; it
    /// leaves no entry in the map.
    pub async fn connect_all(descriptors: &[ServerDescriptor]) -> Self {
        let attempts = futures::future::join_all(
            descriptors
                .iter()
                .map(|desc| async move { (desc.name.clone(), Self::connect(desc).await) }),
        )
        .await;

        let mut clients = HashMap::new();
        for (name, result) in attempts {
            match result {
                Ok(connection) => {
                    clients.insert(name, connection);
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "Failed to connect to MCP server");
                }
            }
        }

        Self { clients }
    }

    async fn connect(desc: &ServerDescriptor) -> Result<ManagedConnection> {
        info!(
            server = %desc.name,
            command = %desc.command,
            args = ?desc.args,
            "Spawning MCP server child process"
        );

        let mut cmd = Command::new(&desc.command);
        cmd.args(&desc.args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null()); // Suppress server stderr

        let transport = TokioChildProcess::new(cmd).map_err(|e| MetaError::Spawn {
            server: desc.name.clone(),
            message: e.to_string(),
        })?;

        let client_info = ClientInfo {
            meta: Default::default(),
            protocol_version: Default::default(),
            capabilities: Default::default(),
            client_info: rmcp::model::Implementation {
                name: "mcp-of-mcps".into(),
                title: Some("MCP of MCPs".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
        };

        let service = serve_client(client_info, transport)
            .await
            .map_err(|e| MetaError::Handshake {
                server: desc.name.clone(),
                message: e.to_string(),
            })?;

        let peer = service.peer().clone();
        let instructions = service
            .peer()
            .peer_info()
            .and_then(|info| info.instructions.clone());

        info!(server = %desc.name, "Connected to MCP server");

        Ok(ManagedConnection {
            peer,
            instructions,
            _service: service,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ManagedConnection> {
        self.clients.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &ManagedConnection)> {
        self.clients.iter().map(|(name, conn)| (name.as_str(), conn))
    }

    /// Connected server names, sorted for deterministic iteration.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every client handle. The child process transports shut down as
    /// the RunningServices are dropped.
    pub fn shutdown(mut self) {
        for (name, _connection) in self.clients.drain() {
            info!(server = %name, "Disconnecting from MCP server");
        }
    }
}
