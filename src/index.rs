// src/index.rs
// Restart-stable vector index over tool descriptions (rusqlite + sqlite-vec)

use crate::db::register_sqlite_vec;
use crate::embeddings::EmbeddingClient;
use crate::error::{MetaError, Result};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const INDEX_FILE: &str = "tools.db";
const STAGING_FILE: &str = "tools.db.staging";

/// One `(server, tool)` pair to index.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
}

/// A nearest-neighbor match, scored in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub score: f32,
}

/// On-disk nearest-neighbor index over tool descriptions, rebuilt from
/// scratch at every startup.
pub struct VectorIndex {
    dir: PathBuf,
    embeddings: Arc<EmbeddingClient>,
    conn: Mutex<Option<Connection>>,
}

impl VectorIndex {
    pub fn new(dir: &Path, embeddings: Arc<EmbeddingClient>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            embeddings,
            conn: Mutex::new(None),
        }
    }

    /// Replace the index atomically: embed every record, write a staging
    /// database, then swap it over the live file. A crash mid-rebuild leaves
    /// either the old index or a dead staging file; the next startup's
    /// rebuild repairs both.
    pub async fn rebuild(&self, records: &[IndexRecord]) -> Result<usize> {
        register_sqlite_vec();
        std::fs::create_dir_all(&self.dir)?;

        let mut records: Vec<&IndexRecord> = records.iter().collect();
        records.sort_by(|a, b| {
            (&a.server_name, &a.tool_name).cmp(&(&b.server_name, &b.tool_name))
        });

        let texts: Vec<String> = records
            .iter()
            .map(|r| format!("{}: {}", r.tool_name, r.description))
            .collect();
        let vectors = self.embeddings.embed_batch(&texts).await?;

        let staging_path = self.dir.join(STAGING_FILE);
        let _ = std::fs::remove_file(&staging_path);

        {
            let conn = Connection::open(&staging_path)
                .map_err(|e| MetaError::Index(format!("cannot create staging index: {e}")))?;
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE vec_tools USING vec0(
                    embedding float[{}],
                    +server_name TEXT,
                    +tool_name TEXT,
                    +description TEXT
                );",
                self.embeddings.dimensions()
            ))?;

            for (record, vector) in records.iter().zip(&vectors) {
                conn.execute(
                    "INSERT INTO vec_tools (embedding, server_name, tool_name, description)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        embedding_to_bytes(vector),
                        record.server_name,
                        record.tool_name,
                        record.description
                    ],
                )?;
            }
            // conn drops here, flushing the staging file
        }

        let live_path = self.dir.join(INDEX_FILE);
        {
            let mut guard = self.lock_conn();
            *guard = None; // close the previous index before the swap
            std::fs::rename(&staging_path, &live_path)
                .map_err(|e| MetaError::Index(format!("cannot swap index into place: {e}")))?;
            *guard = Some(
                Connection::open(&live_path)
                    .map_err(|e| MetaError::Index(format!("cannot open index: {e}")))?,
            );
        }

        info!(tools = records.len(), "Vector index rebuilt");
        Ok(records.len())
    }

    /// Top-k cosine search. Results are sorted by descending similarity with
    /// ties broken by `serverName/toolName` so output is deterministic.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embeddings.embed(query).await?;
        debug!(query = %query, k, "Vector search");

        let guard = self.lock_conn();
        let conn = guard
            .as_ref()
            .ok_or_else(|| MetaError::Index("index has not been built".into()))?;

        let mut stmt = conn.prepare(
            "SELECT server_name, tool_name, description,
                    vec_distance_cosine(embedding, ?1) AS distance
             FROM vec_tools
             ORDER BY distance, server_name || '/' || tool_name
             LIMIT ?2",
        )?;

        let hits = stmt
            .query_map(params![embedding_to_bytes(&query_vector), k as i64], |row| {
                Ok(SearchHit {
                    server_name: row.get(0)?,
                    tool_name: row.get(1)?,
                    description: row.get(2)?,
                    score: distance_to_score(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(hits)
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Convert an embedding vector to bytes for sqlite-vec queries.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert cosine distance to similarity score (0.0 to 1.0).
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance.clamp(0.0, 1.0)
}
