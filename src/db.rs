// src/db.rs
// Persistent tool-metadata store over rusqlite

use crate::config;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, Once};

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension for every connection opened by this
/// process. Safe to call multiple times; the registration happens once.
pub fn register_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// One persisted `(server, tool)` schema row.
#[derive(Debug, Clone)]
pub struct ToolSchemaRow {
    pub server_name: String,
    pub tool_name: String,
    pub output_schema: Option<Value>,
    pub original_output_schema: bool,
    pub last_updated: i64,
}

/// What `save_or_update` did with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub server_count: usize,
    pub tool_count: usize,
    pub original_schema_count: usize,
}

/// Tool metadata store. One per process, opened at startup and threaded by
/// handle; all access goes through the connection mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    serverName TEXT NOT NULL,
    toolName TEXT NOT NULL,
    outputSchema TEXT,
    originalOutputSchema INTEGER NOT NULL DEFAULT 0,
    lastUpdated INTEGER NOT NULL,
    UNIQUE(serverName, toolName)
);
CREATE INDEX IF NOT EXISTS idx_tools_server ON tools(serverName);
"#;

impl Database {
    /// Open the store at `path`, creating file and parent directories if
    /// needed.
    pub fn open(path: &Path) -> Result<Self> {
        register_sqlite_vec();
        config::ensure_parent_dir(path)?;

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        register_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Idempotent upsert of a tool's output schema.
    ///
    /// A schema that came from the downstream server (`original = true`)
    /// always wins. An inferred write never overwrites an original row, and
    /// an inferred write with no schema (or a schema equal to the stored
    /// one) leaves the row untouched.
    pub fn save_or_update(
        &self,
        server_name: &str,
        tool_name: &str,
        output_schema: Option<&Value>,
        original: bool,
    ) -> Result<SaveOutcome> {
        let conn = self.conn();
        let existing = Self::get_tool_on(&conn, server_name, tool_name)?;
        let now = chrono::Utc::now().timestamp_millis();
        let schema_text = output_schema.map(|v| v.to_string());

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO tools (serverName, toolName, outputSchema, originalOutputSchema, lastUpdated)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![server_name, tool_name, schema_text, original as i64, now],
                )?;
                Ok(SaveOutcome::Inserted)
            }
            Some(row) => {
                if row.original_output_schema && !original {
                    return Ok(SaveOutcome::Unchanged);
                }
                if !original && output_schema.is_none() {
                    return Ok(SaveOutcome::Unchanged);
                }
                if row.original_output_schema == original
                    && row.output_schema.as_ref() == output_schema
                {
                    return Ok(SaveOutcome::Unchanged);
                }
                conn.execute(
                    "UPDATE tools SET outputSchema = ?3, originalOutputSchema = ?4, lastUpdated = ?5
                     WHERE serverName = ?1 AND toolName = ?2",
                    params![server_name, tool_name, schema_text, original as i64, now],
                )?;
                Ok(SaveOutcome::Updated)
            }
        }
    }

    pub fn get_tool(&self, server_name: &str, tool_name: &str) -> Result<Option<ToolSchemaRow>> {
        Self::get_tool_on(&self.conn(), server_name, tool_name)
    }

    fn get_tool_on(
        conn: &Connection,
        server_name: &str,
        tool_name: &str,
    ) -> Result<Option<ToolSchemaRow>> {
        let row = conn
            .query_row(
                "SELECT serverName, toolName, outputSchema, originalOutputSchema, lastUpdated
                 FROM tools WHERE serverName = ?1 AND toolName = ?2",
                params![server_name, tool_name],
                Self::row_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_server_tools(&self, server_name: &str) -> Result<Vec<ToolSchemaRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT serverName, toolName, outputSchema, originalOutputSchema, lastUpdated
             FROM tools WHERE serverName = ?1 ORDER BY toolName",
        )?;
        let rows = stmt.query_map(params![server_name], Self::row_from_sql)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete every row belonging to a server. Returns the row count.
    pub fn delete_server_tools(&self, server_name: &str) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM tools WHERE serverName = ?1",
            params![server_name],
        )?;
        Ok(removed)
    }

    /// Distinct server names present in the store, sorted.
    pub fn list_all_servers(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT serverName FROM tools ORDER BY serverName")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let tool_count: i64 = conn.query_row("SELECT COUNT(*) FROM tools", [], |r| r.get(0))?;
        let server_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT serverName) FROM tools",
            [],
            |r| r.get(0),
        )?;
        let original_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tools WHERE originalOutputSchema = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(StoreStats {
            server_count: server_count as usize,
            tool_count: tool_count as usize,
            original_schema_count: original_count as usize,
        })
    }

    fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolSchemaRow> {
        let schema_text: Option<String> = row.get(2)?;
        Ok(ToolSchemaRow {
            server_name: row.get(0)?,
            tool_name: row.get(1)?,
            output_schema: schema_text.and_then(|t| serde_json::from_str(&t).ok()),
            original_output_schema: row.get::<_, i64>(3)? != 0,
            last_updated: row.get(4)?,
        })
    }
}
