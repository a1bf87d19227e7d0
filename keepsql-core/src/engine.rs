/*!
The embedded SQLite engine handle.

An [`EngineHandle`] owns one in-memory SQLite connection. Images move in and
out through the SQLite backup API: importing restores a database file into the
in-memory connection, exporting backs the connection up into a file whose bytes
become the snapshot.
*/

use crate::{KeepError, Result};
use bytes::Bytes;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, DatabaseName, OptionalExtension};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Every SQLite database file starts with these 16 bytes
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Table holding the schema-version marker
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// A result row with its column names
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Column names, shared between all rows of one result
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    /// Integer value of the named column
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Text value of the named column
    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::Text(value)) => Some(value),
            _ => None,
        }
    }
}

/// Rows returned by a statement plus whether it wrote to the database
#[derive(Debug)]
pub struct StatementOutcome {
    pub rows: Vec<Row>,
    pub mutated: bool,
}

/// True when `bytes` starts with the SQLite file header
pub fn has_sqlite_header(bytes: &[u8]) -> bool {
    bytes.starts_with(SQLITE_MAGIC)
}

/// Page size recorded in a SQLite header (offset 16, big-endian, 1 means 65536)
fn header_page_size(bytes: &[u8]) -> Option<u32> {
    let raw = u16::from_be_bytes([*bytes.get(16)?, *bytes.get(17)?]);
    match raw {
        1 => Some(65536),
        size if size >= 512 && size.is_power_of_two() => Some(u32::from(size)),
        _ => None,
    }
}

/// The live in-memory database
pub struct EngineHandle {
    conn: Connection,
    id: Uuid,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").field("id", &self.id).finish()
    }
}

impl EngineHandle {
    /// Create an empty in-memory database
    pub fn create_empty() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let handle = Self {
            conn,
            id: Uuid::new_v4(),
        };
        debug!("Created empty engine {}", handle.id);
        Ok(handle)
    }

    /// Open a database image
    ///
    /// Anything that is not a readable SQLite image, including truncated or
    /// damaged files that still carry the header, fails with
    /// [`KeepError::CorruptSnapshot`].
    pub fn open_image(image: &[u8]) -> Result<Self> {
        if !has_sqlite_header(image) {
            return Err(KeepError::corrupt("missing SQLite file header"));
        }
        let page_size = header_page_size(image)
            .ok_or_else(|| KeepError::corrupt("invalid page size in SQLite header"))?;

        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), image)?;

        let mut conn = Connection::open_in_memory()?;
        // In-memory backup targets must match the source page size.
        conn.execute_batch(&format!("PRAGMA page_size = {page_size};"))?;
        conn.restore(
            DatabaseName::Main,
            file.path(),
            None::<fn(rusqlite::backup::Progress)>,
        )
        .map_err(|e| KeepError::corrupt(format!("image does not open: {e}")))?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| KeepError::corrupt(format!("integrity check failed to run: {e}")))?;
        if check != "ok" {
            return Err(KeepError::corrupt(format!("integrity check: {check}")));
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let handle = Self {
            conn,
            id: Uuid::new_v4(),
        };
        debug!("Opened engine {} from {} byte image", handle.id, image.len());
        Ok(handle)
    }

    /// Export the complete database as an image
    pub fn export_image(&self) -> Result<Bytes> {
        let file = tempfile::NamedTempFile::new()?;
        self.conn.backup(DatabaseName::Main, file.path(), None)?;
        let image = std::fs::read(file.path())?;
        Ok(Bytes::from(image))
    }

    /// Unique id of this handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run one statement, collecting any rows it returns
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementOutcome> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let column_count = columns.len();
        let mutated = !stmt.readonly();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(row.get::<_, Value>(index)?);
            }
            collected.push(Row {
                columns: Arc::clone(&columns),
                values,
            });
        }

        Ok(StatementOutcome {
            rows: collected,
            mutated,
        })
    }

    /// Run one statement that returns no rows; yields the number of changed rows
    pub fn run(&self, sql: &str, params: &[Value]) -> Result<usize> {
        Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
    }

    /// Run a script of several statements
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Whether a table with this name exists
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The stored schema-version marker, `None` for images without one
    pub fn schema_version(&self) -> Result<Option<u32>> {
        if !self.table_exists(SCHEMA_VERSION_TABLE)? {
            return Ok(None);
        }
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(version) FROM schema_version",
                [],
                |row| row.get(0),
            )?;
        Ok(version.and_then(|v| u32::try_from(v).ok()))
    }

    /// Record `version` as the current schema version
    pub fn stamp_schema_version(&self, version: u32) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Total rows across `tables`, skipping tables that do not exist
    pub fn record_count(&self, tables: &[String]) -> Result<u64> {
        let mut total = 0u64;
        for table in tables {
            if !self.table_exists(table)? {
                continue;
            }
            let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
            let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
            total += count.max(0) as u64;
        }
        Ok(total)
    }

    /// Close the connection
    pub fn close(self) -> Result<()> {
        let id = self.id;
        self.conn.close().map_err(|(_, e)| KeepError::from(e))?;
        debug!("Closed engine {}", id);
        Ok(())
    }
}
