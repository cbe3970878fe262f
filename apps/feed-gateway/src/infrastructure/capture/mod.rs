//! Durable Capture Log
//!
//! SQLite-backed (via Turso) append log for the messages a client
//! receives. Each client gets its own database file holding a single
//! two-column table:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <table> (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     message TEXT NOT NULL
//! )
//! ```
//!
//! # Design
//!
//! - **Fresh handle per operation.** Every public operation opens its
//!   own database handle. The storage engine is write-ahead-log based,
//!   so the broadcaster can append while a control-plane read is in
//!   flight without either blocking the other.
//! - **Bounded retention.** A store constructed with a nonzero limit
//!   evicts the oldest rows inside the same transaction as the insert,
//!   keeping the most recent `limit` rows. Row ids keep counting
//!   upward; neither eviction nor [`CaptureStore::clear`] resets the
//!   `AUTOINCREMENT` sequence.
//! - **Canonical text.** Messages are stored as text: string values
//!   verbatim, everything else as compact JSON. Reads decode
//!   best-effort, falling back to the raw string when the stored text
//!   is not JSON.
//! - **Read-only ad hoc queries.** [`CaptureStore::query`] accepts
//!   either a bare `WHERE` fragment or a full `SELECT` statement, and
//!   refuses anything that could mutate the table before a database
//!   handle is even opened.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the capture log.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Table name contained characters outside `[A-Za-z0-9_]`.
    #[error("invalid capture table name: '{0}'")]
    InvalidTableName(String),

    /// Underlying database error.
    #[error("storage error: {0}")]
    Storage(#[from] turso::Error),

    /// Message could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ad hoc query led with a mutating verb.
    #[error("refusing non-SELECT statement in capture query: '{0}'")]
    MutationRejected(String),

    /// Ad hoc query was blank.
    #[error("capture query clause is empty")]
    EmptyQuery,

    /// A row came back with an unexpected column type.
    #[error("unexpected column value in capture table: {0}")]
    UnexpectedColumn(&'static str),

    /// Archive file was not a capture envelope.
    #[error("capture archive is malformed: {0}")]
    MalformedEnvelope(&'static str),

    /// Archive payload did not match its signature.
    #[error("capture archive signature mismatch")]
    SignatureMismatch,

    /// Archive file could not be read or written.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Records and Archive Envelope
// =============================================================================

/// A single captured message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Monotonically increasing row id. Never reused, even across
    /// eviction and clears.
    pub id: i64,
    /// The captured message, decoded from canonical text where
    /// possible.
    pub message: Value,
}

/// Archive format marker written into every export.
const ENVELOPE_FORMAT: &str = "feed-gateway-capture/1";

/// On-disk envelope for exported captures.
///
/// The payload is the serialized record array as a single string, and
/// the signature is the SHA-256 of that string's bytes. Imports verify
/// the signature before trusting any of the payload's content.
#[derive(Debug, Serialize, Deserialize)]
struct CaptureEnvelope {
    format: String,
    signature: String,
    payload: String,
}

// =============================================================================
// Capture Store
// =============================================================================

/// Verbs that disqualify an ad hoc query before storage is touched.
const MUTATION_VERBS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "replace", "pragma", "attach",
    "detach", "vacuum", "begin", "commit", "rollback", "reindex", "savepoint", "release",
    "analyze",
];

/// Durable, bounded capture log for one client's message traffic.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    path: String,
    table: String,
    limit: Option<u64>,
}

impl CaptureStore {
    /// Create a store handle for the given database file and table.
    ///
    /// A `limit` of zero means unlimited retention. No I/O happens
    /// here; call [`CaptureStore::prepare`] to create the table.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidTableName`] when the table name
    /// is not a bare SQL identifier. The name is interpolated into
    /// statements directly, so anything else is refused outright.
    pub fn new(
        path: impl Into<String>,
        table: impl Into<String>,
        limit: u64,
    ) -> Result<Self, CaptureError> {
        let table = table.into();
        validate_table_name(&table)?;

        Ok(Self {
            path: path.into(),
            table,
            limit: (limit > 0).then_some(limit),
        })
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open the database and create the capture table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Storage`] when the database file cannot
    /// be opened or the table cannot be created.
    pub async fn prepare(&self) -> Result<(), CaptureError> {
        let conn = self.open().await?;
        self.ensure_table(&conn).await
    }

    /// Append a message to the log.
    ///
    /// String values are stored verbatim; everything else is stored as
    /// compact JSON. When the store is bounded, rows beyond the
    /// retention limit are evicted in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Storage`] on database failure.
    pub async fn write(&self, message: &Value) -> Result<(), CaptureError> {
        self.write_text(&canonical_text(message)).await
    }

    /// Append raw text to the log without re-encoding it.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Storage`] on database failure.
    pub async fn write_text(&self, message: &str) -> Result<(), CaptureError> {
        let conn = self.open().await?;
        self.ensure_table(&conn).await?;

        conn.execute("BEGIN", ()).await?;
        let appended = self.append_in_txn(&conn, message).await;
        if appended.is_err() {
            let _ = conn.execute("ROLLBACK", ()).await;
            return appended;
        }
        conn.execute("COMMIT", ()).await?;
        Ok(())
    }

    /// Fetch captured records, most recent first.
    ///
    /// `limit` caps the number of returned rows; `None` returns the
    /// whole log.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Storage`] on database failure.
    pub async fn fetch_all(&self, limit: Option<u64>) -> Result<Vec<CaptureRecord>, CaptureError> {
        let conn = self.open().await?;
        self.ensure_table(&conn).await?;

        let sql = limit.map_or_else(
            || format!("SELECT id, message FROM {} ORDER BY id DESC", self.table),
            |n| format!("SELECT id, message FROM {} ORDER BY id DESC LIMIT {n}", self.table),
        );

        let mut rows = conn.query(&sql, ()).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let turso::Value::Integer(id) = row.get_value(0)? else {
                return Err(CaptureError::UnexpectedColumn("id"));
            };
            let turso::Value::Text(text) = row.get_value(1)? else {
                return Err(CaptureError::UnexpectedColumn("message"));
            };

            let message = serde_json::from_str(&text).unwrap_or(Value::String(text));
            records.push(CaptureRecord { id, message });
        }

        Ok(records)
    }

    /// Fetch captured messages decoded into a concrete type, most
    /// recent first.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Serialization`] when a stored message
    /// does not match `T`.
    pub async fn fetch_all_as<T: DeserializeOwned>(
        &self,
        limit: Option<u64>,
    ) -> Result<Vec<T>, CaptureError> {
        self.fetch_all(limit)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record.message).map_err(CaptureError::from))
            .collect()
    }

    /// Run a read-only ad hoc query against the log.
    ///
    /// Accepts either a full `SELECT` statement or a bare `WHERE`
    /// fragment, which is wrapped into
    /// `SELECT message FROM <table> WHERE <fragment>`. Anything leading
    /// with a mutating verb is rejected before a database handle is
    /// opened, so the gate holds even when storage is unavailable.
    ///
    /// Single-column rows collapse to the column value (JSON-decoded
    /// where possible); wider rows come back as arrays.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::MutationRejected`] for non-SELECT
    /// statements and [`CaptureError::Storage`] on database failure.
    pub async fn query(&self, clause: &str) -> Result<Vec<Value>, CaptureError> {
        let sql = self.build_query(clause)?;

        let conn = self.open().await?;
        self.ensure_table(&conn).await?;

        let mut rows = conn.query(&sql, ()).await?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let width = row.column_count();
            if width == 1 {
                results.push(decode_column(row.get_value(0)?));
            } else {
                let mut columns = Vec::with_capacity(width);
                for index in 0..width {
                    columns.push(column_to_json(row.get_value(index)?));
                }
                results.push(Value::Array(columns));
            }
        }

        Ok(results)
    }

    /// Delete every captured row.
    ///
    /// Returns the number of rows removed. The id sequence is not
    /// reset: the next insert continues from the highest id ever used.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Storage`] on database failure.
    pub async fn clear(&self) -> Result<u64, CaptureError> {
        let conn = self.open().await?;
        self.ensure_table(&conn).await?;

        let removed = conn
            .execute(&format!("DELETE FROM {}", self.table), ())
            .await?;
        Ok(removed)
    }

    /// Export the whole log to a signed archive file.
    ///
    /// Returns the number of records exported.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Io`] when the archive cannot be written.
    pub async fn export(&self, path: &Path) -> Result<u64, CaptureError> {
        let records = self.fetch_all(None).await?;
        let payload = serde_json::to_string(&records)?;

        let envelope = CaptureEnvelope {
            format: ENVELOPE_FORMAT.to_string(),
            signature: sha256_hex(payload.as_bytes()),
            payload,
        };

        tokio::fs::write(path, serde_json::to_vec_pretty(&envelope)?).await?;
        Ok(records.len() as u64)
    }

    /// Import records from a signed archive file produced by
    /// [`CaptureStore::export`].
    ///
    /// The payload signature is verified before any of its content is
    /// parsed or written. Imported messages receive fresh ids; archive
    /// ids are not replayed. Returns the number of records imported.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::MalformedEnvelope`] when the file is not
    /// a capture archive and [`CaptureError::SignatureMismatch`] when
    /// the payload does not match its signature.
    pub async fn import(&self, path: &Path) -> Result<u64, CaptureError> {
        let raw = tokio::fs::read_to_string(path).await?;

        let envelope: CaptureEnvelope = serde_json::from_str(&raw)
            .map_err(|_| CaptureError::MalformedEnvelope("not a capture envelope"))?;
        if envelope.format != ENVELOPE_FORMAT {
            return Err(CaptureError::MalformedEnvelope("unknown format marker"));
        }
        if sha256_hex(envelope.payload.as_bytes()) != envelope.signature {
            return Err(CaptureError::SignatureMismatch);
        }

        let records: Vec<CaptureRecord> = serde_json::from_str(&envelope.payload)
            .map_err(|_| CaptureError::MalformedEnvelope("payload is not a record array"))?;

        let conn = self.open().await?;
        self.ensure_table(&conn).await?;

        conn.execute("BEGIN", ()).await?;
        let mut imported = 0u64;
        // Archives are newest-first; insert oldest-first so relative
        // order survives the fresh id assignment.
        for record in records.iter().rev() {
            let text = canonical_text(&record.message);
            let inserted = conn
                .execute(
                    &format!("INSERT INTO {} (message) VALUES (?1)", self.table),
                    (text.as_str(),),
                )
                .await;
            if let Err(err) = inserted {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(err.into());
            }
            imported += 1;
        }
        if let Some(limit) = self.limit {
            if let Err(err) = self.evict_in_txn(&conn, limit).await {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(err);
            }
        }
        conn.execute("COMMIT", ()).await?;

        Ok(imported)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Open a fresh database handle.
    async fn open(&self) -> Result<turso::Connection, CaptureError> {
        let db = turso::Builder::new_local(&self.path).build().await?;
        Ok(db.connect()?)
    }

    async fn ensure_table(&self, conn: &turso::Connection) -> Result<(), CaptureError> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, message TEXT NOT NULL)",
                self.table
            ),
            (),
        )
        .await?;
        Ok(())
    }

    /// Insert one row and apply retention, inside an open transaction.
    async fn append_in_txn(
        &self,
        conn: &turso::Connection,
        message: &str,
    ) -> Result<(), CaptureError> {
        conn.execute(
            &format!("INSERT INTO {} (message) VALUES (?1)", self.table),
            (message,),
        )
        .await?;

        if let Some(limit) = self.limit {
            self.evict_in_txn(conn, limit).await?;
        }
        Ok(())
    }

    /// Drop every row older than the newest `limit` rows.
    async fn evict_in_txn(&self, conn: &turso::Connection, limit: u64) -> Result<(), CaptureError> {
        let sql = format!(
            "SELECT id FROM {} ORDER BY id DESC LIMIT 1 OFFSET {}",
            self.table,
            limit - 1
        );

        let mut rows = conn.query(&sql, ()).await?;
        let Some(row) = rows.next().await? else {
            // Fewer rows than the limit; nothing to evict.
            return Ok(());
        };
        let turso::Value::Integer(cutoff) = row.get_value(0)? else {
            return Err(CaptureError::UnexpectedColumn("id"));
        };

        conn.execute(
            &format!("DELETE FROM {} WHERE id < ?1", self.table),
            (cutoff,),
        )
        .await?;
        Ok(())
    }

    /// Resolve an ad hoc clause into a full statement, rejecting
    /// mutations. Pure string work: no storage is touched here.
    fn build_query(&self, clause: &str) -> Result<String, CaptureError> {
        let trimmed = clause.trim();
        if trimmed.is_empty() {
            return Err(CaptureError::EmptyQuery);
        }

        let head = trimmed
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if MUTATION_VERBS.contains(&head.as_str()) {
            return Err(CaptureError::MutationRejected(head));
        }

        if head == "select" {
            return Ok(trimmed.to_string());
        }

        Ok(format!(
            "SELECT message FROM {} WHERE {trimmed}",
            self.table
        ))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Canonical text form: strings verbatim, everything else compact JSON.
fn canonical_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Decode a single-column result, preferring JSON structure.
fn decode_column(value: turso::Value) -> Value {
    match value {
        turso::Value::Text(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => column_to_json(other),
    }
}

/// Raw column-to-JSON conversion without text decoding.
fn column_to_json(value: turso::Value) -> Value {
    match value {
        turso::Value::Null => Value::Null,
        turso::Value::Integer(i) => Value::from(i),
        turso::Value::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        turso::Value::Text(text) => Value::String(text),
        turso::Value::Blob(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn validate_table_name(table: &str) -> Result<(), CaptureError> {
    let mut chars = table.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(CaptureError::InvalidTableName(table.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
