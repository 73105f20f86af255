use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use textbook_kernel_core::{
    canonicalize_document, json_id, validate_collection_name, Document, DocumentId, KernelError,
    PASSAGE_SETS, TEXTBOOKS, TEXTBOOK_PASSAGE_MAPPINGS,
};
use time::OffsetDateTime;

mod maintenance;
mod prompts;

pub use maintenance::{LegacyRepairOutcome, MissingMappingPolicy, PurgeOutcome, Tombstone};
pub use prompts::{PromptDraft, PromptRevision};

pub const DEFAULT_DB_PATH: &str = "./textbook_kernel.sqlite3";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  name TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
  collection TEXT NOT NULL,
  doc_id TEXT NOT NULL,
  body_json TEXT NOT NULL CHECK (json_valid(body_json)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (collection, doc_id),
  FOREIGN KEY (collection) REFERENCES collections(name)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

CREATE UNIQUE INDEX IF NOT EXISTS ux_systemprompts_key
  ON documents(json_extract(body_json, '$.key'))
  WHERE collection = 'systemprompts';

CREATE UNIQUE INDEX IF NOT EXISTS ux_system_prompt_versions_key_version
  ON documents(json_extract(body_json, '$.promptKey'), json_extract(body_json, '$.version'))
  WHERE collection = 'systemPromptVersions';

CREATE UNIQUE INDEX IF NOT EXISTS ux_mappings_textbook_passage_set
  ON documents(json_extract(body_json, '$.textbookId'), json_extract(body_json, '$.passageSetId'))
  WHERE collection = 'textbook_passage_mappings';

CREATE UNIQUE INDEX IF NOT EXISTS ux_mappings_textbook_order
  ON documents(json_extract(body_json, '$.textbookId'), json_extract(body_json, '$.order'))
  WHERE collection = 'textbook_passage_mappings';
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS document_tombstones (
  tombstone_id TEXT PRIMARY KEY,
  collection TEXT NOT NULL,
  doc_id TEXT NOT NULL,
  body_json TEXT NOT NULL CHECK (json_valid(body_json)),
  reason TEXT NOT NULL,
  deleted_at TEXT NOT NULL,
  restored_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_document_tombstones_collection
  ON document_tombstones(collection, deleted_at);
";

/// `qrCode` absent, JSON null, or a string of blanks. Mirrors
/// [`textbook_kernel_core::has_qr_code`].
pub(crate) const MISSING_QR_PREDICATE: &str = "(json_type(body_json, '$.qrCode') IS NULL
      OR json_type(body_json, '$.qrCode') = 'null'
      OR (json_type(body_json, '$.qrCode') = 'text'
          AND trim(json_extract(body_json, '$.qrCode'), ' ' || char(9) || char(10) || char(13)) = ''))";

pub(crate) const LEGACY_PASSAGE_SET_PREDICATE: &str =
    "json_type(body_json, '$.textbookId') IS NOT NULL";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Query,
    Write,
    Validation,
}

impl ErrorKind {
    #[must_use]
    pub fn marker(self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION_ERROR",
            Self::Query => "QUERY_ERROR",
            Self::Write => "WRITE_ERROR",
            Self::Validation => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection error: {context}")]
    Connection {
        context: String,
        #[source]
        source: Option<rusqlite::Error>,
    },
    #[error("query error: {context}")]
    Query {
        context: String,
        #[source]
        source: Option<rusqlite::Error>,
    },
    #[error("write error: {context}")]
    Write {
        context: String,
        #[source]
        source: Option<rusqlite::Error>,
    },
    #[error("{collection} document not found: {id}")]
    NotFound { collection: String, id: String },
    #[error("decode error: {context}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Validation(#[from] KernelError),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Query { .. } | Self::NotFound { .. } | Self::Decode { .. } => ErrorKind::Query,
            Self::Write { .. } => ErrorKind::Write,
            Self::Validation(KernelError::Query(_)) => ErrorKind::Query,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }

    /// True when SQLite rejected a write because of a UNIQUE/CHECK/FK constraint.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Write { source: Some(rusqlite::Error::SqliteFailure(failure, _)), .. } => {
                failure.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }

    pub(crate) fn not_found(collection: &str, id: impl Into<String>) -> Self {
        Self::NotFound { collection: collection.to_string(), id: id.into() }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(KernelError::Validation(message.into()))
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

pub(crate) trait SqlContext<T> {
    fn connection_ctx(self, context: impl Into<String>) -> Result<T>;
    fn query_ctx(self, context: impl Into<String>) -> Result<T>;
    fn write_ctx(self, context: impl Into<String>) -> Result<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn connection_ctx(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| StoreError::Connection {
            context: context.into(),
            source: Some(source),
        })
    }

    fn query_ctx(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| StoreError::Query { context: context.into(), source: Some(source) })
    }

    fn write_ctx(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| StoreError::Write { context: context.into(), source: Some(source) })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum DbLocation {
    File(PathBuf),
    Memory,
}

/// Where and how to open the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub location: DbLocation,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: DbLocation::File(PathBuf::from(DEFAULT_DB_PATH)),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Parse `sqlite::memory:`, `:memory:`, `sqlite://<path>`, `sqlite:<path>`,
    /// or a bare filesystem path.
    ///
    /// # Errors
    /// Returns a connection error for an empty string or an unsupported scheme.
    pub fn from_connection_string(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::Connection {
                context: "connection string MUST be non-empty".to_string(),
                source: None,
            });
        }

        let location = if matches!(trimmed, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
        {
            DbLocation::Memory
        } else if let Some(path) = trimmed.strip_prefix("sqlite://") {
            DbLocation::File(PathBuf::from(path))
        } else if let Some(path) = trimmed.strip_prefix("sqlite:") {
            DbLocation::File(PathBuf::from(path))
        } else if trimmed.contains("://") {
            return Err(StoreError::Connection {
                context: format!("unsupported connection string scheme: {trimmed}"),
                source: None,
            });
        } else {
            DbLocation::File(PathBuf::from(trimmed))
        };

        Ok(Self { location, busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS })
    }

    #[must_use]
    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match &self.location {
            DbLocation::File(path) => path.display().to_string(),
            DbLocation::Memory => ":memory:".to_string(),
        }
    }
}

pub struct SqliteStore {
    conn: Connection,
    label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportCounts {
    pub imported: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainIntegrity {
    pub mappings_without_qr: usize,
    pub legacy_passage_sets: usize,
    pub dangling_mappings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
    pub domain: DomainIntegrity,
}

impl SqliteStore {
    /// Open a file-backed store with the default busy timeout.
    ///
    /// # Errors
    /// Returns a connection error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let location = if path == Path::new(":memory:") {
            DbLocation::Memory
        } else {
            DbLocation::File(path.to_path_buf())
        };
        Self::open_with(&StoreConfig { location, busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS })
    }

    /// Open the store described by `config` and apply runtime pragmas.
    ///
    /// # Errors
    /// Returns a connection error when the database cannot be opened or configured.
    pub fn open_with(config: &StoreConfig) -> Result<Self> {
        let label = config.describe();
        let conn = match &config.location {
            DbLocation::File(path) => Connection::open(path),
            DbLocation::Memory => Connection::open_in_memory(),
        }
        .connection_ctx(format!("failed to open sqlite database at {label}"))?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .connection_ctx("failed to configure busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .connection_ctx("failed to configure sqlite pragmas")?;

        tracing::debug!(db = %label, "opened store connection");
        Ok(Self { conn, label })
    }

    /// Open an existing store without write access. A missing database file is a
    /// connection error; nothing is created on disk.
    ///
    /// # Errors
    /// Returns a connection error when the file does not exist or cannot be opened.
    pub fn open_read_only(config: &StoreConfig) -> Result<Self> {
        let label = config.describe();
        let conn = match &config.location {
            DbLocation::File(path) => {
                if !path.is_file() {
                    return Err(StoreError::Connection {
                        context: format!("no sqlite database at {label}"),
                        source: None,
                    });
                }
                Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
            }
            DbLocation::Memory => Connection::open_in_memory(),
        }
        .connection_ctx(format!("failed to open sqlite database at {label} read-only"))?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .connection_ctx("failed to configure busy timeout")?;

        tracing::debug!(db = %label, "opened read-only store connection");
        Ok(Self { conn, label })
    }

    /// Release the connection, surfacing any failure to finalize it.
    ///
    /// # Errors
    /// Returns a connection error when `SQLite` refuses to close.
    pub fn close(self) -> Result<()> {
        let label = self.label;
        self.conn.close().map_err(|(_, source)| StoreError::Connection {
            context: format!("failed to close sqlite database at {label}"),
            source: Some(source),
        })?;
        tracing::debug!(db = %label, "closed store connection");
        Ok(())
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Fail unless the schema is at the latest version. Read paths call this instead of
    /// migrating.
    ///
    /// # Errors
    /// Returns a query error naming the pending versions.
    pub fn ensure_schema_current(&self) -> Result<()> {
        let status = self.schema_status()?;
        if status.pending_versions.is_empty() {
            return Ok(());
        }
        Err(StoreError::Query {
            context: format!(
                "store at {} is at schema version {}; pending migrations {:?} must be applied with `db migrate`",
                self.label, status.current_version, status.pending_versions
            ),
            source: None,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .write_ctx("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            let tx = self.conn.transaction().write_ctx("failed to start migration v2")?;
            tx.execute_batch(MIGRATION_002_SQL).write_ctx("failed to apply migration v2")?;
            record_schema_version(&tx, 2)?;
            tx.commit().write_ctx("failed to commit migration v2")?;
            version = current_schema_version(&self.conn)?;
            tracing::info!(db = %self.label, "applied schema migration v2");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Query {
                context: format!(
                    "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
                ),
                source: None,
            });
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "documents")? {
            self.conn.execute_batch(MIGRATION_001_SQL).write_ctx("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            tracing::info!(db = %self.label, "applied schema migration v1");
            return Ok(1);
        }

        if table_exists(&self.conn, "document_tombstones")? {
            // Tables exist but the migration ledger was never written.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    /// Names of every collection that has ever held a document, sorted.
    ///
    /// # Errors
    /// Returns a query error when the collection registry cannot be read.
    pub fn list_collection_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM collections ORDER BY name ASC")
            .query_ctx("failed to prepare collection listing")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .query_ctx("failed to list collections")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.query_ctx("failed to read collection name")?);
        }
        Ok(names)
    }

    /// # Errors
    /// Returns a query error when the count cannot be read.
    pub fn count_documents(&self, collection: &str) -> Result<usize> {
        count_documents(&self.conn, collection)
    }

    /// Every document of a collection verbatim, in insertion order.
    ///
    /// # Errors
    /// Returns a query or decode error when rows cannot be read.
    pub fn find_raw(&self, collection: &str) -> Result<Vec<Value>> {
        let rows = select_documents(
            &self.conn,
            "SELECT doc_id, body_json FROM documents WHERE collection = ?1 ORDER BY rowid ASC",
            params![collection],
            &format!("failed to read {collection}"),
        )?;
        Ok(rows.into_iter().map(|(_, body)| body).collect())
    }

    /// # Errors
    /// Returns a query or decode error when the row cannot be read.
    pub fn find_raw_by_id(&self, collection: &str, id: &DocumentId) -> Result<Option<Value>> {
        find_document(&self.conn, collection, id.as_str())
    }

    /// Insert one untyped document, assigning `_id` when absent.
    ///
    /// # Errors
    /// Returns a validation error for bad collection names or non-object documents and a
    /// write error when the insert is rejected.
    pub fn insert_raw(&mut self, collection: &str, document: Value) -> Result<DocumentId> {
        validate_collection_name(collection)?;
        let document = prepare_raw_document(document)?;
        insert_document(&self.conn, collection, &document)
    }

    /// Load untyped documents in one transaction, as `mongoexport` output is loaded.
    ///
    /// # Errors
    /// Returns a write error on the first rejected document; nothing is kept in that case.
    pub fn import_raw(
        &mut self,
        collection: &str,
        documents: Vec<Value>,
        skip_existing: bool,
    ) -> Result<ImportCounts> {
        validate_collection_name(collection)?;
        let tx = self.conn.transaction().write_ctx("failed to start import transaction")?;
        let mut counts = ImportCounts { imported: 0, skipped_existing: 0 };

        for document in documents {
            let document = prepare_raw_document(document)?;
            let id = document_id_of(&document)?;
            if find_document(&tx, collection, &id)?.is_some() {
                if skip_existing {
                    counts.skipped_existing += 1;
                    continue;
                }
                return Err(StoreError::Write {
                    context: format!("{collection} document already exists: {id}"),
                    source: None,
                });
            }
            insert_document(&tx, collection, &document)?;
            counts.imported += 1;
        }

        tx.commit().write_ctx("failed to commit import transaction")?;
        tracing::info!(
            collection,
            imported = counts.imported,
            skipped = counts.skipped_existing,
            "imported documents"
        );
        Ok(counts)
    }

    /// Persist one validated typed document.
    ///
    /// # Errors
    /// Returns a validation error when the document breaks its schema and a write error when
    /// a store constraint rejects it.
    pub fn insert<D: Document>(&mut self, document: &D) -> Result<()> {
        insert_typed(&self.conn, document)
    }

    /// # Errors
    /// Returns a query or decode error when the row cannot be read or does not match `D`.
    pub fn get<D: Document>(&self, id: &DocumentId) -> Result<Option<D>> {
        find_document(&self.conn, D::COLLECTION, id.as_str())?
            .map(|value| decode_typed(D::COLLECTION, value))
            .transpose()
    }

    /// Like [`Self::get`], but a stored document that does not match `D` is logged and
    /// treated as absent.
    ///
    /// # Errors
    /// Returns a query error when the lookup fails.
    pub fn get_decodable<D: Document>(&self, id: &DocumentId) -> Result<Option<D>> {
        match self.get::<D>(id) {
            Err(StoreError::Decode { context, source }) => {
                tracing::warn!(error = %source, "{context}; skipping");
                Ok(None)
            }
            other => other,
        }
    }

    /// # Errors
    /// Returns a query or decode error when any row cannot be read or does not match `D`.
    pub fn list<D: Document>(&self) -> Result<Vec<D>> {
        self.find_raw(D::COLLECTION)?
            .into_iter()
            .map(|value| decode_typed(D::COLLECTION, value))
            .collect()
    }

    /// Run quick-check, foreign-key-check, schema status, and domain invariant checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .query_ctx("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .query_ctx("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .query_ctx("failed to run PRAGMA foreign_key_check")?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.query_ctx("failed to read foreign key violation")?);
        }

        let schema_status = self.schema_status()?;
        let domain = DomainIntegrity {
            mappings_without_qr: count_where(
                &self.conn,
                TEXTBOOK_PASSAGE_MAPPINGS,
                MISSING_QR_PREDICATE,
            )?,
            legacy_passage_sets: count_where(
                &self.conn,
                PASSAGE_SETS,
                LEGACY_PASSAGE_SET_PREDICATE,
            )?,
            dangling_mappings: count_dangling_mappings(&self.conn)?,
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
            domain,
        })
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn prepare_raw_document(mut document: Value) -> Result<Value> {
    let Value::Object(object) = &mut document else {
        return Err(StoreError::invalid("documents MUST be JSON objects"));
    };
    if !object.get("_id").is_some_and(|id| json_id(id).is_some()) {
        object.insert("_id".to_string(), Value::String(DocumentId::new().to_string()));
    }
    canonicalize_document(&mut document);
    Ok(document)
}

pub(crate) fn document_id_of(document: &Value) -> Result<String> {
    document
        .get("_id")
        .and_then(json_id)
        .ok_or_else(|| StoreError::invalid("document is missing a usable _id"))
}

pub(crate) fn insert_typed<D: Document>(conn: &Connection, document: &D) -> Result<()> {
    document.validate()?;
    let value = serde_json::to_value(document).map_err(|source| StoreError::Decode {
        context: format!("failed to serialize {} document", D::COLLECTION),
        source,
    })?;
    insert_document(conn, D::COLLECTION, &value)?;
    Ok(())
}

pub(crate) fn replace_typed<D: Document>(conn: &Connection, document: &D) -> Result<()> {
    document.validate()?;
    let value = serde_json::to_value(document).map_err(|source| StoreError::Decode {
        context: format!("failed to serialize {} document", D::COLLECTION),
        source,
    })?;
    replace_document(conn, D::COLLECTION, document.document_id().as_str(), &value)
}

pub(crate) fn decode_typed<D: Document>(collection: &str, value: Value) -> Result<D> {
    let id = value.get("_id").and_then(json_id).unwrap_or_else(|| "<unknown>".to_string());
    serde_json::from_value(value).map_err(|source| StoreError::Decode {
        context: format!("{collection} document {id} does not match its schema"),
        source,
    })
}

pub(crate) fn insert_document(
    conn: &Connection,
    collection: &str,
    document: &Value,
) -> Result<DocumentId> {
    let id = document_id_of(document)?;
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO collections(name, created_at) VALUES (?1, ?2)",
        params![collection, now],
    )
    .write_ctx(format!("failed to register collection {collection}"))?;
    conn.execute(
        "INSERT INTO documents(collection, doc_id, body_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![collection, id, document.to_string(), now],
    )
    .write_ctx(format!("failed to insert {collection} document {id}"))?;
    Ok(DocumentId(id))
}

pub(crate) fn replace_document(
    conn: &Connection,
    collection: &str,
    id: &str,
    document: &Value,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE documents SET body_json = ?1, updated_at = ?2
             WHERE collection = ?3 AND doc_id = ?4",
            params![document.to_string(), now_rfc3339()?, collection, id],
        )
        .write_ctx(format!("failed to update {collection} document {id}"))?;
    if changed == 0 {
        return Err(StoreError::not_found(collection, id));
    }
    Ok(())
}

pub(crate) fn find_document(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>> {
    let raw = conn
        .query_row(
            "SELECT body_json FROM documents WHERE collection = ?1 AND doc_id = ?2",
            params![collection, id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .query_ctx(format!("failed to read {collection} document {id}"))?;
    raw.map(|raw| decode_body(id, &raw)).transpose()
}

pub(crate) fn select_documents<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    context: &str,
) -> Result<Vec<(String, Value)>> {
    let mut stmt = conn.prepare(sql).query_ctx(context)?;
    let rows = stmt
        .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .query_ctx(context)?;

    let mut documents = Vec::new();
    for row in rows {
        let (doc_id, raw) = row.query_ctx(context)?;
        let body = decode_body(&doc_id, &raw)?;
        documents.push((doc_id, body));
    }
    Ok(documents)
}

fn decode_body(doc_id: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        context: format!("stored document {doc_id} is not valid JSON"),
        source,
    })
}

pub(crate) fn count_documents(conn: &Connection, collection: &str) -> Result<usize> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |row| row.get::<_, i64>(0),
        )
        .query_ctx(format!("failed to count {collection}"))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

pub(crate) fn count_where(conn: &Connection, collection: &str, predicate: &str) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM documents WHERE collection = ?1 AND {predicate}");
    let count = conn
        .query_row(&sql, params![collection], |row| row.get::<_, i64>(0))
        .query_ctx(format!("failed to count {collection}"))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn count_dangling_mappings(conn: &Connection) -> Result<usize> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM documents AS m
             WHERE m.collection = ?1
               AND (
                 NOT EXISTS (
                   SELECT 1 FROM documents AS t
                   WHERE t.collection = ?2
                     AND t.doc_id = CAST(json_extract(m.body_json, '$.textbookId') AS TEXT)
                 )
                 OR NOT EXISTS (
                   SELECT 1 FROM documents AS p
                   WHERE p.collection = ?3
                     AND p.doc_id = CAST(json_extract(m.body_json, '$.passageSetId') AS TEXT)
                 )
               )",
            params![TEXTBOOK_PASSAGE_MAPPINGS, TEXTBOOKS, PASSAGE_SETS],
            |row| row.get::<_, i64>(0),
        )
        .query_ctx("failed to count dangling mappings")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .query_ctx(format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .query_ctx("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = if table_exists(conn, "schema_migrations")? {
        current_schema_version(conn)?
    } else {
        0
    };
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "documents")? {
        return Ok((0, false));
    }

    if table_exists(conn, "document_tombstones")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .write_ctx(format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::invalid(format!("failed to format RFC3339 timestamp: {err}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::{anyhow, Context};
    use serde_json::json;
    use textbook_kernel_core::{Textbook, SYSTEM_PROMPTS};
    use ulid::Ulid;

    use super::*;

    pub(crate) fn migrated_store() -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    pub(crate) fn mk_textbook(id: &str, title: &str) -> Textbook {
        Textbook {
            id: DocumentId(id.to_string()),
            title: title.to_string(),
            subject: "English".to_string(),
            level: "high-2".to_string(),
            year: 2024,
            description: None,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    #[test]
    fn connection_strings_cover_supported_forms() -> anyhow::Result<()> {
        assert_eq!(StoreConfig::from_connection_string("sqlite::memory:")?.location, DbLocation::Memory);
        assert_eq!(StoreConfig::from_connection_string(":memory:")?.location, DbLocation::Memory);
        assert_eq!(
            StoreConfig::from_connection_string("sqlite:///var/lib/tk.sqlite3")?.location,
            DbLocation::File(PathBuf::from("/var/lib/tk.sqlite3"))
        );
        assert_eq!(
            StoreConfig::from_connection_string("./local.sqlite3")?.location,
            DbLocation::File(PathBuf::from("./local.sqlite3"))
        );

        let Err(err) = StoreConfig::from_connection_string("mongodb://localhost:27017/app") else {
            return Err(anyhow!("expected unsupported scheme to be rejected"));
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(StoreConfig::from_connection_string("  ").is_err());
        Ok(())
    }

    #[test]
    fn open_reports_connection_error_for_unreachable_path() -> anyhow::Result<()> {
        let missing_dir = std::env::temp_dir()
            .join(format!("textbook-kernel-missing-{}", Ulid::new()))
            .join("nested")
            .join("db.sqlite3");
        let Err(err) = SqliteStore::open(&missing_dir) else {
            return Err(anyhow!("expected open to fail for a missing parent directory"));
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        Ok(())
    }

    #[test]
    fn read_only_open_never_creates_or_migrates() -> anyhow::Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("textbook-kernel-readonly-{}.sqlite3", Ulid::new()));
        let config = StoreConfig { location: DbLocation::File(db_path.clone()), busy_timeout_ms: 1000 };

        let Err(err) = SqliteStore::open_read_only(&config) else {
            return Err(anyhow!("expected read-only open of a missing file to fail"));
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!db_path.exists());

        SqliteStore::open_with(&config)?.close()?;
        let unmigrated = SqliteStore::open_read_only(&config)?;
        let Err(err) = unmigrated.ensure_schema_current() else {
            return Err(anyhow!("expected an unmigrated store to be rejected"));
        };
        assert_eq!(err.kind(), ErrorKind::Query);
        assert!(!table_exists(unmigrated.conn(), "schema_migrations")?);
        unmigrated.close()?;

        let mut store = SqliteStore::open_with(&config)?;
        store.migrate()?;
        store.close()?;
        let migrated = SqliteStore::open_read_only(&config)?;
        migrated.ensure_schema_current()?;
        assert!(migrated.find_raw(TEXTBOOKS)?.is_empty());
        migrated.close()?;

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn migrate_fresh_database_reaches_latest_version() -> anyhow::Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, 2);
        assert!(after.pending_versions.is_empty());
        assert!(!after.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);
        Ok(())
    }

    #[test]
    fn schema_status_infers_unrecorded_v1_database() -> anyhow::Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert!(table_exists(&store.conn, "document_tombstones")?);
        Ok(())
    }

    #[test]
    fn raw_documents_keep_field_order_and_get_ids() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        let id = store.insert_raw(
            PASSAGE_SETS,
            json!({"title": "Passage 1", "passage": "text", "zeta": 1, "alpha": 2}),
        )?;
        let Some(stored) = store.find_raw_by_id(PASSAGE_SETS, &id)? else {
            return Err(anyhow!("inserted passage set not found"));
        };
        let keys = stored
            .as_object()
            .map(|object| object.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        assert_eq!(keys, vec!["title", "passage", "zeta", "alpha", "_id"]);
        assert_eq!(store.list_collection_names()?, vec![PASSAGE_SETS.to_string()]);
        Ok(())
    }

    #[test]
    fn insert_raw_rejects_non_objects() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        let Err(err) = store.insert_raw(PASSAGE_SETS, json!(["not", "an", "object"])) else {
            return Err(anyhow!("expected array document to be rejected"));
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[test]
    fn import_is_all_or_nothing_and_can_skip_existing() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        let counts = store.import_raw(
            TEXTBOOKS,
            vec![json!({"_id": {"$oid": "65a1"}, "title": "Reading 1"}), json!({"_id": "t2"})],
            false,
        )?;
        assert_eq!(counts, ImportCounts { imported: 2, skipped_existing: 0 });
        assert!(store.find_raw_by_id(TEXTBOOKS, &DocumentId("65a1".to_string()))?.is_some());

        let Err(err) = store.import_raw(TEXTBOOKS, vec![json!({"_id": "t3"}), json!({"_id": "t2"})], false)
        else {
            return Err(anyhow!("expected duplicate import to fail"));
        };
        assert_eq!(err.kind(), ErrorKind::Write);
        assert_eq!(store.count_documents(TEXTBOOKS)?, 2);

        let counts =
            store.import_raw(TEXTBOOKS, vec![json!({"_id": "t3"}), json!({"_id": "t2"})], true)?;
        assert_eq!(counts, ImportCounts { imported: 1, skipped_existing: 1 });
        assert_eq!(store.count_documents(TEXTBOOKS)?, 3);
        Ok(())
    }

    #[test]
    fn typed_documents_round_trip_and_validate() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        let textbook = mk_textbook("t1", "Reading Master");
        store.insert(&textbook)?;

        let loaded = store.get::<Textbook>(&textbook.id)?.context("textbook should exist")?;
        assert_eq!(loaded, textbook);

        let invalid = mk_textbook("t2", " ");
        let Err(err) = store.insert(&invalid) else {
            return Err(anyhow!("expected blank title to be rejected"));
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    #[test]
    fn duplicate_prompt_key_is_a_write_constraint_error() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        store.insert_raw(SYSTEM_PROMPTS, json!({"_id": "p1", "key": "greeting"}))?;
        let Err(err) = store.insert_raw(SYSTEM_PROMPTS, json!({"_id": "p2", "key": "greeting"}))
        else {
            return Err(anyhow!("expected duplicate key to fail"));
        };
        assert_eq!(err.kind(), ErrorKind::Write);
        assert!(err.is_constraint_violation());
        Ok(())
    }

    #[test]
    fn integrity_check_reports_domain_counts() -> anyhow::Result<()> {
        let mut store = migrated_store()?;
        store.insert(&mk_textbook("t1", "Reading"))?;
        store.insert_raw(PASSAGE_SETS, json!({"_id": "p1", "title": "P", "passage": "x"}))?;
        store.insert_raw(PASSAGE_SETS, json!({"_id": "p2", "textbookId": "t1", "setNumber": 1}))?;
        store.insert_raw(
            TEXTBOOK_PASSAGE_MAPPINGS,
            json!({"_id": "m1", "textbookId": "t1", "passageSetId": "p1", "order": 1, "qrCode": "A"}),
        )?;
        store.insert_raw(
            TEXTBOOK_PASSAGE_MAPPINGS,
            json!({"_id": "m2", "textbookId": "t1", "passageSetId": "gone", "order": 2}),
        )?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, 2);
        assert_eq!(
            report.domain,
            DomainIntegrity { mappings_without_qr: 1, legacy_passage_sets: 1, dangling_mappings: 1 }
        );
        Ok(())
    }

    #[test]
    fn close_releases_file_backed_connection() -> anyhow::Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("textbook-kernel-close-{}.sqlite3", Ulid::new()));
        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        store.close()?;

        let reopened = SqliteStore::open(&db_path)?;
        assert_eq!(reopened.schema_status()?.current_version, 2);
        reopened.close()?;

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
