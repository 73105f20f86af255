use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use textbook_kernel_core::{
    assemble_passage_set_views, has_qr_code, json_id, DocumentId, ExplanationTransition,
    PassageSet, PassageSetView, PromptVersionOrder, Question, SystemPrompt, SystemPromptVersion,
    Textbook, TextbookPassageMapping, LEGACY_SET_NUMBER_FIELD, LEGACY_TEXTBOOK_ID_FIELD,
    TEXTBOOKS, TEXTBOOK_PASSAGE_MAPPINGS,
};
use textbook_kernel_store_sqlite::{
    DbLocation, IntegrityReport, LegacyRepairOutcome, MissingMappingPolicy, PromptDraft, PromptRevision,
    PurgeOutcome, SchemaStatus, SqliteStore, StoreConfig, StoreError, Tombstone,
};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_QR_BASE_URL: &str = "http://localhost:3000/chat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub store: StoreConfig,
    pub qr_base_url: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { store: StoreConfig::default(), qr_base_url: DEFAULT_QR_BASE_URL.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextbookSummary {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingInventory {
    pub mappings: Vec<Value>,
    pub collections: Vec<String>,
    pub textbooks: Vec<TextbookSummary>,
    pub non_exposable_mappings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingReport {
    pub count: usize,
    pub mappings: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyPassageSet {
    pub passage_set_id: String,
    pub title: Option<String>,
    pub legacy_textbook_id: Option<String>,
    pub legacy_set_number: Option<Value>,
    pub mapping_exists: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RepairOptions {
    pub create_missing_mappings: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairReport {
    pub dry_run: bool,
    pub examined: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub mappings_created: usize,
    pub remaining_legacy: usize,
    pub outcomes: Vec<LegacyRepairOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkRequest {
    pub textbook_id: String,
    pub passage_set_id: String,
    pub order: Option<u32>,
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub collection: String,
    pub path: PathBuf,
    pub sha256: String,
    pub records: usize,
    pub imported: usize,
    pub skipped_existing: usize,
}

/// Maintenance operations over one textbook store. Every call opens its own
/// connection and closes it before returning.
#[derive(Debug, Clone)]
pub struct MaintenanceApi {
    config: MaintenanceConfig,
}

impl MaintenanceApi {
    #[must_use]
    pub fn new(config: MaintenanceConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        Ok(SqliteStore::open_with(&self.config.store)?)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Read paths never create or migrate a file-backed store. An in-memory store starts
    /// empty, so it is migrated like any other call.
    fn open_existing(&self) -> Result<SqliteStore> {
        if self.config.store.location == DbLocation::Memory {
            return self.open_migrated();
        }
        let store = SqliteStore::open_read_only(&self.config.store)?;
        store.ensure_schema_current()?;
        Ok(store)
    }

    fn missing_mapping_policy(&self, create: bool) -> MissingMappingPolicy {
        if create {
            MissingMappingPolicy::Create { qr_base_url: self.config.qr_base_url.clone() }
        } else {
            MissingMappingPolicy::Skip
        }
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        let status = store.schema_status()?;
        finish(store, status)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            let result = MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            };
            return finish(store, result);
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        let result = MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        };
        finish(store, result)
    }

    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated()?;
        let report = store.integrity_check()?;
        finish(store, report)
    }

    /// Every mapping verbatim, every collection name, and a summary of each textbook.
    ///
    /// # Errors
    /// Returns a connection error when the store is unreachable and a query error when any
    /// read fails.
    pub fn list_all_mappings(&self) -> Result<MappingInventory> {
        let store = self.open_existing()?;
        let mappings = store.find_raw(TEXTBOOK_PASSAGE_MAPPINGS)?;
        let collections = store.list_collection_names()?;
        let textbooks = store
            .find_raw(TEXTBOOKS)?
            .iter()
            .map(|textbook| TextbookSummary {
                id: textbook.get("_id").and_then(json_id).unwrap_or_default(),
                title: textbook.get("title").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>();
        let non_exposable_mappings = mappings.iter().filter(|mapping| !has_qr_code(mapping)).count();

        tracing::info!(
            mappings = mappings.len(),
            collections = collections.len(),
            textbooks = textbooks.len(),
            non_exposable_mappings,
            "listed mappings"
        );
        finish(store, MappingInventory { mappings, collections, textbooks, non_exposable_mappings })
    }

    /// # Errors
    /// Returns an error when the purge transaction fails; nothing is deleted in that case.
    pub fn purge_mappings_without_qr(&self, dry_run: bool) -> Result<PurgeOutcome> {
        let mut store = self.open_migrated()?;
        let outcome = store.purge_mappings_without_qr(dry_run)?;
        finish(store, outcome)
    }

    /// Every passage set still carrying legacy fields, with whether its association is
    /// already preserved as a mapping.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn detect_legacy_passage_sets(&self) -> Result<Vec<LegacyPassageSet>> {
        let store = self.open_existing()?;
        let mut detected = Vec::new();
        for document in store.find_legacy_passage_sets()? {
            let passage_set_id = document.get("_id").and_then(json_id).unwrap_or_default();
            let legacy_textbook_id = document
                .get(LEGACY_TEXTBOOK_ID_FIELD)
                .and_then(json_id)
                .filter(|id| !id.trim().is_empty());
            let mapping_exists = match legacy_textbook_id.as_deref() {
                Some(textbook_id) => store.mapping_exists(textbook_id, &passage_set_id)?,
                None => false,
            };
            detected.push(LegacyPassageSet {
                title: document.get("title").and_then(Value::as_str).map(str::to_string),
                legacy_set_number: document.get(LEGACY_SET_NUMBER_FIELD).cloned(),
                passage_set_id,
                legacy_textbook_id,
                mapping_exists,
            });
        }
        tracing::info!(count = detected.len(), "detected legacy passage sets");
        finish(store, detected)
    }

    /// Remove legacy fields from every passage set whose association is preserved, one
    /// transaction per passage set.
    ///
    /// # Errors
    /// Returns an error on the first failed repair; passage sets repaired before it stay
    /// repaired.
    pub fn strip_legacy_fields(&self, options: RepairOptions) -> Result<RepairReport> {
        let mut store = self.open_migrated()?;
        let policy = self.missing_mapping_policy(options.create_missing_mappings);

        let ids = store
            .find_legacy_passage_sets()?
            .iter()
            .filter_map(|document| document.get("_id").and_then(json_id))
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in &ids {
            let outcome = store
                .repair_legacy_passage_set(id, &policy, options.dry_run)
                .with_context(|| format!("failed to repair legacy passage set {id}"))?;
            outcomes.push(outcome);
        }

        let normalized = outcomes.iter().filter(|outcome| outcome.is_normalized()).count();
        let mappings_created = outcomes
            .iter()
            .filter(|outcome| {
                matches!(outcome, LegacyRepairOutcome::Normalized { mapping_created: Some(_), .. })
            })
            .count();
        let remaining_legacy = store.find_legacy_passage_sets()?.len();
        let report = RepairReport {
            dry_run: options.dry_run,
            examined: ids.len(),
            normalized,
            skipped: ids.len() - normalized,
            mappings_created,
            remaining_legacy,
            outcomes,
        };

        tracing::info!(
            examined = report.examined,
            normalized = report.normalized,
            skipped = report.skipped,
            mappings_created = report.mappings_created,
            remaining_legacy = report.remaining_legacy,
            dry_run = report.dry_run,
            "stripped legacy passage set fields"
        );
        finish(store, report)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn report_current_mappings(&self) -> Result<MappingReport> {
        let store = self.open_existing()?;
        let mappings = store.find_raw(TEXTBOOK_PASSAGE_MAPPINGS)?;
        tracing::info!(count = mappings.len(), "current mappings");
        finish(store, MappingReport { count: mappings.len(), mappings })
    }

    /// # Errors
    /// Returns a write error when the key is already taken.
    pub fn insert_prompt(&self, prompt: &SystemPrompt) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.insert(prompt)?;
        finish(store, ())
    }

    /// # Errors
    /// Returns a write error when (`promptKey`, `version`) is already taken.
    pub fn insert_prompt_version(&self, version: &SystemPromptVersion) -> Result<()> {
        let mut store = self.open_migrated()?;
        store.insert(version)?;
        finish(store, ())
    }

    /// # Errors
    /// Returns an error when validation or the save transaction fails.
    pub fn save_prompt(&self, draft: &PromptDraft) -> Result<PromptRevision> {
        let mut store = self.open_migrated()?;
        let revision = store.save_prompt(draft, OffsetDateTime::now_utc())?;
        finish(store, revision)
    }

    /// # Errors
    /// Returns an error when the prompt or version is unknown.
    pub fn restore_prompt_version(&self, key: &str, version: u32) -> Result<PromptRevision> {
        let mut store = self.open_migrated()?;
        let revision = store.restore_prompt_version(key, version, OffsetDateTime::now_utc())?;
        finish(store, revision)
    }

    /// # Errors
    /// Returns an error when the prompt is unknown.
    pub fn set_prompt_active(&self, key: &str, is_active: bool) -> Result<SystemPrompt> {
        let mut store = self.open_migrated()?;
        let prompt = store.set_prompt_active(key, is_active, OffsetDateTime::now_utc())?;
        finish(store, prompt)
    }

    /// # Errors
    /// Returns an error when the history cannot be read.
    pub fn list_prompt_versions(
        &self,
        key: &str,
        order: PromptVersionOrder,
        limit: Option<usize>,
    ) -> Result<Vec<SystemPromptVersion>> {
        let store = self.open_existing()?;
        let versions = store.list_prompt_versions(key, order, limit)?;
        finish(store, versions)
    }

    /// # Errors
    /// Returns an error when either document is missing or the link collides.
    pub fn link_passage_set(&self, request: &LinkRequest) -> Result<TextbookPassageMapping> {
        let mut store = self.open_migrated()?;
        let mapping = store.link_passage_set(
            &request.textbook_id,
            &request.passage_set_id,
            request.order,
            request.qr_code.clone(),
            &self.config.qr_base_url,
            OffsetDateTime::now_utc(),
        )?;
        finish(store, mapping)
    }

    /// # Errors
    /// Returns an error when no mapping links the pair.
    pub fn unlink_passage_set(&self, textbook_id: &str, passage_set_id: &str) -> Result<Tombstone> {
        let mut store = self.open_migrated()?;
        let tombstone = store.unlink_passage_set(textbook_id, passage_set_id)?;
        finish(store, tombstone)
    }

    /// Passage sets of one textbook, ordered by mapping `order`. Mappings without a QR
    /// code are never exposed.
    ///
    /// Referenced documents that no longer match their schema are logged and left out.
    ///
    /// # Errors
    /// Returns not-found for an unknown textbook and a query error when a read fails.
    pub fn textbook_passage_sets(&self, textbook_id: &str) -> Result<Vec<PassageSetView>> {
        let store = self.open_existing()?;
        let target = DocumentId::parse(textbook_id)?;
        if store.get::<Textbook>(&target)?.is_none() {
            return Err(StoreError::NotFound {
                collection: TEXTBOOKS.to_string(),
                id: textbook_id.to_string(),
            }
            .into());
        }

        let mappings = store.exposable_mappings_for_textbook(target.as_str())?;
        let wanted_sets = mappings
            .iter()
            .filter(|mapping| mapping.textbook_id == target)
            .map(|mapping| mapping.passage_set_id.clone())
            .collect::<BTreeSet<_>>();
        let wanted_textbooks = mappings
            .iter()
            .filter(|mapping| wanted_sets.contains(&mapping.passage_set_id))
            .map(|mapping| mapping.textbook_id.clone())
            .collect::<BTreeSet<_>>();

        let mut passage_sets = Vec::with_capacity(wanted_sets.len());
        for id in &wanted_sets {
            if let Some(passage_set) = store.get_decodable::<PassageSet>(id)? {
                passage_sets.push(passage_set);
            }
        }
        let mut textbooks = Vec::with_capacity(wanted_textbooks.len());
        for id in &wanted_textbooks {
            if let Some(textbook) = store.get_decodable::<Textbook>(id)? {
                textbooks.push(textbook);
            }
        }

        let views = assemble_passage_set_views(&target, &mappings, &passage_sets, &textbooks);
        finish(store, views)
    }

    /// # Errors
    /// Returns an error for unknown questions or transitions the lifecycle does not allow.
    pub fn transition_explanation(
        &self,
        question_id: &str,
        transition: ExplanationTransition,
    ) -> Result<Question> {
        let mut store = self.open_migrated()?;
        let question_id = DocumentId::parse(question_id)?;
        let question =
            store.transition_explanation(&question_id, transition, OffsetDateTime::now_utc())?;
        finish(store, question)
    }

    /// Load one NDJSON file into `collection` in a single transaction.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or when the import is
    /// rejected; nothing is written in either case.
    pub fn import_ndjson(
        &self,
        collection: &str,
        path: &Path,
        skip_existing: bool,
    ) -> Result<ImportReport> {
        let (sha256, documents) = read_ndjson_with_digest(path)?;
        let records = documents.len();

        let mut store = self.open_migrated()?;
        let counts = store
            .import_raw(collection, documents, skip_existing)
            .with_context(|| format!("failed to import {} into {collection}", path.display()))?;
        let report = ImportReport {
            collection: collection.to_string(),
            path: path.to_path_buf(),
            sha256,
            records,
            imported: counts.imported,
            skipped_existing: counts.skipped_existing,
        };
        finish(store, report)
    }

    /// # Errors
    /// Returns an error when the tombstone table cannot be read.
    pub fn list_tombstones(&self, collection: Option<&str>) -> Result<Vec<Tombstone>> {
        let store = self.open_existing()?;
        let tombstones = store.list_tombstones(collection)?;
        finish(store, tombstones)
    }

    /// # Errors
    /// Returns an error when the tombstone is unknown, already restored, or collides.
    pub fn restore_tombstone(&self, tombstone_id: &str) -> Result<Tombstone> {
        let mut store = self.open_migrated()?;
        let tombstone = store.restore_tombstone(tombstone_id)?;
        finish(store, tombstone)
    }
}

fn finish<T>(store: SqliteStore, value: T) -> Result<T> {
    store.close()?;
    Ok(value)
}

fn read_ndjson_with_digest(path: &Path) -> Result<(String, Vec<Value>)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok((format!("{:x}", hasher.finalize()), values))
}
