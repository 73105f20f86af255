use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use textbook_kernel_core::{
    generate_qr_code, is_blank_qr, json_id, qr_code_url, DocumentId, TextbookPassageMapping,
    LEGACY_SET_NUMBER_FIELD, LEGACY_TEXTBOOK_ID_FIELD, PASSAGE_SETS, TEXTBOOKS,
    TEXTBOOK_PASSAGE_MAPPINGS,
};
use time::OffsetDateTime;

use crate::{
    count_documents, decode_typed, find_document, insert_document, insert_typed,
    now_rfc3339, select_documents, Result, SqlContext, SqliteStore, StoreError,
    LEGACY_PASSAGE_SET_PREDICATE, MISSING_QR_PREDICATE,
};

const PURGE_REASON: &str = "missing_qr_code";
const UNLINK_REASON: &str = "unlinked";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurgeOutcome {
    pub dry_run: bool,
    pub before: usize,
    pub after: usize,
    pub deleted: usize,
    pub candidates: Vec<Value>,
    pub tombstone_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tombstone {
    pub tombstone_id: String,
    pub collection: String,
    pub doc_id: String,
    pub document: Value,
    pub reason: String,
    pub deleted_at: String,
    pub restored_at: Option<String>,
}

/// What to do with a legacy passage set whose association has no mapping yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingMappingPolicy {
    Skip,
    Create { qr_base_url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LegacyRepairOutcome {
    Normalized {
        passage_set_id: String,
        legacy_textbook_id: Option<String>,
        legacy_set_number: Option<Value>,
        mapping_created: Option<TextbookPassageMapping>,
    },
    SkippedMissingMapping {
        passage_set_id: String,
        legacy_textbook_id: String,
    },
    SkippedUnknownTextbook {
        passage_set_id: String,
        legacy_textbook_id: String,
    },
    AlreadyNormalized {
        passage_set_id: String,
    },
}

impl LegacyRepairOutcome {
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        matches!(self, Self::Normalized { .. })
    }
}

impl SqliteStore {
    /// Mappings with a usable QR code that a textbook view needs: the textbook's own
    /// mappings plus every other mapping of the same passage sets, in insertion order.
    /// Rows that do not match the mapping schema are logged and left out.
    ///
    /// # Errors
    /// Returns a query error when rows cannot be read.
    pub fn exposable_mappings_for_textbook(
        &self,
        textbook_id: &str,
    ) -> Result<Vec<TextbookPassageMapping>> {
        let sql = format!(
            "SELECT doc_id, body_json FROM documents
             WHERE collection = ?1 AND NOT {MISSING_QR_PREDICATE}
               AND CAST(json_extract(body_json, '$.passageSetId') AS TEXT) IN (
                 SELECT CAST(json_extract(body_json, '$.passageSetId') AS TEXT) FROM documents
                 WHERE collection = ?1 AND NOT {MISSING_QR_PREDICATE}
                   AND CAST(json_extract(body_json, '$.textbookId') AS TEXT) = ?2
               )
             ORDER BY rowid ASC"
        );
        let rows = select_documents(
            self.conn(),
            &sql,
            params![TEXTBOOK_PASSAGE_MAPPINGS, textbook_id],
            "failed to read exposable mappings",
        )?;

        let mut mappings = Vec::with_capacity(rows.len());
        for (doc_id, body) in rows {
            match decode_typed::<TextbookPassageMapping>(TEXTBOOK_PASSAGE_MAPPINGS, body) {
                Ok(mapping) => mappings.push(mapping),
                Err(StoreError::Decode { source, .. }) => {
                    tracing::warn!(doc_id = %doc_id, error = %source, "skipping malformed mapping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(mappings)
    }

    /// # Errors
    /// Returns a query or decode error when the lookup fails.
    pub fn find_mapping(&self, textbook_id: &str, passage_set_id: &str) -> Result<Option<Value>> {
        Ok(find_mapping_row(self.conn(), textbook_id, passage_set_id)?.map(|(_, body)| body))
    }

    /// Delete every mapping whose `qrCode` is absent, null, or blank.
    ///
    /// The candidate set is a single store-side predicate evaluated inside one
    /// immediate transaction; each deleted document is tombstoned first. With
    /// `dry_run` the transaction is rolled back.
    ///
    /// # Errors
    /// Returns a query error when the collection cannot be read and a write error when the
    /// delete or tombstone inserts fail. Nothing is deleted in either case.
    pub fn purge_mappings_without_qr(&mut self, dry_run: bool) -> Result<PurgeOutcome> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start purge transaction")?;

        let before = count_documents(&tx, TEXTBOOK_PASSAGE_MAPPINGS)?;
        let sql = format!(
            "SELECT doc_id, body_json FROM documents
             WHERE collection = ?1 AND {MISSING_QR_PREDICATE}
             ORDER BY rowid ASC"
        );
        let candidates = select_documents(
            &tx,
            &sql,
            params![TEXTBOOK_PASSAGE_MAPPINGS],
            "failed to select mappings without qr code",
        )?;

        let mut tombstone_ids = Vec::with_capacity(candidates.len());
        for (doc_id, body) in &candidates {
            let (tombstone_id, _) =
                write_tombstone(&tx, TEXTBOOK_PASSAGE_MAPPINGS, doc_id, body, PURGE_REASON)?;
            tombstone_ids.push(tombstone_id);
        }

        let delete_sql =
            format!("DELETE FROM documents WHERE collection = ?1 AND {MISSING_QR_PREDICATE}");
        let deleted = tx
            .execute(&delete_sql, params![TEXTBOOK_PASSAGE_MAPPINGS])
            .write_ctx("failed to delete mappings without qr code")?;
        let after = count_documents(&tx, TEXTBOOK_PASSAGE_MAPPINGS)?;

        let outcome = if dry_run {
            // Dropping the transaction rolls it back.
            drop(tx);
            tracing::info!(
                before,
                would_delete = deleted,
                "dry run: would purge mappings without qr code"
            );
            PurgeOutcome {
                dry_run,
                before,
                after: before,
                deleted: 0,
                candidates: candidates.into_iter().map(|(_, body)| body).collect(),
                tombstone_ids: Vec::new(),
            }
        } else {
            tx.commit().write_ctx("failed to commit purge transaction")?;
            tracing::info!(before, after, deleted, "purged mappings without qr code");
            PurgeOutcome {
                dry_run,
                before,
                after,
                deleted,
                candidates: candidates.into_iter().map(|(_, body)| body).collect(),
                tombstone_ids,
            }
        };
        Ok(outcome)
    }

    /// Tombstones, newest first, optionally narrowed to one collection.
    ///
    /// # Errors
    /// Returns a query or decode error when rows cannot be read.
    pub fn list_tombstones(&self, collection: Option<&str>) -> Result<Vec<Tombstone>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT tombstone_id, collection, doc_id, body_json, reason, deleted_at, restored_at
                 FROM document_tombstones
                 WHERE ?1 IS NULL OR collection = ?1
                 ORDER BY deleted_at DESC, tombstone_id DESC",
            )
            .query_ctx("failed to prepare tombstone listing")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .query_ctx("failed to list tombstones")?;

        let mut tombstones = Vec::new();
        for row in rows {
            let (tombstone_id, collection, doc_id, raw, reason, deleted_at, restored_at) =
                row.query_ctx("failed to read tombstone row")?;
            let document = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                context: format!("tombstone {tombstone_id} is not valid JSON"),
                source,
            })?;
            tombstones.push(Tombstone {
                tombstone_id,
                collection,
                doc_id,
                document,
                reason,
                deleted_at,
                restored_at,
            });
        }
        Ok(tombstones)
    }

    /// Put a tombstoned document back into its collection.
    ///
    /// # Errors
    /// Returns not-found for unknown tombstones, a validation error when the tombstone was
    /// already restored or its id is taken again, and a write error when a unique index
    /// rejects the document.
    pub fn restore_tombstone(&mut self, tombstone_id: &str) -> Result<Tombstone> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start restore transaction")?;

        let row = tx
            .query_row(
                "SELECT collection, doc_id, body_json, reason, deleted_at, restored_at
                 FROM document_tombstones WHERE tombstone_id = ?1",
                params![tombstone_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .query_ctx(format!("failed to read tombstone {tombstone_id}"))?;
        let Some((collection, doc_id, raw, reason, deleted_at, restored_at)) = row else {
            return Err(StoreError::not_found("document_tombstones", tombstone_id));
        };
        if restored_at.is_some() {
            return Err(StoreError::invalid(format!(
                "tombstone {tombstone_id} was already restored"
            )));
        }
        if find_document(&tx, &collection, &doc_id)?.is_some() {
            return Err(StoreError::invalid(format!(
                "{collection} document {doc_id} exists again; refusing to overwrite it"
            )));
        }

        let document: Value = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
            context: format!("tombstone {tombstone_id} is not valid JSON"),
            source,
        })?;
        insert_document(&tx, &collection, &document)?;
        let restored_at = now_rfc3339()?;
        tx.execute(
            "UPDATE document_tombstones SET restored_at = ?1 WHERE tombstone_id = ?2",
            params![restored_at, tombstone_id],
        )
        .write_ctx(format!("failed to mark tombstone {tombstone_id} restored"))?;
        tx.commit().write_ctx("failed to commit restore transaction")?;

        tracing::info!(tombstone_id, collection = %collection, doc_id = %doc_id, "restored document");
        Ok(Tombstone {
            tombstone_id: tombstone_id.to_string(),
            collection,
            doc_id,
            document,
            reason,
            deleted_at,
            restored_at: Some(restored_at),
        })
    }

    /// Link a passage set into a textbook. `order` defaults to the next free slot and a QR
    /// code is generated when none is supplied.
    ///
    /// # Errors
    /// Returns not-found when either document is missing and a write error when the link or
    /// order is already taken.
    pub fn link_passage_set(
        &mut self,
        textbook_id: &str,
        passage_set_id: &str,
        order: Option<u32>,
        qr_code: Option<String>,
        qr_base_url: &str,
        at: OffsetDateTime,
    ) -> Result<TextbookPassageMapping> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start link transaction")?;

        if find_document(&tx, TEXTBOOKS, textbook_id)?.is_none() {
            return Err(StoreError::not_found(TEXTBOOKS, textbook_id));
        }
        if find_document(&tx, PASSAGE_SETS, passage_set_id)?.is_none() {
            return Err(StoreError::not_found(PASSAGE_SETS, passage_set_id));
        }

        let order = match order {
            Some(order) => order,
            None => next_free_order(&tx, textbook_id)?,
        };
        let qr_code = qr_code.filter(|code| !is_blank_qr(code)).unwrap_or_else(generate_qr_code);
        let mapping = TextbookPassageMapping {
            id: DocumentId::new(),
            textbook_id: DocumentId(textbook_id.to_string()),
            passage_set_id: DocumentId(passage_set_id.to_string()),
            order,
            qr_code_url: Some(qr_code_url(qr_base_url, &qr_code)),
            qr_code,
            created_at: at,
            updated_at: at,
        };
        insert_typed(&tx, &mapping)?;
        tx.commit().write_ctx("failed to commit link transaction")?;

        tracing::info!(textbook_id, passage_set_id, order, "linked passage set");
        Ok(mapping)
    }

    /// Sever a textbook/passage-set link, tombstoning the mapping.
    ///
    /// # Errors
    /// Returns not-found when no mapping links the pair.
    pub fn unlink_passage_set(
        &mut self,
        textbook_id: &str,
        passage_set_id: &str,
    ) -> Result<Tombstone> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start unlink transaction")?;

        let Some((doc_id, body)) = find_mapping_row(&tx, textbook_id, passage_set_id)? else {
            return Err(StoreError::not_found(
                TEXTBOOK_PASSAGE_MAPPINGS,
                format!("{textbook_id}/{passage_set_id}"),
            ));
        };
        let (tombstone_id, deleted_at) =
            write_tombstone(&tx, TEXTBOOK_PASSAGE_MAPPINGS, &doc_id, &body, UNLINK_REASON)?;
        tx.execute(
            "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2",
            params![TEXTBOOK_PASSAGE_MAPPINGS, doc_id],
        )
        .write_ctx(format!("failed to delete mapping {doc_id}"))?;
        tx.commit().write_ctx("failed to commit unlink transaction")?;

        tracing::info!(textbook_id, passage_set_id, tombstone_id = %tombstone_id, "unlinked passage set");
        Ok(Tombstone {
            tombstone_id,
            collection: TEXTBOOK_PASSAGE_MAPPINGS.to_string(),
            doc_id,
            document: body,
            reason: UNLINK_REASON.to_string(),
            deleted_at,
            restored_at: None,
        })
    }

    /// Passage sets that still carry a `textbookId` field, any value included.
    ///
    /// # Errors
    /// Returns a query or decode error when rows cannot be read.
    pub fn find_legacy_passage_sets(&self) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT doc_id, body_json FROM documents
             WHERE collection = ?1 AND {LEGACY_PASSAGE_SET_PREDICATE}
             ORDER BY rowid ASC"
        );
        Ok(select_documents(
            self.conn(),
            &sql,
            params![PASSAGE_SETS],
            "failed to read legacy passage sets",
        )?
        .into_iter()
        .map(|(_, body)| body)
        .collect())
    }

    /// # Errors
    /// Returns a query error when the lookup fails.
    pub fn mapping_exists(&self, textbook_id: &str, passage_set_id: &str) -> Result<bool> {
        Ok(find_mapping_row(self.conn(), textbook_id, passage_set_id)?.is_some())
    }

    /// Remove `textbookId` and `setNumber` from one passage set once its association is
    /// preserved as a mapping. Every other field is left byte-for-byte as stored.
    ///
    /// # Errors
    /// Returns not-found for an unknown passage set and a write error when the mapping insert
    /// or the field removal fails. The passage set is untouched in either case.
    pub fn repair_legacy_passage_set(
        &mut self,
        passage_set_id: &str,
        policy: &MissingMappingPolicy,
        dry_run: bool,
    ) -> Result<LegacyRepairOutcome> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start legacy repair transaction")?;

        let Some(document) = find_document(&tx, PASSAGE_SETS, passage_set_id)? else {
            return Err(StoreError::not_found(PASSAGE_SETS, passage_set_id));
        };
        let Some(legacy_value) = document.get(LEGACY_TEXTBOOK_ID_FIELD) else {
            return Ok(LegacyRepairOutcome::AlreadyNormalized {
                passage_set_id: passage_set_id.to_string(),
            });
        };
        let legacy_textbook_id = json_id(legacy_value).filter(|id| !id.trim().is_empty());
        let legacy_set_number = document.get(LEGACY_SET_NUMBER_FIELD).cloned();

        let mut mapping_created = None;
        if let Some(textbook_id) = legacy_textbook_id.as_deref() {
            if find_mapping_row(&tx, textbook_id, passage_set_id)?.is_none() {
                let MissingMappingPolicy::Create { qr_base_url } = policy else {
                    tracing::warn!(passage_set_id, textbook_id, "skipped legacy passage set without mapping");
                    return Ok(LegacyRepairOutcome::SkippedMissingMapping {
                        passage_set_id: passage_set_id.to_string(),
                        legacy_textbook_id: textbook_id.to_string(),
                    });
                };
                if find_document(&tx, TEXTBOOKS, textbook_id)?.is_none() {
                    tracing::warn!(passage_set_id, textbook_id, "skipped legacy passage set with unknown textbook");
                    return Ok(LegacyRepairOutcome::SkippedUnknownTextbook {
                        passage_set_id: passage_set_id.to_string(),
                        legacy_textbook_id: textbook_id.to_string(),
                    });
                }

                let preferred = legacy_set_number
                    .as_ref()
                    .and_then(Value::as_u64)
                    .and_then(|number| u32::try_from(number).ok())
                    .filter(|number| *number > 0);
                let order = match preferred {
                    Some(order) if !order_taken(&tx, textbook_id, order)? => order,
                    _ => next_free_order(&tx, textbook_id)?,
                };
                let qr_code = generate_qr_code();
                let now = OffsetDateTime::now_utc();
                let mapping = TextbookPassageMapping {
                    id: DocumentId::new(),
                    textbook_id: DocumentId(textbook_id.to_string()),
                    passage_set_id: DocumentId(passage_set_id.to_string()),
                    order,
                    qr_code_url: Some(qr_code_url(qr_base_url, &qr_code)),
                    qr_code,
                    created_at: now,
                    updated_at: now,
                };
                insert_typed(&tx, &mapping)?;
                mapping_created = Some(mapping);
            }
        }

        let stripped = tx
            .execute(
                "UPDATE documents
                 SET body_json = json_remove(body_json, '$.textbookId', '$.setNumber'),
                     updated_at = ?1
                 WHERE collection = ?2 AND doc_id = ?3",
                params![now_rfc3339()?, PASSAGE_SETS, passage_set_id],
            )
            .write_ctx(format!("failed to strip legacy fields from {passage_set_id}"))?;
        if stripped != 1 {
            return Err(StoreError::Write {
                context: format!("expected to strip one passage set, touched {stripped}"),
                source: None,
            });
        }

        if dry_run {
            drop(tx);
        } else {
            tx.commit().write_ctx("failed to commit legacy repair transaction")?;
        }

        tracing::info!(
            passage_set_id,
            textbook_id = legacy_textbook_id.as_deref().unwrap_or(""),
            mapping_created = mapping_created.is_some(),
            dry_run,
            "normalized legacy passage set"
        );
        Ok(LegacyRepairOutcome::Normalized {
            passage_set_id: passage_set_id.to_string(),
            legacy_textbook_id,
            legacy_set_number,
            mapping_created,
        })
    }
}

fn write_tombstone(
    conn: &Connection,
    collection: &str,
    doc_id: &str,
    body: &Value,
    reason: &str,
) -> Result<(String, String)> {
    let tombstone_id = ulid::Ulid::new().to_string();
    let deleted_at = now_rfc3339()?;
    conn.execute(
        "INSERT INTO document_tombstones(tombstone_id, collection, doc_id, body_json, reason, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![tombstone_id, collection, doc_id, body.to_string(), reason, deleted_at],
    )
    .write_ctx(format!("failed to tombstone {collection} document {doc_id}"))?;
    Ok((tombstone_id, deleted_at))
}

fn find_mapping_row(
    conn: &Connection,
    textbook_id: &str,
    passage_set_id: &str,
) -> Result<Option<(String, Value)>> {
    let rows = select_documents(
        conn,
        "SELECT doc_id, body_json FROM documents
         WHERE collection = ?1
           AND CAST(json_extract(body_json, '$.textbookId') AS TEXT) = ?2
           AND CAST(json_extract(body_json, '$.passageSetId') AS TEXT) = ?3
         ORDER BY rowid ASC
         LIMIT 1",
        params![TEXTBOOK_PASSAGE_MAPPINGS, textbook_id, passage_set_id],
        "failed to look up mapping",
    )?;
    Ok(rows.into_iter().next())
}

fn order_taken(conn: &Connection, textbook_id: &str, order: u32) -> Result<bool> {
    let taken = conn
        .query_row(
            "SELECT EXISTS(
               SELECT 1 FROM documents
               WHERE collection = ?1
                 AND CAST(json_extract(body_json, '$.textbookId') AS TEXT) = ?2
                 AND json_extract(body_json, '$.order') = ?3
             )",
            params![TEXTBOOK_PASSAGE_MAPPINGS, textbook_id, order],
            |row| row.get::<_, i64>(0),
        )
        .query_ctx("failed to check mapping order")?;
    Ok(taken == 1)
}

fn next_free_order(conn: &Connection, textbook_id: &str) -> Result<u32> {
    let max = conn
        .query_row(
            "SELECT MAX(CAST(json_extract(body_json, '$.order') AS INTEGER)) FROM documents
             WHERE collection = ?1
               AND CAST(json_extract(body_json, '$.textbookId') AS TEXT) = ?2",
            params![TEXTBOOK_PASSAGE_MAPPINGS, textbook_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .query_ctx("failed to read max mapping order")?;
    let next = max.unwrap_or(0).max(0).saturating_add(1);
    u32::try_from(next).map_err(|_| StoreError::invalid(format!("mapping order overflow: {next}")))
}
