use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use textbook_kernel_core::{
    next_prompt_version, sort_prompt_versions, DocumentId, ExplanationTransition,
    PromptVersionOrder, Question, SystemPrompt, SystemPromptVersion, QUESTIONS, SYSTEM_PROMPTS,
    SYSTEM_PROMPT_VERSIONS,
};
use time::OffsetDateTime;

use crate::{
    decode_typed, find_document, insert_typed, replace_typed, select_documents, Result,
    SqlContext, SqliteStore, StoreError,
};

/// Operator input for creating or editing a prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptDraft {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub change_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptRevision {
    pub prompt: SystemPrompt,
    /// The history row appended by this save; `None` when the content did not change.
    pub version: Option<SystemPromptVersion>,
    pub changed: bool,
}

impl SqliteStore {
    /// # Errors
    /// Returns a query or decode error when the lookup fails.
    pub fn get_prompt_by_key(&self, key: &str) -> Result<Option<SystemPrompt>> {
        prompt_by_key(self.conn(), key)
    }

    /// History of one prompt, newest first by `order`, truncated to `limit`.
    ///
    /// # Errors
    /// Returns a query or decode error when rows cannot be read.
    pub fn list_prompt_versions(
        &self,
        prompt_key: &str,
        order: PromptVersionOrder,
        limit: Option<usize>,
    ) -> Result<Vec<SystemPromptVersion>> {
        let mut versions = versions_for_key(self.conn(), prompt_key)?;
        sort_prompt_versions(&mut versions, order);
        if let Some(limit) = limit {
            versions.truncate(limit);
        }
        Ok(versions)
    }

    /// Create or update a prompt and append the matching history row atomically.
    ///
    /// # Errors
    /// Returns a validation error for blank fields and a write error when a unique index
    /// rejects the prompt or the version row.
    pub fn save_prompt(&mut self, draft: &PromptDraft, at: OffsetDateTime) -> Result<PromptRevision> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start prompt save transaction")?;
        let revision = save_prompt_in(&tx, draft, at)?;
        tx.commit().write_ctx("failed to commit prompt save transaction")?;

        tracing::info!(
            key = %revision.prompt.key,
            version = revision.prompt.version,
            changed = revision.changed,
            "saved system prompt"
        );
        Ok(revision)
    }

    /// Re-publish the content of an earlier version as a new version. History is appended,
    /// never rewritten.
    ///
    /// # Errors
    /// Returns not-found when the prompt or the version is unknown.
    pub fn restore_prompt_version(
        &mut self,
        prompt_key: &str,
        version: u32,
        at: OffsetDateTime,
    ) -> Result<PromptRevision> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start prompt restore transaction")?;

        let Some(prompt) = prompt_by_key(&tx, prompt_key)? else {
            return Err(StoreError::not_found(SYSTEM_PROMPTS, prompt_key));
        };
        let Some(source) = versions_for_key(&tx, prompt_key)?
            .into_iter()
            .find(|candidate| candidate.version == version)
        else {
            return Err(StoreError::not_found(
                SYSTEM_PROMPT_VERSIONS,
                format!("{prompt_key}@{version}"),
            ));
        };

        let draft = PromptDraft {
            key: prompt.key,
            name: prompt.name,
            description: prompt.description,
            content: source.content,
            change_note: Some(format!("restored from version {version}")),
        };
        let revision = save_prompt_in(&tx, &draft, at)?;
        tx.commit().write_ctx("failed to commit prompt restore transaction")?;

        tracing::info!(key = prompt_key, from_version = version, to_version = revision.prompt.version, "restored prompt version");
        Ok(revision)
    }

    /// # Errors
    /// Returns not-found when no prompt has `key`.
    pub fn set_prompt_active(
        &mut self,
        key: &str,
        is_active: bool,
        at: OffsetDateTime,
    ) -> Result<SystemPrompt> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start prompt activation transaction")?;
        let Some(mut prompt) = prompt_by_key(&tx, key)? else {
            return Err(StoreError::not_found(SYSTEM_PROMPTS, key));
        };
        if prompt.is_active != is_active {
            prompt.is_active = is_active;
            prompt.updated_at = at;
            replace_typed(&tx, &prompt)?;
        }
        tx.commit().write_ctx("failed to commit prompt activation transaction")?;
        tracing::info!(key, is_active, "updated prompt activation");
        Ok(prompt)
    }

    /// Apply one explanation lifecycle step to a question and persist it.
    ///
    /// # Errors
    /// Returns not-found for unknown questions and a validation error for transitions the
    /// lifecycle does not allow.
    pub fn transition_explanation(
        &mut self,
        question_id: &DocumentId,
        transition: ExplanationTransition,
        at: OffsetDateTime,
    ) -> Result<Question> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .write_ctx("failed to start explanation transaction")?;
        let Some(raw) = find_document(&tx, QUESTIONS, question_id.as_str())? else {
            return Err(StoreError::not_found(QUESTIONS, question_id.as_str()));
        };
        let mut question: Question = decode_typed(QUESTIONS, raw)?;
        let from = question.explanation_status;
        question.apply_explanation(transition, at)?;
        replace_typed(&tx, &question)?;
        tx.commit().write_ctx("failed to commit explanation transaction")?;

        tracing::info!(
            question_id = %question_id,
            from = %from,
            to = %question.explanation_status,
            "explanation status changed"
        );
        Ok(question)
    }
}

fn save_prompt_in(conn: &Connection, draft: &PromptDraft, at: OffsetDateTime) -> Result<PromptRevision> {
    if draft.content.trim().is_empty() {
        return Err(StoreError::invalid("prompt content MUST be non-empty"));
    }

    let history = versions_for_key(conn, &draft.key)?;
    let Some(mut prompt) = prompt_by_key(conn, &draft.key)? else {
        let version = next_prompt_version(&history);
        let prompt = SystemPrompt {
            id: DocumentId::new(),
            key: draft.key.clone(),
            name: draft.name.clone(),
            description: draft.description.clone(),
            content: draft.content.clone(),
            version,
            is_active: true,
            created_at: at,
            updated_at: at,
        };
        insert_typed(conn, &prompt)?;
        let version = append_version(conn, &prompt, draft.change_note.clone(), at)?;
        return Ok(PromptRevision { prompt, version: Some(version), changed: true });
    };

    let metadata_changed = prompt.name != draft.name || prompt.description != draft.description;
    prompt.name.clone_from(&draft.name);
    prompt.description.clone_from(&draft.description);

    if prompt.content == draft.content {
        if metadata_changed {
            prompt.updated_at = at;
            replace_typed(conn, &prompt)?;
        }
        return Ok(PromptRevision { prompt, version: None, changed: false });
    }

    prompt.version = next_prompt_version(&history).max(prompt.version.saturating_add(1));
    prompt.content.clone_from(&draft.content);
    prompt.updated_at = at;
    replace_typed(conn, &prompt)?;
    let version = append_version(conn, &prompt, draft.change_note.clone(), at)?;
    Ok(PromptRevision { prompt, version: Some(version), changed: true })
}

fn append_version(
    conn: &Connection,
    prompt: &SystemPrompt,
    change_note: Option<String>,
    at: OffsetDateTime,
) -> Result<SystemPromptVersion> {
    let version = SystemPromptVersion {
        id: DocumentId::new(),
        prompt_key: prompt.key.clone(),
        version: prompt.version,
        content: prompt.content.clone(),
        change_note,
        created_at: at,
    };
    insert_typed(conn, &version)?;
    Ok(version)
}

fn prompt_by_key(conn: &Connection, key: &str) -> Result<Option<SystemPrompt>> {
    let rows = select_documents(
        conn,
        "SELECT doc_id, body_json FROM documents
         WHERE collection = ?1 AND json_extract(body_json, '$.key') = ?2
         LIMIT 1",
        params![SYSTEM_PROMPTS, key],
        "failed to look up system prompt",
    )?;
    rows.into_iter().next().map(|(_, body)| decode_typed(SYSTEM_PROMPTS, body)).transpose()
}

fn versions_for_key(conn: &Connection, prompt_key: &str) -> Result<Vec<SystemPromptVersion>> {
    select_documents(
        conn,
        "SELECT doc_id, body_json FROM documents
         WHERE collection = ?1 AND json_extract(body_json, '$.promptKey') = ?2
         ORDER BY rowid ASC",
        params![SYSTEM_PROMPT_VERSIONS, prompt_key],
        "failed to read system prompt versions",
    )?
    .into_iter()
    .map(|(_, body)| decode_typed(SYSTEM_PROMPT_VERSIONS, body))
    .collect()
}
