use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub const TEXTBOOKS: &str = "textbooks";
pub const PASSAGE_SETS: &str = "passagesets";
pub const TEXTBOOK_PASSAGE_MAPPINGS: &str = "textbook_passage_mappings";
pub const QUESTIONS: &str = "questions";
pub const SYSTEM_PROMPTS: &str = "systemprompts";
pub const SYSTEM_PROMPT_VERSIONS: &str = "systemPromptVersions";

/// Field names of the pre-normalization passage set shape.
pub const LEGACY_TEXTBOOK_ID_FIELD: &str = "textbookId";
pub const LEGACY_SET_NUMBER_FIELD: &str = "setNumber";
pub const QR_CODE_FIELD: &str = "qrCode";

const MAX_COLLECTION_NAME_LEN: usize = 120;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("invalid explanation transition: {from} -> {to}")]
    InvalidTransition { from: ExplanationStatus, to: ExplanationStatus },
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        json_id(&value)
            .map(Self)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid document id: {value}")))
    }
}

impl DocumentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parse a caller-supplied identifier.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, KernelError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KernelError::Validation("document id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read an identifier out of a raw document value.
///
/// Accepts plain strings, numbers, and extended-JSON `{"$oid": "..."}` objects
/// as produced by `mongoexport`.
#[must_use]
pub fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(object) => match object.get("$oid") {
            Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Rewrite extended-JSON wrappers on top-level fields into plain values:
/// `{"$oid": s}` on `_id` and `*Id` fields, and `{"$date": s}` anywhere at the
/// top level. Everything else is left verbatim.
pub fn canonicalize_document(document: &mut Value) {
    let Value::Object(object) = document else {
        return;
    };
    for (key, value) in object.iter_mut() {
        let Value::Object(inner) = value else {
            continue;
        };
        if inner.len() != 1 {
            continue;
        }
        let replacement = if key == "_id" || key.ends_with("Id") {
            inner.get("$oid").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
        .or_else(|| inner.get("$date").and_then(Value::as_str).map(str::to_string));
        if let Some(replacement) = replacement {
            *value = Value::String(replacement);
        }
    }
}

/// Characters treated as blank in a QR identifier. Kept in sync with the
/// store-side purge predicate.
pub const QR_BLANK_CHARS: [char; 4] = [' ', '\t', '\n', '\r'];

#[must_use]
pub fn is_blank_qr(raw: &str) -> bool {
    raw.trim_matches(&QR_BLANK_CHARS[..]).is_empty()
}

/// True when the document carries a usable `qrCode`: present, not null, and
/// not blank when it is a string.
#[must_use]
pub fn has_qr_code(document: &Value) -> bool {
    match document.get(QR_CODE_FIELD) {
        None | Some(Value::Null) => false,
        Some(Value::String(raw)) => !is_blank_qr(raw),
        Some(_) => true,
    }
}

/// True when a passage set still carries the embedded textbook reference.
#[must_use]
pub fn is_legacy_passage_set(document: &Value) -> bool {
    document.get(LEGACY_TEXTBOOK_ID_FIELD).is_some()
}

/// Collection names are operator input and are restricted to the character set
/// the frontend store uses.
///
/// # Errors
/// Returns [`KernelError::Validation`] for empty, oversized, or non-ASCII names.
pub fn validate_collection_name(name: &str) -> Result<(), KernelError> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(KernelError::Validation(format!(
            "collection name MUST be 1..={MAX_COLLECTION_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')) {
        return Err(KernelError::Validation(format!(
            "collection name contains unsupported characters: {name}"
        )));
    }
    if name.starts_with("system.") {
        return Err(KernelError::Validation(format!("collection name is reserved: {name}")));
    }
    Ok(())
}

/// Generate an opaque QR identifier.
#[must_use]
pub fn generate_qr_code() -> String {
    format!("QR-{}", Ulid::new())
}

#[must_use]
pub fn qr_code_url(base_url: &str, qr_code: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), qr_code)
}

/// A schema-bound entity persisted as one JSON document.
pub trait Document: Serialize + DeserializeOwned {
    const COLLECTION: &'static str;

    fn document_id(&self) -> &DocumentId;

    /// Check the entity's field-level invariants.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] describing the first violated invariant.
    fn validate(&self) -> Result<(), KernelError>;
}

fn require_non_blank(field: &str, value: &str) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Textbook {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub title: String,
    pub subject: String,
    pub level: String,
    pub year: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Document for Textbook {
    const COLLECTION: &'static str = TEXTBOOKS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("title", &self.title)?;
        require_non_blank("subject", &self.subject)?;
        require_non_blank("level", &self.level)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassageSet {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub title: String,
    pub passage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passage_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Document for PassageSet {
    const COLLECTION: &'static str = PASSAGE_SETS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("title", &self.title)?;
        require_non_blank("passage", &self.passage)?;
        if let Some(qr_code) = &self.qr_code {
            if is_blank_qr(qr_code) {
                return Err(KernelError::Validation(
                    "qrCode MUST be omitted rather than blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextbookPassageMapping {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub textbook_id: DocumentId,
    pub passage_set_id: DocumentId,
    pub order: u32,
    pub qr_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Document for TextbookPassageMapping {
    const COLLECTION: &'static str = TEXTBOOK_PASSAGE_MAPPINGS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("textbookId", self.textbook_id.as_str())?;
        require_non_blank("passageSetId", self.passage_set_id.as_str())?;
        if is_blank_qr(&self.qr_code) {
            return Err(KernelError::Validation(
                "qrCode MUST be provided for every exposed mapping".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Failed,
}

impl ExplanationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "generating" => Some(Self::Generating),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `failed -> generating` is the retry edge; `completed` is terminal.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::Generating)
                | (Self::Generating, Self::Completed | Self::Failed)
        )
    }
}

impl Display for ExplanationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExplanationTransition {
    Start,
    Complete { explanation: String },
    Fail { error: String },
}

impl ExplanationTransition {
    #[must_use]
    pub fn target(&self) -> ExplanationStatus {
        match self {
            Self::Start => ExplanationStatus::Generating,
            Self::Complete { .. } => ExplanationStatus::Completed,
            Self::Fail { .. } => ExplanationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub set_id: DocumentId,
    pub number: u32,
    pub question_text: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub explanation_status: ExplanationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation_error: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub explanation_generated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Question {
    /// Apply one explanation lifecycle step.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidTransition`] for edges outside the lifecycle and
    /// [`KernelError::Validation`] when a completion or failure carries no text.
    pub fn apply_explanation(
        &mut self,
        transition: ExplanationTransition,
        at: OffsetDateTime,
    ) -> Result<(), KernelError> {
        let next = transition.target();
        if !self.explanation_status.can_transition_to(next) {
            return Err(KernelError::InvalidTransition { from: self.explanation_status, to: next });
        }

        match transition {
            ExplanationTransition::Start => {
                self.explanation_error = None;
            }
            ExplanationTransition::Complete { explanation } => {
                require_non_blank("explanation", &explanation)?;
                self.explanation = Some(explanation);
                self.explanation_error = None;
                self.explanation_generated_at = Some(at);
            }
            ExplanationTransition::Fail { error } => {
                require_non_blank("explanationError", &error)?;
                self.explanation_error = Some(error);
                self.explanation_generated_at = Some(at);
            }
        }

        self.explanation_status = next;
        self.updated_at = at;
        Ok(())
    }
}

impl Document for Question {
    const COLLECTION: &'static str = QUESTIONS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("setId", self.set_id.as_str())?;
        require_non_blank("questionText", &self.question_text)?;
        require_non_blank("correctAnswer", &self.correct_answer)?;
        if self.number == 0 {
            return Err(KernelError::Validation("number MUST be >= 1".to_string()));
        }
        if self.explanation_status == ExplanationStatus::Completed
            && !self.explanation.as_deref().is_some_and(|text| !text.trim().is_empty())
        {
            return Err(KernelError::Validation(
                "completed explanations MUST carry explanation text".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemPrompt {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub content: String,
    pub version: u32,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Document for SystemPrompt {
    const COLLECTION: &'static str = SYSTEM_PROMPTS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("key", &self.key)?;
        require_non_blank("name", &self.name)?;
        if self.version == 0 {
            return Err(KernelError::Validation("version MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Immutable snapshot of a prompt's content. Rows are appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptVersion {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub prompt_key: String,
    pub version: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Document for SystemPromptVersion {
    const COLLECTION: &'static str = SYSTEM_PROMPT_VERSIONS;

    fn document_id(&self) -> &DocumentId {
        &self.id
    }

    fn validate(&self) -> Result<(), KernelError> {
        require_non_blank("_id", self.id.as_str())?;
        require_non_blank("promptKey", &self.prompt_key)?;
        if self.version == 0 {
            return Err(KernelError::Validation(
                "version MUST be >= 1 for append-only prompt history".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptVersionOrder {
    #[default]
    Version,
    CreatedAt,
}

impl PromptVersionOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::CreatedAt => "created_at",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "version" => Some(Self::Version),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

/// Sort newest first. The two orders are independent and may disagree when
/// versions were written out of chronological sequence.
pub fn sort_prompt_versions(versions: &mut [SystemPromptVersion], order: PromptVersionOrder) {
    versions.sort_by(|a, b| match order {
        PromptVersionOrder::Version => b
            .version
            .cmp(&a.version)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id)),
        PromptVersionOrder::CreatedAt => b
            .created_at
            .cmp(&a.created_at)
            .then_with(|| b.version.cmp(&a.version))
            .then_with(|| a.id.cmp(&b.id)),
    });
}

#[must_use]
pub fn next_prompt_version(existing: &[SystemPromptVersion]) -> u32 {
    existing.iter().map(|version| version.version).max().map_or(1, |max| max.saturating_add(1))
}

/// Envelope shared by every response the frontend consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self { success: true, data, message: None }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<Value> {
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, data: Value::Null, message: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct TextbookRef {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub title: String,
}

/// A passage set as the frontend sees it from inside one textbook.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassageSetView {
    #[serde(flatten)]
    pub passage_set: PassageSet,
    pub order: u32,
    pub mapping_id: DocumentId,
    pub mapping_qr_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_qr_code_url: Option<String>,
    pub textbooks: Vec<TextbookRef>,
}

/// Join one textbook's mappings with their passage sets, ordered by `order`.
///
/// `mappings` may span every textbook; it also feeds the denormalized
/// `textbooks` list. Mappings whose passage set is missing are dropped.
#[must_use]
pub fn assemble_passage_set_views(
    textbook_id: &DocumentId,
    mappings: &[TextbookPassageMapping],
    passage_sets: &[PassageSet],
    textbooks: &[Textbook],
) -> Vec<PassageSetView> {
    let passage_sets_by_id =
        passage_sets.iter().map(|set| (&set.id, set)).collect::<BTreeMap<_, _>>();
    let textbooks_by_id =
        textbooks.iter().map(|textbook| (&textbook.id, textbook)).collect::<BTreeMap<_, _>>();

    let mut textbooks_by_passage_set: BTreeMap<&DocumentId, BTreeSet<TextbookRef>> =
        BTreeMap::new();
    for mapping in mappings {
        let Some(textbook) = textbooks_by_id.get(&mapping.textbook_id) else {
            continue;
        };
        textbooks_by_passage_set
            .entry(&mapping.passage_set_id)
            .or_default()
            .insert(TextbookRef { id: textbook.id.clone(), title: textbook.title.clone() });
    }

    let mut selected =
        mappings.iter().filter(|mapping| &mapping.textbook_id == textbook_id).collect::<Vec<_>>();
    selected.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

    selected
        .into_iter()
        .filter_map(|mapping| {
            let passage_set = passage_sets_by_id.get(&mapping.passage_set_id)?;
            let mut refs = textbooks_by_passage_set
                .get(&mapping.passage_set_id)
                .map(|set| set.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            refs.sort_by(|a, b| match a.title.cmp(&b.title) {
                Ordering::Equal => a.id.cmp(&b.id),
                other => other,
            });
            Some(PassageSetView {
                passage_set: (*passage_set).clone(),
                order: mapping.order,
                mapping_id: mapping.id.clone(),
                mapping_qr_code: mapping.qr_code.clone(),
                mapping_qr_code_url: mapping.qr_code_url.clone(),
                textbooks: refs,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Client-held conversation scoped to one scanned QR code. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub qr_code: String,
    pub messages: Vec<ChatMessage>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

impl ChatSession {
    /// Open an empty session.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the QR code is blank.
    pub fn new(qr_code: &str, at: OffsetDateTime) -> Result<Self, KernelError> {
        if is_blank_qr(qr_code) {
            return Err(KernelError::Validation("chat session requires a QR code".to_string()));
        }
        Ok(Self { qr_code: qr_code.to_string(), messages: Vec::new(), last_activity: at })
    }

    /// Append a message. `last_activity` never moves backwards.
    pub fn push(&mut self, role: ChatRole, content: impl Into<String>, at: OffsetDateTime) {
        self.messages.push(ChatMessage {
            id: Ulid::new().to_string(),
            role,
            content: content.into(),
            timestamp: at,
        });
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    #[must_use]
    pub fn is_idle(&self, now: OffsetDateTime, idle_after: Duration) -> bool {
        now - self.last_activity >= idle_after
    }
}
