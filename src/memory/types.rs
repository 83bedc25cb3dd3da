//! Core memory type definitions.
//!
//! Defines [`MemoryType`] (the five record categories), [`Tier`] (storage
//! class with its transition graph), [`MemoryContent`] (the typed content
//! union), and [`Memory`] (a full record). Content validation, sanitization,
//! and the textual projection used for embedding and lexical indexing all
//! live here.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};

/// Maximum bytes allowed in any single textual field.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

/// The five memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// A standalone statement, optionally with a confidence score.
    Fact,
    /// A named thing with free-form attributes.
    Entity,
    /// An excerpt of participant-tagged utterances.
    Conversation,
    /// A higher-level summary referencing earlier memories.
    Reflection,
    /// A code snippet with its language.
    Code,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Entity => "entity",
            Self::Conversation => "conversation",
            Self::Reflection => "reflection",
            Self::Code => "code",
        }
    }

    /// Facts and entities go through the dedup gate before insert.
    pub fn deduplicates(&self) -> bool {
        matches!(self, Self::Fact | Self::Entity)
    }

    pub fn all() -> [MemoryType; 5] {
        [
            Self::Fact,
            Self::Entity,
            Self::Conversation,
            Self::Reflection,
            Self::Code,
        ]
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fact" => Ok(Self::Fact),
            "entity" => Ok(Self::Entity),
            "conversation" => Ok(Self::Conversation),
            "reflection" => Ok(Self::Reflection),
            "code" => Ok(Self::Code),
            _ => Err(EngramError::invalid_arguments(format!(
                "unknown memory type: {s}"
            ))),
        }
    }
}

/// Storage tier. Determines retention and retrieval priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ShortTerm,
    LongTerm,
    Archived,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Archived => "archived",
        }
    }

    /// The allowed transition graph: demotion one level down, promotion one
    /// level up. `archived -> short_term` in one step is never legal.
    pub fn can_transition_to(&self, target: Tier) -> bool {
        matches!(
            (self, target),
            (Self::ShortTerm, Self::LongTerm)
                | (Self::LongTerm, Self::Archived)
                | (Self::LongTerm, Self::ShortTerm)
                | (Self::Archived, Self::LongTerm)
        )
    }

    /// One level up, if any.
    pub fn promoted(&self) -> Option<Tier> {
        match self {
            Self::ShortTerm => None,
            Self::LongTerm => Some(Self::ShortTerm),
            Self::Archived => Some(Self::LongTerm),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            "archived" => Ok(Self::Archived),
            _ => Err(EngramError::invalid_arguments(format!("unknown tier: {s}"))),
        }
    }
}

/// A participant-tagged utterance inside a conversation excerpt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FactContent {
    pub statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EntityContent {
    pub name: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConversationContent {
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReflectionContent {
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CodeContent {
    pub language: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Typed memory content. The variant is determined by the record's
/// [`MemoryType`], never self-described, so the JSON stays exactly the shape
/// callers sent.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryContent {
    Fact(FactContent),
    Entity(EntityContent),
    Conversation(ConversationContent),
    Reflection(ReflectionContent),
    Code(CodeContent),
}

impl MemoryContent {
    /// Parse and validate a raw content value against the given type.
    ///
    /// Unknown fields and unknown enum values are rejected; every textual
    /// field is sanitized (see [`sanitize_text`]).
    pub fn parse(memory_type: MemoryType, value: serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            EngramError::invalid_content(format!("{memory_type} content: {e}"))
        };
        let mut content = match memory_type {
            MemoryType::Fact => Self::Fact(serde_json::from_value(value).map_err(invalid)?),
            MemoryType::Entity => Self::Entity(serde_json::from_value(value).map_err(invalid)?),
            MemoryType::Conversation => {
                Self::Conversation(serde_json::from_value(value).map_err(invalid)?)
            }
            MemoryType::Reflection => {
                Self::Reflection(serde_json::from_value(value).map_err(invalid)?)
            }
            MemoryType::Code => Self::Code(serde_json::from_value(value).map_err(invalid)?),
        };
        content.validate()?;
        content.sanitize()?;
        Ok(content)
    }

    pub fn memory_type(&self) -> MemoryType {
        match self {
            Self::Fact(_) => MemoryType::Fact,
            Self::Entity(_) => MemoryType::Entity,
            Self::Conversation(_) => MemoryType::Conversation,
            Self::Reflection(_) => MemoryType::Reflection,
            Self::Code(_) => MemoryType::Code,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Fact(f) => {
                if f.statement.trim().is_empty() {
                    return Err(EngramError::invalid_content("fact statement is empty"));
                }
                if let Some(c) = f.confidence {
                    if !(0.0..=1.0).contains(&c) {
                        return Err(EngramError::invalid_content(
                            "fact confidence must be in [0, 1]",
                        ));
                    }
                }
            }
            Self::Entity(e) => {
                if e.name.trim().is_empty() {
                    return Err(EngramError::invalid_content("entity name is empty"));
                }
            }
            Self::Conversation(c) => {
                if c.messages.is_empty() {
                    return Err(EngramError::invalid_content(
                        "conversation has no messages",
                    ));
                }
            }
            Self::Reflection(r) => {
                if r.body.trim().is_empty() {
                    return Err(EngramError::invalid_content("reflection body is empty"));
                }
            }
            Self::Code(c) => {
                if c.language.trim().is_empty() || c.code.trim().is_empty() {
                    return Err(EngramError::invalid_content(
                        "code requires language and code",
                    ));
                }
            }
        }
        Ok(())
    }

    fn sanitize(&mut self) -> Result<()> {
        match self {
            Self::Fact(f) => f.statement = sanitize_text(&f.statement)?,
            Self::Entity(e) => e.name = sanitize_text(&e.name)?,
            Self::Conversation(c) => {
                for m in &mut c.messages {
                    m.text = sanitize_text(&m.text)?;
                }
            }
            Self::Reflection(r) => r.body = sanitize_text(&r.body)?,
            Self::Code(c) => {
                c.code = sanitize_text(&c.code)?;
                if let Some(d) = &c.description {
                    c.description = Some(sanitize_text(d)?);
                }
            }
        }
        Ok(())
    }

    /// The canonical text used for embedding and the lexical index.
    pub fn projection(&self) -> String {
        match self {
            Self::Fact(f) => f.statement.clone(),
            Self::Entity(e) => {
                let mut parts = vec![e.name.clone()];
                parts.extend(e.attributes.values().filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                }));
                parts.join(" ")
            }
            Self::Conversation(c) => c
                .messages
                .iter()
                .map(|m| format!("{}: {}", m.role.as_str(), m.text))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Reflection(r) => r.body.clone(),
            Self::Code(c) => match &c.description {
                Some(desc) => format!("[{}] {}\n{}", c.language, desc, c.code),
                None => format!("[{}]\n{}", c.language, c.code),
            },
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let v = match self {
            Self::Fact(f) => serde_json::to_value(f)?,
            Self::Entity(e) => serde_json::to_value(e)?,
            Self::Conversation(c) => serde_json::to_value(c)?,
            Self::Reflection(r) => serde_json::to_value(r)?,
            Self::Code(c) => serde_json::to_value(c)?,
        };
        Ok(v)
    }
}

/// Sanitize one textual field: reject embedded NUL (it would corrupt the
/// framing of downstream consumers), strip other control characters except
/// tab and newline, and cap the length at [`MAX_TEXT_BYTES`].
pub fn sanitize_text(text: &str) -> Result<String> {
    if text.contains('\u{0}') {
        return Err(EngramError::invalid_content(
            "text contains embedded NUL framing character",
        ));
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\t' || *c == '\n')
        .collect();

    if cleaned.len() <= MAX_TEXT_BYTES {
        return Ok(cleaned);
    }
    // Cap at a char boundary
    let mut end = MAX_TEXT_BYTES;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    Ok(cleaned[..end].to_string())
}

/// A full memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: serde_json::Value,
    pub importance: f64,
    pub access_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_ref: Option<String>,
    pub embedding_model: String,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Memory {
    /// Column list matching [`Memory::from_row`]'s ordering.
    pub const COLUMNS: &'static str = "id, type, content, importance, access_count, \
         last_accessed_at, created_at, updated_at, tier, embedding_ref, embedding_model, \
         tags, source";

    /// Map a row selected with [`Memory::COLUMNS`].
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let type_str: String = row.get(1)?;
        let content_str: String = row.get(2)?;
        let tier_str: String = row.get(8)?;
        let tags_str: String = row.get(11)?;
        Ok(Self {
            id: row.get(0)?,
            memory_type: type_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(1, "type".into(), rusqlite::types::Type::Text)
            })?,
            content: serde_json::from_str(&content_str).unwrap_or(serde_json::Value::Null),
            importance: row.get(3)?,
            access_count: row.get(4)?,
            last_accessed_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            tier: tier_str.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(8, "tier".into(), rusqlite::types::Type::Text)
            })?,
            embedding_ref: row.get(9)?,
            embedding_model: row.get(10)?,
            tags: serde_json::from_str(&tags_str).unwrap_or_default(),
            source: row.get(12)?,
        })
    }

    /// Parsed, typed view of the stored content.
    pub fn typed_content(&self) -> Result<MemoryContent> {
        MemoryContent::parse(self.memory_type, self.content.clone())
    }
}

/// Clamp importance into its legal range.
pub fn clamp_importance(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_transition_graph() {
        use Tier::*;
        assert!(ShortTerm.can_transition_to(LongTerm));
        assert!(LongTerm.can_transition_to(Archived));
        assert!(LongTerm.can_transition_to(ShortTerm));
        assert!(Archived.can_transition_to(LongTerm));

        assert!(!ShortTerm.can_transition_to(Archived));
        assert!(!Archived.can_transition_to(ShortTerm));
        assert!(!ShortTerm.can_transition_to(ShortTerm));
    }

    #[test]
    fn parse_fact_content() {
        let content = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "Paris is the capital of France", "confidence": 0.9}),
        )
        .unwrap();
        assert_eq!(content.projection(), "Paris is the capital of France");
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "x", "certainty": 0.9}),
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidContent);
    }

    #[test]
    fn unknown_role_rejected() {
        let err = MemoryContent::parse(
            MemoryType::Conversation,
            serde_json::json!({"messages": [{"role": "moderator", "text": "hi"}]}),
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidContent);
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let err = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "x", "confidence": 1.5}),
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidContent);
    }

    #[test]
    fn empty_statement_rejected() {
        let err =
            MemoryContent::parse(MemoryType::Fact, serde_json::json!({"statement": "  "}))
                .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidContent);
    }

    #[test]
    fn conversation_projection_tags_participants() {
        let content = MemoryContent::parse(
            MemoryType::Conversation,
            serde_json::json!({"messages": [
                {"role": "user", "text": "What is Rust?"},
                {"role": "assistant", "text": "A systems language."}
            ]}),
        )
        .unwrap();
        assert_eq!(
            content.projection(),
            "user: What is Rust?\nassistant: A systems language."
        );
    }

    #[test]
    fn entity_projection_joins_attributes() {
        let content = MemoryContent::parse(
            MemoryType::Entity,
            serde_json::json!({"name": "Ada", "attributes": {"role": "engineer", "age": 36}}),
        )
        .unwrap();
        let projection = content.projection();
        assert!(projection.starts_with("Ada"));
        assert!(projection.contains("engineer"));
        assert!(projection.contains("36"));
    }

    #[test]
    fn code_projection_has_language_prefix() {
        let content = MemoryContent::parse(
            MemoryType::Code,
            serde_json::json!({"language": "rust", "code": "fn main() {}"}),
        )
        .unwrap();
        assert!(content.projection().starts_with("[rust]"));
    }

    #[test]
    fn sanitize_strips_control_keeps_tab_newline() {
        let cleaned = sanitize_text("a\u{1}b\tc\nd\u{7f}e").unwrap();
        assert_eq!(cleaned, "ab\tc\nde");
    }

    #[test]
    fn sanitize_rejects_nul() {
        let err = sanitize_text("a\u{0}b").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidContent);
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(MAX_TEXT_BYTES + 100);
        let cleaned = sanitize_text(&long).unwrap();
        assert_eq!(cleaned.len(), MAX_TEXT_BYTES);
    }

    #[test]
    fn clamp_importance_bounds() {
        assert_eq!(clamp_importance(1.5), 1.0);
        assert_eq!(clamp_importance(-0.1), 0.0);
        assert_eq!(clamp_importance(0.42), 0.42);
    }
}
