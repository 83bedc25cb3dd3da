//! MCP `store_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `store_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StoreMemoryParams {
    /// Memory type: `"fact"`, `"entity"`, `"conversation"`, `"reflection"`, or `"code"`.
    #[schemars(
        description = "Memory type: 'fact' (statements), 'entity' (people/places/things), 'conversation' (chat excerpts), 'reflection' (summaries), 'code' (snippets)"
    )]
    pub r#type: String,

    /// Typed content whose shape is determined by `type`.
    #[schemars(
        description = "Content object shaped by type. fact: {statement, confidence?}; entity: {name, attributes}; conversation: {messages: [{role, text, ts?}]}; reflection: {body, refs?}; code: {language, code, description?}"
    )]
    pub content: serde_json::Value,

    /// Initial importance in `[0.0, 1.0]`. Defaults to `0.5`.
    #[schemars(description = "Initial importance 0.0-1.0. Defaults to 0.5.")]
    pub importance: Option<f64>,

    /// Unordered set of short tag strings.
    #[schemars(description = "Optional tags for filtering")]
    pub tags: Option<Vec<String>>,

    /// Free-form provenance string.
    #[schemars(description = "Optional provenance string (where this memory came from)")]
    pub source: Option<String>,
}
