//! MCP `update_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `update_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateMemoryParams {
    /// Id of the memory to update.
    #[schemars(description = "Id of the memory to update")]
    pub id: String,

    /// Fields to change; omitted fields are left untouched.
    #[schemars(description = "Partial update; omitted fields are left untouched")]
    pub patch: UpdatePatch,
}

/// The patchable fields. The memory's type and id are immutable.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdatePatch {
    /// Replacement content; must match the record's existing type shape.
    #[schemars(description = "Replacement content, same shape as the record's type")]
    pub content: Option<serde_json::Value>,

    /// New importance in `[0.0, 1.0]`.
    #[schemars(description = "New importance 0.0-1.0")]
    pub importance: Option<f64>,

    /// Replacement tag set.
    #[schemars(description = "Replacement tag set")]
    pub tags: Option<Vec<String>>,

    /// Replacement provenance string.
    #[schemars(description = "Replacement provenance string")]
    pub source: Option<String>,
}
