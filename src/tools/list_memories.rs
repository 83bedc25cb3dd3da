//! MCP `list_memories` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `list_memories` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListMemoriesParams {
    /// Restrict to these memory types.
    #[schemars(
        description = "Filter by memory types: 'fact', 'entity', 'conversation', 'reflection', 'code'"
    )]
    pub types: Option<Vec<String>>,

    /// Restrict to one tier: `"short_term"`, `"long_term"`, or `"archived"`.
    #[schemars(description = "Filter by tier: 'short_term', 'long_term', 'archived'")]
    pub tier: Option<String>,

    /// Page size (1-200). Defaults to 20.
    #[schemars(description = "Page size (1-200). Defaults to 20.")]
    pub limit: Option<usize>,

    /// Page offset. Defaults to 0.
    #[schemars(description = "Page offset. Defaults to 0.")]
    pub offset: Option<usize>,
}
