//! MCP `retrieve_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `retrieve_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetrieveMemoryParams {
    /// Natural language query for hybrid retrieval.
    #[schemars(description = "Natural language query to search memories")]
    pub query: String,

    /// Maximum number of results (1-100). Defaults to 5.
    #[schemars(description = "Maximum number of results to return (1-100). Defaults to 5.")]
    pub limit: Option<usize>,

    /// Restrict to these memory types.
    #[schemars(
        description = "Filter by memory types: 'fact', 'entity', 'conversation', 'reflection', 'code'"
    )]
    pub types: Option<Vec<String>>,

    /// Minimum fused similarity (0.0-1.0). Defaults to 0.3.
    #[schemars(description = "Minimum similarity threshold (0.0-1.0). Defaults to 0.3.")]
    pub min_similarity: Option<f64>,
}
