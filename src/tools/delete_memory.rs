//! MCP `delete_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `delete_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteMemoryParams {
    /// Id of the memory to delete.
    #[schemars(description = "Id of the memory to delete")]
    pub id: String,
}
