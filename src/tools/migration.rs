//! MCP migration tool parameter definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `migration_start` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MigrationStartParams {
    /// Identifier of the embedding model to migrate to.
    #[schemars(description = "Identifier of the embedding model to migrate to")]
    pub target_model: String,
}

/// Empty parameters shared by the argumentless migration tools
/// (`migration_status`, `migration_advance`, `migration_pause`,
/// `migration_resume`, `migration_rollback`).
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MigrationControlParams {}
