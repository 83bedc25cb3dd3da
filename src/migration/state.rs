//! Persisted migration record.
//!
//! A singleton JSON sidecar next to the database file tracks the migration
//! state machine. It is rewritten atomically (write-temp + rename) on every
//! state transition so a crash can never leave a torn record; on startup the
//! engine reloads it and resumes or rolls back.

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};

/// Phases of the dual-collection migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Inactive,
    Preparation,
    Shadow,
    Canary,
    Gradual,
    Full,
    Cleanup,
    RollingBack,
    Paused,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Preparation => "preparation",
            Self::Shadow => "shadow",
            Self::Canary => "canary",
            Self::Gradual => "gradual",
            Self::Full => "full",
            Self::Cleanup => "cleanup",
            Self::RollingBack => "rolling_back",
            Self::Paused => "paused",
        }
    }

    /// The forward edge out of this phase, if any.
    pub fn next(&self) -> Option<MigrationPhase> {
        match self {
            Self::Inactive => None,
            Self::Preparation => Some(Self::Shadow),
            Self::Shadow => Some(Self::Canary),
            Self::Canary => Some(Self::Gradual),
            Self::Gradual => Some(Self::Full),
            Self::Full => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Inactive),
            Self::RollingBack => Some(Self::Inactive),
            Self::Paused => None,
        }
    }

    /// Phases with a live migration in flight. Rollback and pause are legal
    /// from exactly these.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparation | Self::Shadow | Self::Canary | Self::Gradual | Self::Full | Self::Cleanup
        )
    }

    /// Dual-writes run from SHADOW until CLEANUP disables them.
    pub fn dual_writes(&self) -> bool {
        matches!(self, Self::Shadow | Self::Canary | Self::Gradual | Self::Full)
    }

    /// Canary sampling of retrievals runs during CANARY and GRADUAL.
    pub fn samples_canary(&self) -> bool {
        matches!(self, Self::Canary | Self::Gradual)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub migrated: usize,
    pub total: usize,
    /// Ids whose batch exhausted its retry budget; retried once more at the
    /// end of GRADUAL before quality evaluation.
    #[serde(default)]
    pub deferred: Vec<String>,
}

/// Bounded window of recent probe scores feeding the rollback gate.
pub const QUALITY_WINDOW: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationQuality {
    pub primary_score: f64,
    pub secondary_score: f64,
    pub samples: usize,
    #[serde(default)]
    pub recent: VecDeque<f64>,
}

impl MigrationQuality {
    pub fn record(&mut self, score: f64) {
        self.samples += 1;
        self.recent.push_back(score);
        while self.recent.len() > QUALITY_WINDOW {
            self.recent.pop_front();
        }
        let n = self.recent.len() as f64;
        self.secondary_score = self.recent.iter().sum::<f64>() / n;
    }

    /// Mean over the trailing `window` probes; 1.0 when no probes exist yet.
    pub fn rolling_mean(&self, window: usize) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let tail: Vec<f64> = self.recent.iter().rev().take(window).copied().collect();
        tail.iter().sum::<f64>() / tail.len() as f64
    }
}

/// The singleton migration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub state: MigrationPhase,
    pub primary_model: String,
    pub primary_collection: String,
    pub secondary_model: Option<String>,
    pub secondary_collection: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    pub progress: MigrationProgress,
    pub quality: MigrationQuality,
    pub last_checkpoint: Option<String>,
    pub last_failure_reason: Option<String>,
    /// Phase to return to on resume, when paused.
    pub paused_from: Option<MigrationPhase>,
    pub completed_at: Option<String>,
}

impl MigrationRecord {
    pub fn new(primary_model: &str, primary_collection: &str) -> Self {
        Self {
            state: MigrationPhase::Inactive,
            primary_model: primary_model.to_string(),
            primary_collection: primary_collection.to_string(),
            secondary_model: None,
            secondary_collection: None,
            started_at: None,
            updated_at: None,
            progress: MigrationProgress::default(),
            quality: MigrationQuality::default(),
            last_checkpoint: None,
            last_failure_reason: None,
            paused_from: None,
            completed_at: None,
        }
    }

    /// Load the sidecar if present.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngramError::internal(format!("read migration sidecar: {e}")))?;
        let record = serde_json::from_str(&contents)
            .map_err(|e| EngramError::internal(format!("parse migration sidecar: {e}")))?;
        Ok(Some(record))
    }

    /// Persist atomically: write to a temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| EngramError::internal(format!("create sidecar dir: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, contents)
            .map_err(|e| EngramError::internal(format!("write migration sidecar: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| EngramError::internal(format!("rename migration sidecar: {e}")))?;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_graph_forward_edges() {
        use MigrationPhase::*;
        assert_eq!(Preparation.next(), Some(Shadow));
        assert_eq!(Shadow.next(), Some(Canary));
        assert_eq!(Canary.next(), Some(Gradual));
        assert_eq!(Gradual.next(), Some(Full));
        assert_eq!(Full.next(), Some(Cleanup));
        assert_eq!(Cleanup.next(), Some(Inactive));
        assert_eq!(Inactive.next(), None);
    }

    #[test]
    fn dual_write_phases() {
        use MigrationPhase::*;
        assert!(!Preparation.dual_writes());
        assert!(Shadow.dual_writes());
        assert!(Canary.dual_writes());
        assert!(Gradual.dual_writes());
        assert!(Full.dual_writes());
        assert!(!Cleanup.dual_writes());
        assert!(!Inactive.dual_writes());
    }

    #[test]
    fn sidecar_round_trip_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.migration.json");

        let mut record = MigrationRecord::new("all-MiniLM-L6-v2", "primary");
        record.state = MigrationPhase::Shadow;
        record.secondary_model = Some("nomic-v2".into());
        record.touch();
        record.save(&path).unwrap();

        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = MigrationRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded.state, MigrationPhase::Shadow);
        assert_eq!(loaded.secondary_model.as_deref(), Some("nomic-v2"));
    }

    #[test]
    fn load_missing_sidecar_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(MigrationRecord::load(&path).unwrap().is_none());
    }

    #[test]
    fn quality_window_is_bounded() {
        let mut q = MigrationQuality::default();
        for i in 0..(QUALITY_WINDOW + 50) {
            q.record(i as f64 / 1000.0);
        }
        assert_eq!(q.recent.len(), QUALITY_WINDOW);
        assert_eq!(q.samples, QUALITY_WINDOW + 50);
    }

    #[test]
    fn rolling_mean_uses_trailing_window() {
        let mut q = MigrationQuality::default();
        for _ in 0..50 {
            q.record(1.0);
        }
        for _ in 0..50 {
            q.record(0.5);
        }
        assert!((q.rolling_mean(50) - 0.5).abs() < 1e-9);
        assert!((q.rolling_mean(100) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn rolling_mean_with_no_probes_is_permissive() {
        let q = MigrationQuality::default();
        assert_eq!(q.rolling_mean(50), 1.0);
    }
}
