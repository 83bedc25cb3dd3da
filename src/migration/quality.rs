//! Retrieval quality signal for the migration gates.
//!
//! Probe queries are harvested from live retrieval calls into a bounded ring.
//! During CANARY and GRADUAL the engine replays a sampled fraction of
//! retrievals against the secondary collection and scores the agreement
//! between the two result sets.

use std::collections::HashSet;
use std::sync::Mutex;

/// Probe queries compared in the top-k overlap.
const OVERLAP_K: usize = 10;

/// Bounded ring of real query texts usable as probes.
pub struct ProbeRing {
    queries: Mutex<Vec<String>>,
    capacity: usize,
}

impl ProbeRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn push(&self, query: &str) {
        if query.trim().is_empty() {
            return;
        }
        let mut queries = self.queries.lock().expect("probe ring lock poisoned");
        queries.push(query.to_string());
        let capacity = self.capacity;
        if queries.len() > capacity {
            let excess = queries.len() - capacity;
            queries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.queries.lock().expect("probe ring lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.queries
            .lock()
            .expect("probe ring lock poisoned")
            .clone()
    }
}

/// Score agreement between primary and secondary result lists for one probe.
///
/// Combines the overlap of the top-10 id sets with the mean similarity of the
/// secondary's hits against the query. Both halves lie in [0, 1], so the
/// combined score does too. An empty secondary result set scores 0; two empty
/// sets agree trivially and score 1.
pub fn quality_signal(
    primary_hits: &[(String, f64)],
    secondary_hits: &[(String, f64)],
) -> f64 {
    if primary_hits.is_empty() && secondary_hits.is_empty() {
        return 1.0;
    }
    if secondary_hits.is_empty() {
        return 0.0;
    }

    let primary_top: HashSet<&str> = primary_hits
        .iter()
        .take(OVERLAP_K)
        .map(|(id, _)| id.as_str())
        .collect();
    let secondary_top: HashSet<&str> = secondary_hits
        .iter()
        .take(OVERLAP_K)
        .map(|(id, _)| id.as_str())
        .collect();

    let intersection = primary_top.intersection(&secondary_top).count() as f64;
    let denominator = primary_top.len().max(secondary_top.len()).max(1) as f64;
    let overlap = intersection / denominator;

    let mean_similarity = secondary_hits
        .iter()
        .take(OVERLAP_K)
        .map(|(_, s)| s.clamp(0.0, 1.0))
        .sum::<f64>()
        / secondary_hits.len().min(OVERLAP_K) as f64;

    (0.5 * overlap + 0.5 * mean_similarity).clamp(0.0, 1.0)
}
