//! Episodic domain — in-process conversation buffer and reflection triggers.
//!
//! The buffer holds the most recent conversation excerpts so callers get
//! immediate session context without touching the index. Once enough
//! unreflected excerpts accumulate, the engine asks a [`ReflectionGenerator`]
//! to distill them into a `reflection` memory. Generation failure is
//! non-fatal: excerpts stay queued until the next attempt succeeds.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// One buffered conversation excerpt.
#[derive(Debug, Clone)]
pub struct Excerpt {
    pub memory_id: String,
    /// Textual projection of the conversation content.
    pub text: String,
    pub stored_at: DateTime<Utc>,
}

/// Plug-in that turns a batch of excerpts into a reflection body.
pub trait ReflectionGenerator: Send + Sync {
    fn reflect(&self, excerpts: &[Excerpt]) -> anyhow::Result<String>;
}

/// Built-in extractive generator: leads with the excerpt count and keeps the
/// opening line of each excerpt, bounded to a fixed budget.
pub struct ExtractiveSummarizer;

const SUMMARY_LINE_BUDGET: usize = 160;

impl ReflectionGenerator for ExtractiveSummarizer {
    fn reflect(&self, excerpts: &[Excerpt]) -> anyhow::Result<String> {
        anyhow::ensure!(!excerpts.is_empty(), "nothing to reflect on");
        let mut lines = Vec::with_capacity(excerpts.len() + 1);
        lines.push(format!(
            "Reflection over {} conversation excerpts:",
            excerpts.len()
        ));
        for excerpt in excerpts {
            let first_line = excerpt.text.lines().next().unwrap_or("");
            let mut line = first_line.to_string();
            if line.len() > SUMMARY_LINE_BUDGET {
                let mut end = SUMMARY_LINE_BUDGET;
                while !line.is_char_boundary(end) {
                    end -= 1;
                }
                line.truncate(end);
                line.push_str("...");
            }
            lines.push(format!("- {line}"));
        }
        Ok(lines.join("\n"))
    }
}

struct BufferInner {
    entries: VecDeque<Excerpt>,
    unreflected: Vec<Excerpt>,
}

/// Ring buffer of recent conversation excerpts plus the unreflected backlog.
pub struct EpisodicBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
    reflection_threshold: usize,
}

impl EpisodicBuffer {
    pub fn new(capacity: usize, reflection_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                entries: VecDeque::with_capacity(capacity),
                unreflected: Vec::new(),
            }),
            capacity,
            reflection_threshold,
        }
    }

    /// Append a stored conversation excerpt. Returns `true` when enough
    /// unreflected excerpts have accumulated to warrant a reflection pass.
    pub fn record(&self, memory_id: &str, text: &str) -> bool {
        let excerpt = Excerpt {
            memory_id: memory_id.to_string(),
            text: text.to_string(),
            stored_at: Utc::now(),
        };
        let mut inner = self.inner.lock().expect("episodic buffer lock poisoned");
        inner.entries.push_back(excerpt.clone());
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
        inner.unreflected.push(excerpt);
        inner.unreflected.len() >= self.reflection_threshold
    }

    /// The `n` most recent excerpts, newest last.
    pub fn recent(&self, n: usize) -> Vec<Excerpt> {
        let inner = self.inner.lock().expect("episodic buffer lock poisoned");
        inner
            .entries
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Snapshot of the unreflected backlog. Entries are NOT cleared; call
    /// [`mark_reflected`](Self::mark_reflected) after the reflection memory
    /// was stored successfully.
    pub fn unreflected(&self) -> Vec<Excerpt> {
        let inner = self.inner.lock().expect("episodic buffer lock poisoned");
        inner.unreflected.clone()
    }

    /// Drop successfully reflected excerpts from the backlog.
    pub fn mark_reflected(&self, memory_ids: &[String]) {
        let mut inner = self.inner.lock().expect("episodic buffer lock poisoned");
        inner
            .unreflected
            .retain(|e| !memory_ids.contains(&e.memory_id));
    }

    pub fn unreflected_len(&self) -> usize {
        let inner = self.inner.lock().expect("episodic buffer lock poisoned");
        inner.unreflected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_n(buffer: &EpisodicBuffer, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                let id = format!("m{i}");
                buffer.record(&id, &format!("user: message number {i}"));
                id
            })
            .collect()
    }

    #[test]
    fn buffer_caps_at_capacity() {
        let buffer = EpisodicBuffer::new(4, 100);
        record_n(&buffer, 10);
        let recent = buffer.recent(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent.last().unwrap().memory_id, "m9");
        assert_eq!(recent.first().unwrap().memory_id, "m6");
    }

    #[test]
    fn reflection_due_at_threshold() {
        let buffer = EpisodicBuffer::new(64, 3);
        assert!(!buffer.record("a", "user: one"));
        assert!(!buffer.record("b", "user: two"));
        assert!(buffer.record("c", "user: three"));
    }

    #[test]
    fn failed_reflection_keeps_backlog() {
        let buffer = EpisodicBuffer::new(64, 2);
        record_n(&buffer, 3);

        // Snapshot, but never mark reflected (simulated failure)
        let snapshot = buffer.unreflected();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(buffer.unreflected_len(), 3);

        // Next attempt sees the same entries plus new ones
        buffer.record("m99", "user: late arrival");
        assert_eq!(buffer.unreflected_len(), 4);
    }

    #[test]
    fn mark_reflected_clears_only_named_ids() {
        let buffer = EpisodicBuffer::new(64, 2);
        let ids = record_n(&buffer, 3);

        buffer.mark_reflected(&ids[..2].to_vec());
        assert_eq!(buffer.unreflected_len(), 1);
        assert_eq!(buffer.unreflected()[0].memory_id, "m2");
    }

    #[test]
    fn extractive_summarizer_keeps_first_lines() {
        let excerpts = vec![
            Excerpt {
                memory_id: "a".into(),
                text: "user: deployed the new build\nassistant: acknowledged".into(),
                stored_at: Utc::now(),
            },
            Excerpt {
                memory_id: "b".into(),
                text: "user: rollback went fine".into(),
                stored_at: Utc::now(),
            },
        ];
        let body = ExtractiveSummarizer.reflect(&excerpts).unwrap();
        assert!(body.starts_with("Reflection over 2 conversation excerpts:"));
        assert!(body.contains("deployed the new build"));
        assert!(!body.contains("acknowledged"));
        assert!(body.contains("rollback went fine"));
    }

    #[test]
    fn summarizer_rejects_empty_input() {
        assert!(ExtractiveSummarizer.reflect(&[]).is_err());
    }
}
