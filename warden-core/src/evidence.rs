//! Evidence emission: the sink trait the analyzers write to, and the
//! bounded in-memory log that backs it by default.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::WardenResult;
use crate::types::Evidence;

/// One call per detected condition. Implementations must be cheap: this is
/// invoked on the analyzers' hot path.
pub trait EvidenceSink: Send + Sync {
    fn emit(&self, evidence: Evidence);
}

/// Default sink: bounded log with oldest-first eviction, a warn-level trace
/// per finding, and JSON-lines export for downstream scoring.
pub struct EvidenceLog {
    entries: RwLock<Vec<Evidence>>,
    max_entries: usize,
    total_emitted: AtomicU64,
}

impl EvidenceLog {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
            total_emitted: AtomicU64::new(0),
        }
    }

    pub fn evidence(&self) -> Vec<Evidence> {
        self.entries.read().clone()
    }

    /// Take everything collected so far, leaving the log empty.
    pub fn drain(&self) -> Vec<Evidence> {
        std::mem::take(&mut *self.entries.write())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn total_emitted(&self) -> u64 {
        self.total_emitted.load(Ordering::Relaxed)
    }

    /// Render the current log as JSON lines.
    pub fn to_json_lines(&self) -> WardenResult<String> {
        let entries = self.entries.read();
        let mut out = String::new();
        for ev in entries.iter() {
            out.push_str(&serde_json::to_string(ev)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for EvidenceLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EvidenceSink for EvidenceLog {
    fn emit(&self, mut evidence: Evidence) {
        // Events normally carry their own time; stamp the ones that don't.
        if evidence.timestamp == 0.0 {
            evidence.timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        }
        warn!(
            kind = ?evidence.kind,
            threat = ?evidence.threat_level,
            confidence = evidence.confidence,
            profile = %evidence.profile,
            window = %evidence.window,
            uids = evidence.uids.len(),
            "{}",
            evidence.description,
        );
        self.total_emitted.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.remove(0);
        }
        entries.push(evidence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvidenceCategory, EvidenceKind, ProfileId, ThreatLevel, TimeWindow};

    fn sample(n: u32) -> Evidence {
        Evidence::new(
            EvidenceKind::LongConnection,
            ThreatLevel::Low,
            0.5,
            EvidenceCategory::AnomalyConnection,
            format!("finding {}", n),
            ProfileId("10.0.0.1".parse().unwrap()),
            TimeWindow::new(n),
            n as f64,
        )
    }

    #[test]
    fn test_emit_and_drain() {
        let log = EvidenceLog::new();
        log.emit(sample(1));
        log.emit(sample(2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.total_emitted(), 2);

        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert!(log.is_empty());
        // The running total survives a drain.
        assert_eq!(log.total_emitted(), 2);
    }

    #[test]
    fn test_bounded_eviction() {
        let log = EvidenceLog::with_capacity(3);
        for n in 0..5 {
            log.emit(sample(n));
        }
        let entries = log.evidence();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].window, TimeWindow::new(2));
        assert_eq!(log.total_emitted(), 5);
    }

    #[test]
    fn test_json_lines_roundtrip() {
        let log = EvidenceLog::new();
        log.emit(sample(7));
        let lines = log.to_json_lines().unwrap();
        let parsed: Evidence = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.window, TimeWindow::new(7));
        assert_eq!(parsed.kind, EvidenceKind::LongConnection);
    }
}
