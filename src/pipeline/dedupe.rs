//! Duplicate filter
//!
//! The detector re-reports the same physical meter state across successive
//! ticks. A candidate delta within `tolerance` of any recently persisted
//! delta is treated as a repeat and not billed again.

use super::types::DELTA_LABEL_SUFFIX;

/// Default tolerance used by the pipeline
pub const DEFAULT_TOLERANCE: f64 = 0.1;

/// Snapshot of recently persisted deltas, most-recent-first
///
/// Taken once per run; never re-read while the run is deciding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentHistory {
    deltas: Vec<f64>,
}

impl RecentHistory {
    pub fn from_values(deltas: Vec<f64>) -> Self {
        Self { deltas }
    }

    /// Build from stored delta text, skipping entries that do not parse
    pub fn from_stored(entries: &[String]) -> Self {
        let deltas = entries
            .iter()
            .filter_map(|entry| match parse_stored_delta(entry) {
                Some(delta) => Some(delta),
                None => {
                    log::debug!("⚠️  Skipping malformed history entry: {:?}", entry);
                    None
                }
            })
            .collect();
        Self { deltas }
    }

    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Parse a stored label such as `"120.00 KWh (Δ)"` or a bare number
pub fn parse_stored_delta(entry: &str) -> Option<f64> {
    let trimmed = entry.trim();
    let numeric = trimmed.strip_suffix(DELTA_LABEL_SUFFIX.trim_start()).unwrap_or(trimmed);
    numeric.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// True if any history entry is strictly closer than `tolerance`
pub fn is_duplicate(candidate: f64, history: &RecentHistory, tolerance: f64) -> bool {
    history
        .deltas
        .iter()
        .any(|existing| (candidate - existing).abs() < tolerance)
}
