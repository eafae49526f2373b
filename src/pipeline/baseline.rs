//! Session baseline tracking
//!
//! The first accepted raw reading of a run becomes the baseline; every
//! later reading is billed as the difference from it.

/// What a raw reading means relative to the baseline
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// No baseline existed; this reading is now the baseline
    Baseline,
    /// Reading at or below the baseline (repeat of the initial frame)
    NonPositive { delta: f64 },
    /// Billable consumption since the baseline
    Delta(f64),
}

/// Holds the first reading of a run
///
/// Invariant: once established, the value only changes through `reset()`.
#[derive(Debug, Default, Clone)]
pub struct BaselineTracker {
    value: Option<f64>,
}

impl BaselineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, raw: f64) -> Observation {
        let Some(baseline) = self.value else {
            self.value = Some(raw);
            return Observation::Baseline;
        };

        let delta = raw - baseline;
        if delta <= 0.0 {
            Observation::NonPositive { delta }
        } else {
            Observation::Delta(delta)
        }
    }

    pub fn is_established(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}
