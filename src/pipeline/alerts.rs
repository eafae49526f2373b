//! Daily cost limit alerts
//!
//! Thresholds:
//! - used >= 100% of limit → `danger`
//! - 90% <= used < 100%    → `warning` with remaining headroom
//! - below 90% or no limit → nothing
//!
//! Every qualifying evaluation produces a new draft; repeats are not
//! suppressed.

use super::types::AlertSeverity;

pub const WARNING_PERCENT: f64 = 90.0;
pub const DANGER_PERCENT: f64 = 100.0;

/// Alert not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub message: String,
    pub severity: AlertSeverity,
    pub used_percent: f64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlertGenerator;

impl AlertGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, current_cost: f64, limit: f64) -> Option<AlertDraft> {
        if limit <= 0.0 {
            return None;
        }

        let used_percent = used_percent(current_cost, limit);

        if used_percent >= DANGER_PERCENT {
            Some(AlertDraft {
                message: format!(
                    "Alert: Daily cost limit exceeded! Current bill: ₹{:.2}, Limit: ₹{}",
                    current_cost, limit
                ),
                severity: AlertSeverity::Danger,
                used_percent,
            })
        } else if used_percent >= WARNING_PERCENT {
            let remaining = limit - current_cost;
            Some(AlertDraft {
                message: format!(
                    "Warning: Approaching daily limit! Used: {:.1}%, Remaining: ₹{:.2}",
                    used_percent, remaining
                ),
                severity: AlertSeverity::Warning,
                used_percent,
            })
        } else {
            None
        }
    }
}

/// Percentage of `limit` consumed; zero when no limit is configured
pub fn used_percent(current_cost: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        current_cost / limit * 100.0
    } else {
        0.0
    }
}
