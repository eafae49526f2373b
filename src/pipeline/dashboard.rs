//! Dashboard summary over recent measurements

use super::alerts::used_percent;
use super::dedupe::parse_stored_delta;
use super::types::Measurement;
use chrono::{DateTime, Timelike};
use serde::Serialize;

/// Points plotted on the consumption trend
pub const TREND_POINTS: usize = 30;

/// Three-hour slots in a day (12AM, 3AM, ... 9PM)
pub const PEAK_SLOTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub current_reading: String,
    pub current_bill: f64,
    /// Formatted with one decimal
    pub average_daily: String,
    pub cost_limit: f64,
    pub limit_used_percent: f64,
    pub limit_remaining_percent: f64,
    pub has_readings: bool,
    pub consumption_data: Vec<f64>,
    pub consumption_labels: Vec<String>,
    pub peak_hours_data: Vec<f64>,
}

impl DashboardSummary {
    /// Build the summary from measurements ordered newest first
    pub fn from_measurements(readings: &[Measurement], limit: Option<f64>) -> Self {
        let cost_limit = limit.unwrap_or(0.0);

        let Some(latest) = readings.first() else {
            return Self {
                current_reading: "0 KWh".to_string(),
                current_bill: 0.0,
                average_daily: "0.0".to_string(),
                cost_limit,
                limit_used_percent: 0.0,
                limit_remaining_percent: 100.0,
                has_readings: false,
                consumption_data: Vec::new(),
                consumption_labels: Vec::new(),
                peak_hours_data: vec![0.0; PEAK_SLOTS],
            };
        };

        let current_bill = latest.cost;
        let total: f64 = readings
            .iter()
            .filter_map(|m| parse_stored_delta(&m.detection_label))
            .sum();
        let average = total / readings.len() as f64;

        // Oldest readings of the window, plotted left to right
        let trend_start = readings.len().saturating_sub(TREND_POINTS);
        let mut consumption_data = Vec::new();
        let mut consumption_labels = Vec::new();
        let mut slot_sums = [0.0; PEAK_SLOTS];
        let mut slot_counts = [0usize; PEAK_SLOTS];

        for m in readings[trend_start..].iter().rev() {
            let (Some(value), Ok(at)) = (
                parse_stored_delta(&m.detection_label),
                DateTime::parse_from_rfc3339(&m.timestamp),
            ) else {
                log::debug!("Skipping unplottable reading {:?}", m.id);
                continue;
            };

            consumption_data.push(value);
            consumption_labels.push(at.format("%d/%m %H:%M").to_string());

            let slot = at.hour() as usize / 3;
            slot_sums[slot] += value;
            slot_counts[slot] += 1;
        }

        let peak_hours_data = slot_sums
            .iter()
            .zip(slot_counts.iter())
            .map(|(sum, &count)| {
                if count > 0 {
                    (sum / count as f64 * 100.0).round() / 100.0
                } else {
                    0.0
                }
            })
            .collect();

        let limit_used_percent = if cost_limit > 0.0 {
            used_percent(current_bill, cost_limit)
        } else {
            0.0
        };

        Self {
            current_reading: latest.detection_label.clone(),
            current_bill,
            average_daily: format!("{:.1}", average),
            cost_limit,
            limit_used_percent,
            limit_remaining_percent: (100.0 - limit_used_percent).max(0.0),
            has_readings: true,
            consumption_data,
            consumption_labels,
            peak_hours_data,
        }
    }
}
