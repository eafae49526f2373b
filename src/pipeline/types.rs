//! Core data structures for the meter pipeline
//!
//! All persisted types match the SQL schema in `/sql/`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::config::ConfigError;

/// Suffix appended to every stored delta label ("12.50 KWh (Δ)")
pub const DELTA_LABEL_SUFFIX: &str = " KWh (Δ)";

/// Format a delta the way it is stored in `readings.reading`
pub fn delta_label(delta: f64) -> String {
    format!("{:.2}{}", delta, DELTA_LABEL_SUFFIX)
}

/// Format a timestamp as stored in every `timestamp` column
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Meter phase selector sent to the rating gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Single,
    Three,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Single => "single",
            Phase::Three => "three",
        }
    }

    /// Numeric selector used by the tariff service (1 or 3)
    pub fn selector(&self) -> u8 {
        match self {
            Phase::Single => 1,
            Phase::Three => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" | "1" => Ok(Phase::Single),
            "three" | "3" => Ok(Phase::Three),
            other => Err(ConfigError::InvalidValue(format!(
                "phase must be 'single' or 'three', got '{}'",
                other
            ))),
        }
    }
}

/// Itemised cost of a measurement
///
/// The rating gateway may return only a total; in that case every
/// component is zero and `total` carries the amount.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub fixed_charge: f64,
    pub energy_charge: f64,
    pub tod_charge: f64,
    pub duty: f64,
    pub subsidy: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn zero_filled(total: f64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

/// An accepted, billed consumption measurement
///
/// SQL reference: `/sql/01_readings.sql`
///
/// Immutable once appended; `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: Option<i64>,
    /// Consumption since baseline
    pub delta: f64,
    /// RFC 3339 timestamp of acceptance
    pub timestamp: String,
    /// Display label, also the text the duplicate filter parses back
    pub detection_label: String,
    pub cost: f64,
    pub cost_breakdown: CostBreakdown,
    /// Which frame of the source produced the reading
    pub frame_ref: Option<String>,
}

impl Measurement {
    pub fn new(delta: f64, cost: f64, breakdown: Option<CostBreakdown>, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            delta,
            timestamp: format_timestamp(at),
            detection_label: delta_label(delta),
            cost,
            cost_breakdown: breakdown.unwrap_or_else(|| CostBreakdown::zero_filled(cost)),
            frame_ref: None,
        }
    }

    pub fn with_frame_ref(mut self, frame_ref: String) -> Self {
        self.frame_ref = Some(frame_ref);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Danger,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Danger => "danger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(AlertSeverity::Warning),
            "danger" => Some(AlertSeverity::Danger),
            _ => None,
        }
    }
}

/// Stored alert record
///
/// SQL reference: `/sql/02_alerts.sql`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: String,
    pub read: bool,
}

/// Failure of an external gateway call
///
/// Routine outcome, never fatal: the orchestrator branches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Request could not be sent or timed out
    Transport(String),
    /// Service answered with a non-success status
    Status(u16),
    /// Response body did not match the expected schema
    Malformed(String),
    /// Detector returned no predictions at all
    NoDetections,
    /// Predictions present but no digits could be assembled
    NoReading,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transport(msg) => write!(f, "Gateway request failed: {}", msg),
            GatewayError::Status(code) => write!(f, "Gateway API error: {}", code),
            GatewayError::Malformed(msg) => write!(f, "Malformed gateway response: {}", msg),
            GatewayError::NoDetections => write!(f, "No detections from API"),
            GatewayError::NoReading => write!(f, "No valid reading detected"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Malformed(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Result of one trigger through the pipeline
///
/// Every variant is a normal return value. Only `DetectionFailed` and
/// `Failed` are reported to the caller as unsuccessful.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Session not started
    Inactive,
    /// Offset too close to the last processed trigger
    RateLimited { offset: f64, last_offset: f64 },
    /// Another run holds the flight
    Busy,
    DetectionFailed { error: String },
    BaselineSet { reading: f64 },
    SkippedZeroDelta { reading: f64 },
    SkippedDuplicate { reading: f64, delta: f64 },
    Persisted {
        reading: f64,
        delta: f64,
        cost: f64,
        rating_fallback: bool,
        alert: Option<AlertSeverity>,
    },
    /// Store failure inside the run
    Failed { error: String },
}

impl TriggerOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            TriggerOutcome::DetectionFailed { .. } | TriggerOutcome::Failed { .. }
        )
    }

    /// Outcomes the front-end should not toast
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            TriggerOutcome::Inactive
                | TriggerOutcome::RateLimited { .. }
                | TriggerOutcome::Busy
                | TriggerOutcome::SkippedZeroDelta { .. }
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            TriggerOutcome::Inactive => "Detection not active",
            TriggerOutcome::RateLimited { .. } => "Video time updated",
            TriggerOutcome::Busy => "Processing locked - skipping",
            TriggerOutcome::DetectionFailed { .. } => "Detection failed",
            TriggerOutcome::BaselineSet { .. } => "Initial reading set",
            TriggerOutcome::SkippedZeroDelta { .. } => "Same reading as initial - skipping",
            TriggerOutcome::SkippedDuplicate { .. } => "Duplicate reading skipped",
            TriggerOutcome::Persisted { .. } => "Reading processed successfully",
            TriggerOutcome::Failed { .. } => "Processing failed",
        }
    }
}
