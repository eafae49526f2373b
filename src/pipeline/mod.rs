//! # Meter Reading Pipeline
//!
//! This module turns detection ticks into billed consumption records:
//! - Receives time offsets from a playback clock (the trigger source)
//! - Reads the meter at that offset through the detection gateway
//! - Diffs the reading against the session baseline
//! - Suppresses noisy repeats against recent history
//! - Prices the delta through the rating gateway
//! - Writes to SQLite: readings, alerts, settings
//!
//! ## Architecture
//!
//! ```text
//! ticker (offset t)
//!     ↓
//! MeterPipeline::on_trigger()   rate gate → single-flight gate
//!     ↓
//! DetectionGateway::detect()    raw reading
//!     ↓
//! BaselineTracker::observe()    baseline | delta | non-positive
//!     ↓
//! RecentHistory + is_duplicate  snapshot of last 10 deltas
//!     ↓
//! RatingGateway::quote()        cost (zero on failure)
//!     ↓
//! MeasurementStore::append()    + AlertGenerator::evaluate()
//! ```
//!
//! **Key Principle:** at most one run is in flight. Triggers that arrive
//! while a run holds the flight are dropped, never queued.
//!
//! ## Schema Reference
//!
//! All persisted types match the SQL schema in `/sql/`:
//! - `readings` → `Measurement`
//! - `alerts` → `Alert`
//! - `user_settings` → daily cost limit
//! - `meter_settings` → phase selector
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (Measurement, Alert, Phase, TriggerOutcome)
//! - `baseline` - First-reading baseline and delta computation
//! - `dedupe` - Duplicate filter over recent history
//! - `single_flight` - Non-blocking run guard
//! - `alerts` - Daily limit threshold evaluation
//! - `detection` / `rating` - External gateway traits and HTTP clients
//! - `db` - Store traits and the SQLite implementation
//! - `engine` - The orchestrator
//! - `dashboard` - Read-side summary of persisted readings
//! - `ticker` - Playback clock driving triggers

pub mod types;
pub mod baseline;
pub mod dedupe;
pub mod single_flight;
pub mod alerts;
pub mod detection;
pub mod rating;
pub mod db;
pub mod engine;
pub mod dashboard;
pub mod config;
pub mod ticker;

// Re-export commonly used types
pub use types::{Alert, AlertSeverity, CostBreakdown, Measurement, Phase, TriggerOutcome};
pub use baseline::{BaselineTracker, Observation};
pub use dedupe::{is_duplicate, RecentHistory};
pub use single_flight::{FlightGuard, SingleFlight};
pub use alerts::{AlertDraft, AlertGenerator};
pub use detection::{Detection, DetectionGateway, HttpDetectionGateway};
pub use rating::{HttpRatingGateway, Quote, RatingGateway};
pub use db::{AlertStore, MeasurementStore, SettingsStore, SqliteStore};
pub use engine::{MeterPipeline, PipelineOptions, SessionSnapshot};
pub use dashboard::DashboardSummary;
pub use config::PipelineConfig;
