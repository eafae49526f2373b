//! Pipeline Engine - orchestration of one trigger
//!
//! This module provides the `MeterPipeline` struct that owns the session
//! (flags, rate gate, baseline) and runs each trigger through:
//! 1. Rate gate and single-flight gate
//! 2. Detection and baseline diffing
//! 3. Duplicate suppression against recent history
//! 4. Rating, persistence and limit alerting
//!
//! ## State machine
//!
//! ```text
//! IDLE → DETECTING → BASELINE_SET
//!                  → SKIPPED_ZERO_DELTA
//!                  → SKIPPED_DUPLICATE
//!                  → RATING → PERSISTED
//!      → IDLE (flight released on every path)
//! ```
//!
//! ## Locking
//!
//! - Session flags and the rate-gate offset sit behind one `std::sync::Mutex`
//!   that is never held across an `.await`.
//! - The baseline sits inside the [`SingleFlight`], so only the run that
//!   owns the flight can touch it.

use super::alerts::AlertGenerator;
use super::baseline::{BaselineTracker, Observation};
use super::config::{parse_daily_limit, PipelineConfig};
use super::dashboard::DashboardSummary;
use super::db::{AlertStore, MeasurementStore, SettingsStore, StoreResult};
use super::dedupe::{is_duplicate, RecentHistory, DEFAULT_TOLERANCE};
use super::detection::DetectionGateway;
use super::rating::RatingGateway;
use super::single_flight::SingleFlight;
use super::types::{format_timestamp, Alert, AlertSeverity, Measurement, Phase, TriggerOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

/// Readings the dashboard looks at
const DASHBOARD_WINDOW: usize = 50;

/// Tunables for a pipeline session
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source_ref: String,
    pub confidence: f64,
    pub min_trigger_spacing: f64,
    pub duplicate_tolerance: f64,
    pub history_limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            source_ref: "static/sample.mp4".to_string(),
            confidence: 0.05,
            min_trigger_spacing: 4.5,
            duplicate_tolerance: DEFAULT_TOLERANCE,
            history_limit: 10,
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            source_ref: config.source_ref.clone(),
            confidence: config.detection_confidence,
            min_trigger_spacing: config.min_trigger_spacing,
            duplicate_tolerance: config.duplicate_tolerance,
            history_limit: config.history_limit,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionState {
    /// Bumped by stop and clear_all; a start that waited across a bump gives up
    generation: u64,
    running: bool,
    detection_active: bool,
    last_trigger_offset: f64,
    baseline: Option<f64>,
    last_reading: Option<String>,
    last_reading_time: Option<String>,
    last_bill_amount: f64,
    diagnostic: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            generation: 0,
            running: false,
            detection_active: false,
            last_trigger_offset: 0.0,
            baseline: None,
            last_reading: None,
            last_reading_time: None,
            last_bill_amount: 0.0,
            diagnostic: "Not started".to_string(),
        }
    }
}

/// Point-in-time view of the session for status endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub running: bool,
    pub detection_active: bool,
    pub last_trigger_offset: f64,
    pub initial_reading: Option<f64>,
    pub reading: Option<String>,
    pub timestamp: Option<String>,
    pub bill_amount: f64,
    pub debug_info: String,
    pub in_flight: bool,
}

/// Orchestrator for the meter pipeline
///
/// One instance per process; share it behind an `Arc`.
pub struct MeterPipeline {
    detector: Arc<dyn DetectionGateway>,
    rating: Arc<dyn RatingGateway>,
    measurements: Arc<dyn MeasurementStore>,
    alerts: Arc<dyn AlertStore>,
    settings: Arc<dyn SettingsStore>,

    /// Baseline, reachable only by the run holding the flight
    flight: SingleFlight<BaselineTracker>,

    session: Mutex<SessionState>,
    alert_generator: AlertGenerator,
    options: PipelineOptions,

    /// Clock (for testing with fixed time)
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl MeterPipeline {
    /// Create a pipeline using the system clock
    ///
    /// `store` backs measurements, alerts and settings.
    pub fn new<S>(
        detector: Arc<dyn DetectionGateway>,
        rating: Arc<dyn RatingGateway>,
        store: Arc<S>,
        options: PipelineOptions,
    ) -> Self
    where
        S: MeasurementStore + AlertStore + SettingsStore + 'static,
    {
        Self::new_with_clock(detector, rating, store, options, Box::new(Utc::now))
    }

    /// Create a pipeline with a custom clock
    pub fn new_with_clock<S>(
        detector: Arc<dyn DetectionGateway>,
        rating: Arc<dyn RatingGateway>,
        store: Arc<S>,
        options: PipelineOptions,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self
    where
        S: MeasurementStore + AlertStore + SettingsStore + 'static,
    {
        Self {
            detector,
            rating,
            measurements: store.clone(),
            alerts: store.clone(),
            settings: store,
            flight: SingleFlight::new(BaselineTracker::new()),
            session: Mutex::new(SessionState::default()),
            alert_generator: AlertGenerator::new(),
            options,
            now_fn,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        // Session fields are plain values, a panicked holder cannot leave
        // them half-written in a way later triggers care about.
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_diagnostic(&self, diagnostic: String) {
        self.session().diagnostic = diagnostic;
    }

    /// Start detection for a fresh run
    ///
    /// Returns false when a session is already running, or when a stop or
    /// clear lands while waiting for a straggling run.
    pub async fn start(&self) -> bool {
        let generation = {
            let mut session = self.session();
            if session.running {
                return false;
            }
            session.running = true;
            session.generation
        };

        // Fresh run: wait out any straggling run, then forget the old baseline
        {
            let mut baseline = self.flight.enter_blocking().await;
            baseline.reset();
        }

        let mut session = self.session();
        if session.generation != generation || !session.running {
            log::debug!("⏹️  Session stopped while starting, staying inactive");
            return false;
        }
        session.baseline = None;
        session.detection_active = true;
        session.diagnostic = "Detection started - ready to detect meter readings".to_string();
        log::info!("🚀 Detection session started");
        true
    }

    pub fn stop(&self) {
        let mut session = self.session();
        session.generation += 1;
        session.running = false;
        session.detection_active = false;
        session.diagnostic = "Detection stopped".to_string();
        log::info!("⏹️  Detection session stopped");
    }

    /// Delete all readings and reset the session to defaults
    ///
    /// Settings (daily limit, phase) are preserved. Waits for an in-flight
    /// run to finish so the reset never interleaves with a run.
    pub async fn clear_all(&self) -> StoreResult<usize> {
        let mut baseline = self.flight.enter_blocking().await;

        let removed = self.measurements.clear_measurements().await?;
        baseline.reset();
        {
            let mut session = self.session();
            let generation = session.generation + 1;
            *session = SessionState {
                generation,
                ..SessionState::default()
            };
        }

        log::info!("🧹 CLEAR ALL: {} readings removed, session reset", removed);
        Ok(removed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let in_flight = self.flight.is_in_flight();
        let session = self.session();
        SessionSnapshot {
            running: session.running,
            detection_active: session.detection_active,
            last_trigger_offset: session.last_trigger_offset,
            initial_reading: session.baseline,
            reading: session.last_reading.clone(),
            timestamp: session.last_reading_time.clone(),
            bill_amount: session.last_bill_amount,
            debug_info: session.diagnostic.clone(),
            in_flight,
        }
    }

    /// Process one tick from the trigger source
    ///
    /// Never returns an error: every failure is a [`TriggerOutcome`] and the
    /// flight is released before returning.
    pub async fn on_trigger(&self, offset: f64) -> TriggerOutcome {
        {
            let mut session = self.session();
            if !session.detection_active {
                return TriggerOutcome::Inactive;
            }
            if offset <= session.last_trigger_offset + self.options.min_trigger_spacing {
                return TriggerOutcome::RateLimited {
                    offset,
                    last_offset: session.last_trigger_offset,
                };
            }
            session.last_trigger_offset = offset;
        }

        let Some(mut flight) = self.flight.try_enter() else {
            log::debug!("🔒 Processing locked, skipping offset {:.1}s", offset);
            return TriggerOutcome::Busy;
        };

        log::debug!("🔓 Flight acquired for offset {:.1}s", offset);
        let outcome = self.run(&mut flight, offset).await;
        flight.exit();
        log::debug!("🔓 Flight released for offset {:.1}s", offset);

        outcome
    }

    async fn run(&self, baseline: &mut BaselineTracker, offset: f64) -> TriggerOutcome {
        let detection = match self
            .detector
            .detect(&self.options.source_ref, offset, self.options.confidence)
            .await
        {
            Ok(detection) => detection,
            Err(e) => {
                log::warn!("⚠️  Detection failed at {:.1}s: {}", offset, e);
                self.set_diagnostic(format!("Detection failed at {:.1}s: {}", offset, e));
                return TriggerOutcome::DetectionFailed { error: e.to_string() };
            }
        };
        let reading = detection.reading;
        log::info!("📟 Detected meter reading {} at {:.1}s", reading, offset);

        let delta = match baseline.observe(reading) {
            Observation::Baseline => {
                let mut session = self.session();
                session.baseline = Some(reading);
                session.diagnostic = format!("Initial reading set: {} KWh", reading);
                log::info!("📍 INITIAL READING SET: {} KWh", reading);
                return TriggerOutcome::BaselineSet { reading };
            }
            Observation::NonPositive { delta } => {
                self.set_diagnostic(format!(
                    "Initial reading: {} KWh | Current reading: {} KWh",
                    baseline.value().unwrap_or(reading),
                    reading
                ));
                log::debug!("⏭️  Same reading as initial (Δ {:.2}), skipping", delta);
                return TriggerOutcome::SkippedZeroDelta { reading };
            }
            Observation::Delta(delta) => delta,
        };
        let initial = baseline.value().unwrap_or(reading);

        let history = match self.measurements.recent_deltas(self.options.history_limit).await {
            Ok(stored) => RecentHistory::from_stored(&stored),
            Err(e) => return self.store_failure("read recent readings", e),
        };

        if is_duplicate(delta, &history, self.options.duplicate_tolerance) {
            self.set_diagnostic(format!(
                "Current: {} KWh | Initial: {} KWh | Difference: {:.1} KWh | Duplicate reading; skipping",
                reading, initial, delta
            ));
            log::debug!("⏭️  Duplicate Δ {:.2} KWh against {} recent readings", delta, history.len());
            return TriggerOutcome::SkippedDuplicate { reading, delta };
        }

        let phase = match self.settings.phase().await {
            Ok(phase) => phase,
            Err(e) => {
                log::warn!("⚠️  Could not read phase setting, using default: {}", e);
                Phase::default()
            }
        };

        let (cost, breakdown, rating_fallback) = match self.rating.quote(delta, phase).await {
            Ok(quote) => (quote.amount, quote.breakdown, false),
            Err(e) => {
                log::warn!("⚠️  Rating unavailable for Δ {:.2} KWh, billing 0: {}", delta, e);
                (0.0, None, true)
            }
        };

        let now = (self.now_fn)();
        let measurement = Measurement::new(delta, cost, breakdown, now)
            .with_frame_ref(format!("frame@{:.1}s", offset));

        if let Err(e) = self.measurements.append_measurement(&measurement).await {
            return self.store_failure("save reading", e);
        }

        {
            let mut session = self.session();
            session.last_reading = Some(measurement.detection_label.clone());
            session.last_reading_time = Some(measurement.timestamp.clone());
            session.last_bill_amount = cost;
            session.diagnostic = if rating_fallback {
                format!(
                    "Current: {} KWh | Initial: {} KWh | Difference: {:.1} KWh | Error obtaining bill amount",
                    reading, initial, delta
                )
            } else {
                format!(
                    "Current: {} KWh | Initial: {} KWh | Difference: {:.1} KWh | Bill: ₹{}",
                    reading, initial, delta, cost
                )
            };
        }
        log::info!(
            "✅ Saved {} (bill ₹{:.2}, phase {})",
            measurement.detection_label,
            cost,
            phase
        );

        let alert = self.evaluate_limit(cost, now).await;

        TriggerOutcome::Persisted {
            reading,
            delta,
            cost,
            rating_fallback,
            alert,
        }
    }

    fn store_failure(
        &self,
        action: &str,
        e: Box<dyn std::error::Error + Send + Sync>,
    ) -> TriggerOutcome {
        log::error!("❌ Failed to {}: {}", action, e);
        self.set_diagnostic(format!("Failed to {}: {}", action, e));
        TriggerOutcome::Failed {
            error: format!("Failed to {}: {}", action, e),
        }
    }

    /// Compare `cost` with the active limit and store an alert if it qualifies
    ///
    /// Alert failures are logged, never propagated.
    async fn evaluate_limit(&self, cost: f64, now: DateTime<Utc>) -> Option<AlertSeverity> {
        let limit = match self.settings.daily_limit().await {
            Ok(Some(limit)) => limit,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("⚠️  Could not read daily limit: {}", e);
                return None;
            }
        };

        let draft = self.alert_generator.evaluate(cost, limit)?;
        match self
            .alerts
            .append_alert(&draft.message, draft.severity, &format_timestamp(now))
            .await
        {
            Ok(_) => {
                log::info!("🚨 {}", draft.message);
                Some(draft.severity)
            }
            Err(e) => {
                log::error!("❌ Failed to save alert: {}", e);
                None
            }
        }
    }

    /// Validate and store a new daily limit, replacing any previous one
    pub async fn set_daily_limit(&self, raw: &str) -> StoreResult<f64> {
        let limit = parse_daily_limit(raw)?;
        self.settings.replace_daily_limit(limit).await?;
        log::info!("💰 Daily cost limit set to ₹{}", limit);
        Ok(limit)
    }

    pub async fn clear_daily_limit(&self) -> StoreResult<()> {
        self.settings.clear_daily_limit().await
    }

    pub async fn daily_limit(&self) -> StoreResult<Option<f64>> {
        self.settings.daily_limit().await
    }

    pub async fn set_phase(&self, phase: Phase) -> StoreResult<()> {
        self.settings.replace_phase(phase).await?;
        log::info!("⚡ Meter phase set to {}", phase);
        Ok(())
    }

    pub async fn phase(&self) -> StoreResult<Phase> {
        self.settings.phase().await
    }

    pub async fn alerts(&self) -> StoreResult<Vec<Alert>> {
        self.alerts.list_alerts().await
    }

    pub async fn mark_alert_read(&self, id: i64) -> StoreResult<bool> {
        self.alerts.mark_alert_read(id).await
    }

    pub async fn clear_alerts(&self) -> StoreResult<usize> {
        self.alerts.clear_alerts().await
    }

    /// Summarise recent readings; also evaluates the limit on every call
    pub async fn dashboard(&self) -> StoreResult<DashboardSummary> {
        let readings = self.measurements.recent_measurements(DASHBOARD_WINDOW).await?;
        let limit = self.settings.daily_limit().await?;
        let summary = DashboardSummary::from_measurements(&readings, limit);

        if summary.has_readings {
            self.evaluate_limit(summary.current_bill, (self.now_fn)()).await;
        }

        Ok(summary)
    }
}
