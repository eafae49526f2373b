//! Playback ticker - drives triggers from a media clock
//!
//! Stands in for the front-end's periodic playback-position callback: every
//! tick advances the playback offset and fires one trigger. Each trigger is
//! spawned so a slow run never delays the clock; the pipeline's own gates
//! decide what actually runs.

use super::engine::MeterPipeline;
use super::types::TriggerOutcome;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Monotonic playback position in seconds
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    offset: f64,
    step: f64,
}

impl PlaybackClock {
    pub fn new(step_seconds: f64) -> Self {
        Self {
            offset: 0.0,
            step: step_seconds,
        }
    }

    /// Advance by one step and return the new offset
    pub fn advance(&mut self) -> f64 {
        self.offset += self.step;
        self.offset
    }
}

/// Ticker task - fire one trigger per interval until `shutdown` flips to true
///
/// Arguments:
/// - `pipeline`: Shared MeterPipeline instance
/// - `trigger_interval_ms`: Wall-clock spacing of ticks, also the playback step
/// - `shutdown`: Set to true to end the loop
///
/// Returns the number of ticks fired.
pub async fn playback_ticker_task(
    pipeline: Arc<MeterPipeline>,
    trigger_interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    log::info!("⏰ Starting playback ticker (interval: {}ms)", trigger_interval_ms);

    let mut timer = interval(Duration::from_millis(trigger_interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut clock = PlaybackClock::new(trigger_interval_ms as f64 / 1000.0);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            changed = shutdown.changed() => {
                let stop = changed.is_err() || *shutdown.borrow();
                if stop {
                    break;
                }
                continue;
            }
        }

        let offset = clock.advance();
        ticks += 1;

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let outcome = pipeline.on_trigger(offset).await;
            log_outcome(offset, &outcome);
        });
    }

    log::info!("⏹️  Playback ticker stopped after {} ticks", ticks);
    ticks
}

fn log_outcome(offset: f64, outcome: &TriggerOutcome) {
    match outcome {
        o if o.is_quiet() => log::trace!("{:.1}s: {}", offset, o.message()),
        TriggerOutcome::Persisted { delta, cost, .. } => {
            log::info!("📊 {:.1}s: {} (Δ {:.2} KWh, ₹{:.2})", offset, outcome.message(), delta, cost);
        }
        TriggerOutcome::DetectionFailed { error } | TriggerOutcome::Failed { error } => {
            log::warn!("⚠️  {:.1}s: {} - {}", offset, outcome.message(), error);
        }
        other => log::debug!("{:.1}s: {}", offset, other.message()),
    }
}
