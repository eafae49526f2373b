//! Integration tests for the meter pipeline
//!
//! Tests drive `MeterPipeline` through its public API against a real SQLite
//! store (tempfile) and scripted gateways.
//!
//! Key integration points tested:
//! - Single-flight under concurrent triggers
//! - clear_all waiting out an in-flight run
//! - stop winning over a start that is still waiting
//! - Playback ticker driving the pipeline
//! - Dashboard refresh raising repeat alerts
//! - Settings surviving a store reopen

#[cfg(test)]
mod pipeline_integration_tests {
    use async_trait::async_trait;
    use meterflow::pipeline::{
        db::{apply_embedded_schema, SqliteStore},
        engine::{MeterPipeline, PipelineOptions},
        rating::Quote,
        ticker::playback_ticker_task,
        types::GatewayError,
        AlertSeverity, Detection, DetectionGateway, MeasurementStore, Phase, RatingGateway,
        TriggerOutcome,
    };
    use rusqlite::Connection;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::{watch, Notify};

    fn detection(reading: f64, offset: f64) -> Detection {
        Detection {
            raw_text: format!("{:04}", reading as u64),
            reading,
            offset_seconds: offset,
            num_detections: 4,
            avg_confidence: 0.9,
        }
    }

    /// Detector that parks every call until the test releases it
    struct GatedDetector {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
        readings: Mutex<VecDeque<f64>>,
    }

    impl GatedDetector {
        fn new(readings: Vec<f64>) -> Self {
            Self {
                entered: Notify::new(),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                readings: Mutex::new(readings.into()),
            }
        }
    }

    #[async_trait]
    impl DetectionGateway for GatedDetector {
        async fn detect(&self, _: &str, offset: f64, _: f64) -> Result<Detection, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;

            let next = self.readings.lock().unwrap().pop_front();
            next.map(|r| detection(r, offset)).ok_or(GatewayError::NoReading)
        }
    }

    /// Detector whose reading climbs 10 units per call
    struct ClimbingDetector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DetectionGateway for ClimbingDetector {
        async fn detect(&self, _: &str, offset: f64, _: f64) -> Result<Detection, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(detection(1000.0 + 10.0 * n as f64, offset))
        }
    }

    struct SequenceDetector {
        readings: Mutex<VecDeque<f64>>,
    }

    #[async_trait]
    impl DetectionGateway for SequenceDetector {
        async fn detect(&self, _: &str, offset: f64, _: f64) -> Result<Detection, GatewayError> {
            let next = self.readings.lock().unwrap().pop_front();
            next.map(|r| detection(r, offset)).ok_or(GatewayError::NoReading)
        }
    }

    struct UnitPriceRating;

    #[async_trait]
    impl RatingGateway for UnitPriceRating {
        async fn quote(&self, delta: f64, _: Phase) -> Result<Quote, GatewayError> {
            Ok(Quote::amount_only(delta))
        }
    }

    fn create_db() -> (NamedTempFile, String) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        let conn = Connection::open(&db_path).unwrap();
        apply_embedded_schema(&conn).unwrap();
        (temp_file, db_path)
    }

    fn pipeline_with(
        detector: Arc<dyn DetectionGateway>,
        store: Arc<SqliteStore>,
        options: PipelineOptions,
    ) -> Arc<MeterPipeline> {
        Arc::new(MeterPipeline::new(detector, Arc::new(UnitPriceRating), store, options))
    }

    #[tokio::test]
    async fn test_concurrent_trigger_rejected_while_in_flight() {
        let (_temp, db_path) = create_db();
        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let detector = Arc::new(GatedDetector::new(vec![1500.0]));
        let pipeline = pipeline_with(detector.clone(), store, PipelineOptions::default());
        pipeline.start().await;

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_trigger(5.0).await })
        };
        detector.entered.notified().await;
        assert!(pipeline.snapshot().in_flight);

        // Past the rate gate, stopped by the flight
        assert_eq!(pipeline.on_trigger(10.0).await, TriggerOutcome::Busy);
        assert_eq!(pipeline.snapshot().last_trigger_offset, 10.0);

        detector.release.notify_one();
        assert_eq!(first.await.unwrap(), TriggerOutcome::BaselineSet { reading: 1500.0 });

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert!(!pipeline.snapshot().in_flight);
    }

    #[tokio::test]
    async fn test_clear_all_waits_for_in_flight_run() {
        let (_temp, db_path) = create_db();
        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let detector = Arc::new(GatedDetector::new(vec![1500.0]));
        let pipeline = pipeline_with(detector.clone(), store, PipelineOptions::default());
        pipeline.start().await;

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_trigger(5.0).await })
        };
        detector.entered.notified().await;

        let clear = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.clear_all().await.map_err(|e| e.to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!clear.is_finished());

        detector.release.notify_one();
        assert_eq!(run.await.unwrap(), TriggerOutcome::BaselineSet { reading: 1500.0 });
        assert_eq!(clear.await.unwrap(), Ok(0));

        // The baseline set by the finished run is gone
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.initial_reading, None);
        assert!(!snapshot.running);
    }

    #[tokio::test]
    async fn test_stop_while_start_waits_keeps_session_inactive() {
        let (_temp, db_path) = create_db();
        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let detector = Arc::new(GatedDetector::new(vec![1500.0]));
        let pipeline = pipeline_with(detector.clone(), store, PipelineOptions::default());
        pipeline.start().await;

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.on_trigger(5.0).await })
        };
        detector.entered.notified().await;

        pipeline.stop();
        let restart = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.start().await })
        };
        while !pipeline.snapshot().running {
            tokio::task::yield_now().await;
        }
        pipeline.stop();

        detector.release.notify_one();
        run.await.unwrap();
        assert!(!restart.await.unwrap());

        let snapshot = pipeline.snapshot();
        assert!(!snapshot.running);
        assert!(!snapshot.detection_active);
        assert_eq!(pipeline.on_trigger(100.0).await, TriggerOutcome::Inactive);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ticker_drives_pipeline() {
        let (_temp, db_path) = create_db();
        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let detector = Arc::new(ClimbingDetector { calls: AtomicUsize::new(0) });
        let options = PipelineOptions {
            min_trigger_spacing: 0.0,
            ..PipelineOptions::default()
        };
        let pipeline = pipeline_with(detector.clone(), store.clone(), options);
        pipeline.start().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = tokio::spawn(playback_ticker_task(pipeline.clone(), 10, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        let ticks = ticker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(ticks > 0);
        assert_eq!(pipeline.snapshot().initial_reading, Some(1000.0));
        let stored = store.recent_measurements(50).await.unwrap();
        assert!(!stored.is_empty());
        assert!(stored.iter().all(|m| m.delta > 0.0));
    }

    #[tokio::test]
    async fn test_dashboard_refresh_repeats_alert() {
        let (_temp, db_path) = create_db();
        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let detector = Arc::new(SequenceDetector {
            readings: Mutex::new(vec![1000.0, 1095.0].into()),
        });
        let pipeline = pipeline_with(detector, store, PipelineOptions::default());
        pipeline.set_daily_limit("100").await.unwrap();
        pipeline.start().await;

        pipeline.on_trigger(5.0).await;
        assert!(matches!(
            pipeline.on_trigger(10.0).await,
            TriggerOutcome::Persisted { alert: Some(AlertSeverity::Warning), .. }
        ));

        let summary = pipeline.dashboard().await.unwrap();
        assert!(summary.has_readings);
        assert_eq!(summary.current_bill, 95.0);
        assert_eq!(summary.cost_limit, 100.0);
        pipeline.dashboard().await.unwrap();

        let alerts = pipeline.alerts().await.unwrap();
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.severity == AlertSeverity::Warning && !a.read));

        assert!(pipeline.mark_alert_read(alerts[0].id).await.unwrap());
        assert!(pipeline.alerts().await.unwrap()[0].read);
        assert_eq!(pipeline.clear_alerts().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_settings_survive_reopen() {
        let (_temp, db_path) = create_db();
        {
            let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
            let pipeline = pipeline_with(
                Arc::new(ClimbingDetector { calls: AtomicUsize::new(0) }),
                store,
                PipelineOptions::default(),
            );
            pipeline.set_daily_limit(" 250.5 ").await.unwrap();
            pipeline.set_phase(Phase::Three).await.unwrap();
        }

        let store = Arc::new(SqliteStore::open(&db_path, "admin").unwrap());
        let pipeline = pipeline_with(
            Arc::new(ClimbingDetector { calls: AtomicUsize::new(0) }),
            store,
            PipelineOptions::default(),
        );
        assert_eq!(pipeline.daily_limit().await.unwrap(), Some(250.5));
        assert_eq!(pipeline.phase().await.unwrap(), Phase::Three);

        // Another user sees none of it
        let other = pipeline_with(
            Arc::new(ClimbingDetector { calls: AtomicUsize::new(0) }),
            Arc::new(SqliteStore::open(&db_path, "guest").unwrap()),
            PipelineOptions::default(),
        );
        assert_eq!(other.daily_limit().await.unwrap(), None);
        assert_eq!(other.phase().await.unwrap(), Phase::Single);
    }
}
