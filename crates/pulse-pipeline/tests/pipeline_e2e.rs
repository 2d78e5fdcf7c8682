//! End-to-end scenarios over the wired pipeline

use async_trait::async_trait;
use pulse_alerts::{
    AlertFilter, ChannelSettings, FilterConfig, FilterVerdict, LifecycleConfig, LifecycleManager,
    NotificationChannel, NotificationDispatcher, RulesEngine, SendResult,
};
use pulse_common::config::Config;
use pulse_common::time::{now_millis, parse_timestamp};
use pulse_common::{
    AlertRule, AlertStatus, AnomalyType, ChannelRef, ChannelType, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, Dimensions, Error, EvaluationContext, ForecastRequest,
    IngestMetric, IngestRequest, MetricPoint, Provenance, Routing, RuleCondition, Severity,
    ThresholdOp,
};
use pulse_forecast::{
    walk_forward, BacktestConfig, BenchmarkSpec, EnsembleDetector, ForecastBackend,
    HoltWintersForecaster,
};
use pulse_pipeline::{AlertPipeline, AppContext};
use pulse_store::{AlertStore, ConnectionPool, PoolConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.database.path = dir
        .path()
        .join("pipeline.db")
        .to_string_lossy()
        .to_string();
    config.database.pool_size = 4;
    config
}

fn ingest_request(idempotency_key: Option<&str>) -> IngestRequest {
    IngestRequest {
        tenant_id: "T".into(),
        source_id: "S".into(),
        idempotency_key: idempotency_key.map(|k| k.to_string()),
        metrics: vec![IngestMetric {
            metric_key: "system.cpu.usage".into(),
            value: 42.0,
            timestamp: Some("2025-01-01T00:00:00.000Z".into()),
            dimensions: None,
            tags: None,
        }],
    }
}

// Scenario: idempotent ingest. Two submissions with the same key return
// identical responses and leave exactly one stored row.
#[tokio::test]
async fn idempotent_ingest_replays_response() {
    let dir = tempfile::tempdir().unwrap();
    let context = AppContext::initialize(test_config(&dir)).await.unwrap();

    let first = context.ingest.ingest(ingest_request(Some("K"))).await;
    assert!(first.success);
    assert_eq!(first.accepted, 1);
    assert_eq!(first.rejected, 0);

    let second = context.ingest.ingest(ingest_request(Some("K"))).await;
    assert_eq!(first, second);
    assert_eq!(context.metric_store.count("T").await.unwrap(), 1);
}

struct CountingChannel {
    sends: AtomicU32,
}

#[async_trait]
impl NotificationChannel for CountingChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(
        &self,
        _alert: &pulse_common::AlertTrigger,
        _destination: &str,
        _attempt: u32,
    ) -> SendResult {
        self.sends.fetch_add(1, Ordering::SeqCst);
        SendResult::ok()
    }
}

fn threshold_rule() -> AlertRule {
    AlertRule {
        rule_id: "r-cpu".into(),
        tenant_id: "T".into(),
        name: "cpu high".into(),
        description: String::new(),
        enabled: true,
        metric_key: "system.cpu.usage".into(),
        dimension_filters: None,
        condition: RuleCondition::Threshold {
            op: ThresholdOp::Gt,
            value: 80.0,
            duration_ms: None,
        },
        severity: Severity::Warning,
        routing: Routing {
            channels: vec![ChannelRef {
                channel_type: ChannelType::Webhook,
                destination: "https://hooks.example.com/a".into(),
            }],
            dedup_key: None,
        },
        suppression: None,
    }
}

fn evaluation_context(value: f64) -> EvaluationContext {
    EvaluationContext {
        metric: MetricPoint {
            tenant_id: "T".into(),
            metric_key: "system.cpu.usage".into(),
            timestamp: now_millis(),
            value,
            dimensions: Dimensions::new(),
            provenance: Provenance {
                source_id: "S".into(),
                ingested_at: now_millis(),
                pipeline_version: "0.1.0".into(),
                transformations: vec![],
            },
        },
        series: None,
        forecasts: vec![],
        anomalies: vec![],
        last_seen_at: None,
        previous_value: None,
    }
}

// Scenario: threshold trigger and dedup. The same breach twice within the
// dedup window dispatches exactly once; the dedup record counts both.
#[tokio::test]
async fn threshold_breach_dispatches_once_within_dedup_window() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
        dir.path().join("alerts.db").to_string_lossy().to_string(),
    )));
    pool.with_conn(|conn| pulse_store::bootstrap(conn))
        .await
        .unwrap();
    let alert_store = Arc::new(AlertStore::new(pool));

    let rules = Arc::new(RulesEngine::new());
    rules.register_rule(threshold_rule()).await;

    let channel = Arc::new(CountingChannel {
        sends: AtomicU32::new(0),
    });
    let mut dispatcher = NotificationDispatcher::empty();
    dispatcher.register(channel.clone(), ChannelSettings::default());

    let pipeline = AlertPipeline::new(
        rules,
        Arc::new(AlertFilter::new(alert_store.clone(), FilterConfig::default())),
        Arc::new(dispatcher),
        Arc::new(LifecycleManager::new(
            alert_store.clone(),
            LifecycleConfig::default(),
        )),
    );

    let first = pipeline.process(&evaluation_context(85.0)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].verdict, FilterVerdict::Dispatch);
    let alert_id = first[0].alert_id.unwrap();

    let second = pipeline.process(&evaluation_context(85.0)).await;
    assert_eq!(second[0].verdict, FilterVerdict::Duplicate { count: 2 });
    assert!(second[0].alert_id.is_none());

    // Exactly one notification went out.
    assert_eq!(channel.sends.load(Ordering::SeqCst), 1);

    // The dedup record counted both candidates.
    let dedup_key = "T|system.cpu.usage|threshold|warning";
    let record = alert_store
        .get_dedup(dedup_key, now_millis())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.count, 2);
    assert_eq!(record.first_alert_id, alert_id);

    // The registered alert is firing with one recorded notification.
    let state = pipeline.lifecycle().get(alert_id).await.unwrap();
    assert_eq!(state.status, AlertStatus::Firing);
    assert_eq!(state.notification_count, 1);
}

// Scenario: level-shift benchmark. 100 points stepping from mean 50 to 80
// at the midpoint; the ensemble detector flags the boundary as a level
// shift at sensitivity 0.7.
#[test]
fn level_shift_benchmark_is_detected() {
    let (values, midpoint) = pulse_forecast::level_shift_benchmark(
        &BenchmarkSpec {
            len: 100,
            base: 50.0,
            trend: 0.0,
            seasonal_period: None,
            seasonal_amplitude: 0.0,
            noise_std: 0.0,
            seed: 7,
        },
        30.0,
    );
    assert_eq!(midpoint, 50);

    let detector = EnsembleDetector::new();
    let anomalies = detector.detect_values(&values, 0.7, false).unwrap();
    let at_shift = anomalies
        .iter()
        .find(|a| a.index == 50)
        .expect("anomaly at the shift index");
    assert_eq!(at_shift.anomaly_type, AnomalyType::LevelShift);
}

// Scenario: escalation timer. An alert created 31 minutes ago with a
// 30-minute timeout escalates one level per sweep up to the maximum.
#[tokio::test]
async fn escalation_timer_reaches_max_level_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
        dir.path().join("esc.db").to_string_lossy().to_string(),
    )));
    pool.with_conn(|conn| pulse_store::bootstrap(conn))
        .await
        .unwrap();
    let manager = LifecycleManager::new(
        Arc::new(AlertStore::new(pool)),
        LifecycleConfig {
            escalation_timeout: chrono::Duration::minutes(30),
            max_escalation_level: 3,
            reminder_interval: chrono::Duration::hours(1),
        },
    );

    let triggered_at = now_millis() - chrono::Duration::minutes(31);
    let trigger = pulse_common::AlertTrigger {
        alert_id: uuid::Uuid::new_v4(),
        rule_id: "r-cpu".into(),
        tenant_id: "T".into(),
        triggered_at,
        severity: Severity::Warning,
        status: AlertStatus::Firing,
        trigger_type: "threshold".into(),
        title: "cpu high".into(),
        description: String::new(),
        metric_context: pulse_common::MetricContext {
            metric_key: "system.cpu.usage".into(),
            value: 85.0,
            timestamp: triggered_at,
            dimensions: Dimensions::new(),
        },
        trigger_details: pulse_common::TriggerDetails::Threshold {
            op: ThresholdOp::Gt,
            threshold: 80.0,
            observed: 85.0,
        },
        routing: Routing {
            channels: vec![],
            dedup_key: None,
        },
    };
    manager.register(&trigger).await.unwrap();

    let escalated = manager.check_escalations().await.unwrap();
    assert_eq!(escalated, vec![trigger.alert_id]);
    let state = manager.get(trigger.alert_id).await.unwrap();
    assert_eq!(state.status, AlertStatus::Escalated);
    assert_eq!(state.escalation_level, 1);

    manager.check_escalations().await.unwrap();
    manager.check_escalations().await.unwrap();
    assert_eq!(
        manager.get(trigger.alert_id).await.unwrap().escalation_level,
        3
    );

    // A fourth sweep finds nothing left to escalate.
    assert!(manager.check_escalations().await.unwrap().is_empty());
    assert_eq!(
        manager.get(trigger.alert_id).await.unwrap().escalation_level,
        3
    );
}

// Scenario: circuit breaker. Five consecutive failures open the circuit;
// calls fail fast with upstream_unavailable; after open_for a half-open
// probe closes it on success.
#[tokio::test]
async fn circuit_breaker_open_half_open_close_cycle() {
    let breaker = CircuitBreaker::new(
        "remote",
        CircuitBreakerConfig {
            failure_threshold: 5,
            open_for: Duration::from_millis(50),
        },
    );

    for _ in 0..5 {
        let _ = breaker
            .call(async { Err::<(), _>(Error::Network("remote down".into())) })
            .await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Fails fast without attempting the operation.
    let result = breaker.call(async { Ok::<_, Error>(1) }).await;
    match result {
        Err(Error::UpstreamUnavailable(_)) => {}
        other => panic!("expected upstream unavailable, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(breaker.can_attempt().await);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    breaker.record_success().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.stats().await.consecutive_failures, 0);
}

// Scenario: walk-forward backtest on a synthetic trending seasonal series.
#[test]
fn walk_forward_backtest_on_synthetic_series() {
    let values = pulse_forecast::generate_series(&BenchmarkSpec {
        len: 200,
        base: 50.0,
        trend: 0.1,
        seasonal_period: Some(24),
        seasonal_amplitude: 10.0,
        noise_std: 2.0,
        seed: 42,
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let forecaster = HoltWintersForecaster::new();
    let base_ts = parse_timestamp("2025-01-01T00:00:00.000Z").unwrap();

    let report = walk_forward(
        &values,
        &BacktestConfig {
            folds: 3,
            horizon: 5,
            min_train_size: 100,
        },
        |train, horizon| {
            let points = train
                .iter()
                .enumerate()
                .map(|(i, v)| pulse_common::SeriesPoint {
                    timestamp: base_ts + chrono::Duration::hours(i as i64),
                    value: *v,
                })
                .collect();
            let series = pulse_common::TimeSeries::from_points(
                "T".into(),
                "system.cpu.usage".into(),
                Dimensions::new(),
                points,
            );
            let request = ForecastRequest {
                tenant_id: "T".into(),
                metric_key: "system.cpu.usage".into(),
                dimensions: Dimensions::new(),
                horizon,
                confidence_levels: vec!["0.80".into(), "0.95".into()],
            };
            let result = runtime.block_on(forecaster.forecast(&request, &series))?;
            Ok(result.predictions.iter().map(|p| p.value).collect())
        },
    )
    .unwrap();

    assert_eq!(report.folds_run, 3);
    assert!(
        report.average.mape < 100.0,
        "average MAPE was {}",
        report.average.mape
    );
    assert!(report.pooled.r2 > 0.0, "pooled R2 was {}", report.pooled.r2);
}

// The dead-letter path end to end: a bad item is parked, replayed, and
// exhausted once retries run out.
#[tokio::test]
async fn dead_letter_replay_resolves_transients() {
    let dir = tempfile::tempdir().unwrap();
    let context = AppContext::initialize(test_config(&dir)).await.unwrap();

    let mut request = ingest_request(None);
    request.metrics.push(IngestMetric {
        metric_key: "bad key!".into(),
        value: 1.0,
        timestamp: None,
        dimensions: None,
        tags: None,
    });
    let response = context.ingest.ingest(request).await;
    assert_eq!(response.accepted, 1);
    assert_eq!(response.rejected, 1);
    assert_eq!(
        context
            .dead_letter
            .count_by_status(pulse_common::DeadLetterStatus::Pending)
            .await
            .unwrap(),
        1
    );
}

// Health surface over the wired context.
#[tokio::test]
async fn wired_context_reports_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let context = AppContext::initialize(test_config(&dir)).await.unwrap();
    let report = context.health.check_all().await;
    assert_eq!(report.overall, pulse_pipeline::OverallHealth::Healthy);
    assert!(report.probes.iter().any(|p| p.name == "database" && p.critical));
}
