//! Application context: constructor-injected wiring of every component
//!
//! There are no process globals; everything hangs off an [`AppContext`]
//! built once at startup and shared behind an `Arc`.

use crate::alerting::AlertPipeline;
use crate::health::{FnProbe, HealthMonitor};
use pulse_alerts::{
    AlertFilter, FilterConfig, LifecycleConfig, LifecycleManager, NotificationDispatcher,
    RulesEngine,
};
use pulse_common::{Config, Dimensions, Error, EvaluationContext, MetricPoint, Result};
use pulse_forecast::{
    BackendRegistration, BackendRegistry, DetectionRequest, EnsembleDetector,
    HoltWintersForecaster, RemoteForecastClient,
};
use pulse_ingest::{BackfillRunner, DeadLetterWorker, IngestHandler};
use pulse_store::{
    AlertStore, ConnectionPool, DeadLetterPolicy, DeadLetterStore, ForecastStore,
    IdempotencyStore, MetricStore, PoolConfig,
};
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
pub struct AppContext {
    pub config: Config,
    pub pool: Arc<ConnectionPool>,
    pub metric_store: Arc<MetricStore>,
    pub idempotency: Arc<IdempotencyStore>,
    pub dead_letter: Arc<DeadLetterStore>,
    pub alert_store: Arc<AlertStore>,
    pub forecast_store: Arc<ForecastStore>,
    pub ingest: Arc<IngestHandler>,
    pub backfill: Arc<BackfillRunner>,
    pub dead_letter_worker: Arc<DeadLetterWorker>,
    pub registry: Arc<BackendRegistry>,
    pub rules: Arc<RulesEngine>,
    pub alerts: Arc<AlertPipeline>,
    pub health: Arc<HealthMonitor>,
}

impl AppContext {
    /// Build and wire every component from configuration
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        info!("initializing pipeline context");

        let pool = Arc::new(ConnectionPool::new(
            PoolConfig::new(config.database.path.clone())
                .with_max_size(config.database.pool_size)
                .with_acquire_timeout(std::time::Duration::from_millis(
                    config.database.acquire_timeout_ms,
                )),
        ));
        pool.with_conn(|conn| pulse_store::bootstrap(conn)).await?;

        let metric_store = Arc::new(
            MetricStore::new(pool.clone()).with_chunk_size(config.ingest.chunk_size),
        );
        let idempotency = Arc::new(IdempotencyStore::new(pool.clone()));
        let dead_letter = Arc::new(DeadLetterStore::new(pool.clone()).with_policy(
            DeadLetterPolicy {
                max_retries: config.ingest.dead_letter_max_retries,
                base_delay_ms: config.ingest.dead_letter_base_delay_ms,
                max_delay_ms: config.ingest.dead_letter_max_delay_ms,
            },
        ));
        let alert_store = Arc::new(AlertStore::new(pool.clone()));
        let forecast_store = Arc::new(ForecastStore::new(pool.clone()));

        let ingest = Arc::new(IngestHandler::new(
            metric_store.clone(),
            idempotency.clone(),
            dead_letter.clone(),
            config.ingest.clone(),
        ));
        let backfill = Arc::new(BackfillRunner::new(ingest.clone()));
        let dead_letter_worker =
            Arc::new(DeadLetterWorker::new(ingest.clone(), dead_letter.clone()));

        let registry = Arc::new(
            BackendRegistry::new().with_health_timeout(std::time::Duration::from_millis(
                config.forecast.health_timeout_ms,
            )),
        );
        registry
            .register(
                "holt_winters",
                Arc::new(HoltWintersForecaster::new()),
                BackendRegistration {
                    priority: 10,
                    is_default: config.forecast.default_backend == "holt_winters",
                },
            )
            .await;
        registry
            .register(
                "ensemble",
                Arc::new(EnsembleDetector::new()),
                BackendRegistration {
                    priority: 10,
                    is_default: config.forecast.default_backend == "ensemble",
                },
            )
            .await;
        if config.forecast.remote_api_url.is_some() {
            match RemoteForecastClient::new("remote", &config.forecast) {
                Ok(remote) => {
                    registry
                        .register(
                            "remote",
                            Arc::new(remote),
                            BackendRegistration {
                                priority: 20,
                                is_default: config.forecast.default_backend == "remote",
                            },
                        )
                        .await;
                }
                Err(e) => warn!("remote forecast backend not registered: {}", e),
            }
        }

        let rules = Arc::new(RulesEngine::new());
        match rules.load_from_store(&alert_store).await {
            Ok(count) => info!("rules engine primed with {} rule(s)", count),
            Err(e) => warn!("failed to load rules from store: {}", e),
        }

        let filter = Arc::new(AlertFilter::new(
            alert_store.clone(),
            FilterConfig {
                default_dedup_window_ms: config.alerting.dedup_window_ms,
                rate_limit_per_minute: config.alerting.rate_limit_per_minute,
            },
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(&config.alerting));
        let lifecycle = Arc::new(LifecycleManager::new(
            alert_store.clone(),
            LifecycleConfig {
                escalation_timeout: Duration::milliseconds(
                    config.alerting.escalation_timeout_ms as i64,
                ),
                max_escalation_level: config.alerting.max_escalation_level,
                reminder_interval: Duration::milliseconds(
                    config.alerting.reminder_interval_ms as i64,
                ),
            },
        ));
        let alerts = Arc::new(AlertPipeline::new(
            rules.clone(),
            filter,
            dispatcher,
            lifecycle,
        ));

        let health = Arc::new(HealthMonitor::new(&config.health));
        {
            let pool_probe = pool.clone();
            health
                .register(
                    "database",
                    true,
                    Arc::new(FnProbe(move || {
                        let pool = pool_probe.clone();
                        async move { pool.health_check().await }
                    })),
                )
                .await;

            let registry_probe = registry.clone();
            health
                .register(
                    "forecast_backends",
                    false,
                    Arc::new(FnProbe(move || {
                        let registry = registry_probe.clone();
                        async move {
                            registry.check_health().await;
                            if registry.list_healthy().await.is_empty() {
                                Err(Error::UpstreamUnavailable(
                                    "no healthy forecast backend".to_string(),
                                ))
                            } else {
                                Ok(())
                            }
                        }
                    })),
                )
                .await;
        }

        info!("pipeline context initialized");
        Ok(Arc::new(Self {
            config,
            pool,
            metric_store,
            idempotency,
            dead_letter,
            alert_store,
            forecast_store,
            ingest,
            backfill,
            dead_letter_worker,
            registry,
            rules,
            alerts,
            health,
        }))
    }

    /// Assemble the rule-evaluation bundle for a metric point: recent
    /// series, latest forecast, recent anomalies, last-seen timestamp and
    /// previous value.
    pub async fn build_evaluation_context(
        &self,
        metric: MetricPoint,
    ) -> Result<EvaluationContext> {
        let lookback = metric.timestamp - Duration::hours(24);
        let series = self
            .metric_store
            .as_series(
                &metric.tenant_id,
                &metric.metric_key,
                &metric.dimensions,
                Some(lookback),
                Some(metric.timestamp),
            )
            .await?;

        let previous_value = series
            .points
            .iter()
            .rev()
            .find(|p| p.timestamp < metric.timestamp)
            .map(|p| p.value);
        let last_seen_at = series.meta.end;

        let forecasts = self
            .forecast_store
            .latest_forecast(&metric.tenant_id, &metric.metric_key, &metric.dimensions)
            .await?
            .map(|f| f.predictions)
            .unwrap_or_default();

        let anomalies = self
            .forecast_store
            .recent_anomalies(
                &metric.tenant_id,
                &metric.metric_key,
                &metric.dimensions,
                lookback,
            )
            .await?;

        Ok(EvaluationContext {
            metric,
            series: Some(series),
            forecasts,
            anomalies,
            last_seen_at,
            previous_value,
        })
    }

    /// Produce a forecast over the stored series and persist the result
    pub async fn run_forecast(
        &self,
        request: pulse_common::ForecastRequest,
    ) -> Result<pulse_common::ForecastResult> {
        let series = self
            .metric_store
            .as_series(
                &request.tenant_id,
                &request.metric_key,
                &request.dimensions,
                None,
                None,
            )
            .await?;
        let job = self
            .forecast_store
            .create_job(
                &request.tenant_id,
                &request.metric_key,
                &request.dimensions,
                request.horizon,
            )
            .await?;
        let backend = self.registry.get_default().await;
        match backend.forecast(&request, &series).await {
            Ok(result) => {
                self.forecast_store.insert_forecast(&result).await?;
                self.forecast_store.finish_job(job, None).await?;
                Ok(result)
            }
            Err(e) => {
                self.forecast_store
                    .finish_job(job, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Run a detection sweep over a stored series and persist the result
    pub async fn detect_anomalies(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
        sensitivity: f64,
    ) -> Result<pulse_common::DetectionResult> {
        let series = self
            .metric_store
            .as_series(tenant_id, metric_key, dimensions, None, None)
            .await?;
        let backend = match self.registry.get("ensemble").await {
            Some(backend) => backend,
            None => self.registry.get_default().await,
        };
        let request = DetectionRequest::new(tenant_id, metric_key)
            .with_sensitivity(sensitivity);
        let result = backend.detect(&request, &series).await?;
        self.forecast_store.insert_detection(&result).await?;
        Ok(result)
    }

    /// Build the evaluation context from the latest stored point and run
    /// the alert path over it.
    pub async fn evaluate_latest(
        &self,
        tenant_id: &str,
        metric_key: &str,
        dimensions: &Dimensions,
    ) -> Result<Vec<crate::alerting::ProcessedAlert>> {
        let series = self
            .metric_store
            .as_series(tenant_id, metric_key, dimensions, None, None)
            .await?;
        let latest = series
            .points
            .last()
            .ok_or_else(|| Error::NotFound(format!("no points stored for {}", metric_key)))?;
        let metric = MetricPoint {
            tenant_id: tenant_id.to_string(),
            metric_key: metric_key.to_string(),
            timestamp: latest.timestamp,
            value: latest.value,
            dimensions: dimensions.clone(),
            provenance: pulse_common::Provenance {
                source_id: "evaluator".to_string(),
                ingested_at: pulse_common::time::now_millis(),
                pipeline_version: self.config.ingest.pipeline_version.clone(),
                transformations: vec![],
            },
        };
        let context = self.build_evaluation_context(metric).await?;
        Ok(self.alerts.process(&context).await)
    }

    /// Persist a rule and register it with the engine
    pub async fn upsert_rule(&self, rule: pulse_common::AlertRule) -> Result<()> {
        self.alert_store.upsert_rule(&rule).await?;
        self.rules.register_rule(rule).await;
        Ok(())
    }

    /// Remove a rule from the store and the engine
    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let removed = self.alert_store.delete_rule(rule_id).await?;
        self.rules.unregister_rule(rule_id).await;
        Ok(removed)
    }

    /// Drain the pool ahead of process exit
    pub async fn shutdown(&self, deadline: std::time::Duration) -> Result<()> {
        info!("shutting down pipeline context");
        self.pool.drain(deadline).await
    }
}
