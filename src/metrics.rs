use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all jobkeeper metrics
const PREFIX: &str = "jobkeeper";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Execution Metrics
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Finished job attempts"),
        &["job_type", "outcome"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Handler run time in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["job_type"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs_running"), "Jobs currently running on this node"),
        &["job_type"]
    ).expect("Failed to create jobs_running metric");

    // Coordination Metrics
    pub static ref LOCK_CONTENTION_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_lock_contention_total"), "Lock acquisitions refused because the key was held"),
        &["lock_key"]
    ).expect("Failed to create lock_contention_total metric");

    pub static ref ORPHANS_RECOVERED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_orphans_recovered_total"), "Running jobs recovered after their lease expired"),
        &["job_type"]
    ).expect("Failed to create orphans_recovered_total metric");

    pub static ref SCHEDULER_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_scheduler_enqueued_total"), "Jobs enqueued by schedules"),
        &["job_type"]
    ).expect("Failed to create scheduler_enqueued_total metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(LOCK_CONTENTION_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ORPHANS_RECOVERED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_ENQUEUED_TOTAL.clone()));
}

pub fn record_job_execution(job_type: &str, outcome: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_type, outcome])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job_type: &str, running: bool) {
    let gauge = JOBS_RUNNING.with_label_values(&[job_type]);
    if running {
        gauge.inc();
    } else {
        gauge.dec();
    }
}

pub fn record_lock_contention(lock_key: &str) {
    LOCK_CONTENTION_TOTAL.with_label_values(&[lock_key]).inc();
}

pub fn record_orphan_recovered(job_type: &str) {
    ORPHANS_RECOVERED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_scheduler_enqueue(job_type: &str) {
    SCHEDULER_ENQUEUED_TOTAL.with_label_values(&[job_type]).inc();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

/// Serve `/metrics` on 127.0.0.1:`port` until `shutdown` fires.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        init_metrics();
        record_job_execution("metrics_test_job", "success", Duration::from_millis(250));
        set_job_running("metrics_test_job", true);
        set_job_running("metrics_test_job", false);
        record_lock_contention("metrics_test_key");
        record_orphan_recovered("metrics_test_job");
        record_scheduler_enqueue("metrics_test_job");

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        for expected in [
            "jobkeeper_job_executions_total",
            "jobkeeper_job_duration_seconds",
            "jobkeeper_jobs_running",
            "jobkeeper_lock_contention_total",
            "jobkeeper_orphans_recovered_total",
            "jobkeeper_scheduler_enqueued_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        init_metrics();
        record_scheduler_enqueue("metrics_handler_job");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
