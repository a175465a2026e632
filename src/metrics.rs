use metrics::{
    increment_counter, register_counter, register_gauge, register_histogram, Counter, Gauge,
    Histogram,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Pipeline metric handles
///
/// Handles bind to whichever recorder is installed when the struct is built,
/// so call [`install_prometheus`] first when the numbers should be exported.
pub struct Metrics {
    pub jobs_received: Counter,
    pub jobs_completed: Counter,
    pub jobs_rejected: Counter,
    pub capture_duration: Histogram,
    pub encode_duration: Histogram,
    pub dispatch_duration: Histogram,
    pub job_duration: Histogram,
    pub queue_depth: Gauge,
    pub active_jobs: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_received: register_counter!("print_jobs_received_total"),
            jobs_completed: register_counter!("print_jobs_completed_total"),
            jobs_rejected: register_counter!("print_jobs_rejected_total"),
            capture_duration: register_histogram!("print_stage_seconds", "stage" => "capture"),
            encode_duration: register_histogram!("print_stage_seconds", "stage" => "encode"),
            dispatch_duration: register_histogram!("print_stage_seconds", "stage" => "dispatch"),
            job_duration: register_histogram!("print_job_seconds"),
            queue_depth: register_gauge!("print_queue_depth"),
            active_jobs: register_gauge!("print_active_jobs"),
        }
    }

    pub fn record_received(&self) {
        self.jobs_received.increment(1);
    }

    pub fn record_rejected(&self) {
        self.jobs_rejected.increment(1);
    }

    pub fn record_stage(&self, stage: &str, duration: Duration) {
        let seconds = duration.as_secs_f64();
        match stage {
            "capture" => self.capture_duration.record(seconds),
            "encode" => self.encode_duration.record(seconds),
            "dispatch" => self.dispatch_duration.record(seconds),
            _ => {}
        }
    }

    pub fn record_finished(&self, duration: Duration, failed_stage: Option<&'static str>) {
        match failed_stage {
            None => self.jobs_completed.increment(1),
            Some(stage) => increment_counter!("print_jobs_failed_total", "stage" => stage),
        }
        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_active_jobs(&self, count: usize) {
        self.active_jobs.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global Prometheus recorder
///
/// The returned handle renders the text exposition format for `/metrics`.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus recorder installed");
    Ok(handle)
}
