use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub last_run_duration_ms: f64,
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_skipped: u64,
    pub predictions_served: u64,
    pub predictions_failed: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared counters for runs, stages and predictions. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }

    pub fn record_run_started(&self) {
        self.update(|m| m.runs_started += 1);
    }

    pub fn record_run_finished(&self, succeeded: bool, duration: Duration) {
        self.update(|m| {
            if succeeded {
                m.runs_succeeded += 1;
            } else {
                m.runs_failed += 1;
            }
            m.last_run_duration_ms = duration.as_secs_f64() * 1_000.0;
        });
    }

    pub fn record_run_skipped(&self) {
        self.update(|m| m.runs_skipped += 1);
    }

    pub fn record_prediction(&self, succeeded: bool) {
        self.update(|m| {
            if succeeded {
                m.predictions_served += 1;
            } else {
                m.predictions_failed += 1;
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

/// Records the stage duration when dropped, so early returns are still timed.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() * 1_000.0
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.elapsed_ms();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            failed = self.failed,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs_started = snapshot.runs_started,
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        runs_skipped = snapshot.runs_skipped,
        last_run_duration_ms = snapshot.last_run_duration_ms,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            ("sensor_runs_started_total", "Training runs started", self.runs_started),
            ("sensor_runs_succeeded_total", "Training runs completed successfully", self.runs_succeeded),
            ("sensor_runs_failed_total", "Training runs aborted by a stage failure", self.runs_failed),
            ("sensor_runs_skipped_total", "Training requests ignored because a run was in progress", self.runs_skipped),
            ("sensor_predictions_served_total", "Prediction requests answered", self.predictions_served),
            ("sensor_predictions_failed_total", "Prediction requests rejected or failed", self.predictions_failed),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }

        output.push_str("# HELP sensor_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE sensor_stage_calls_total counter\n");
        output.push_str("# HELP sensor_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE sensor_stage_failures_total counter\n");
        output.push_str(
            "# HELP sensor_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE sensor_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP sensor_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE sensor_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "sensor_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "sensor_stage_failures_total{{stage=\"{stage}\"}} {}",
                metrics.failures
            );
            let _ = writeln!(
                output,
                "sensor_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "sensor_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP sensor_last_run_duration_seconds Duration of the last finished run\n");
        output.push_str("# TYPE sensor_last_run_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "sensor_last_run_duration_seconds {:.6}",
            self.last_run_duration_ms / 1_000.0
        );
        output
    }
}
