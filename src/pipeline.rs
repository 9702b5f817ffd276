use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::manifest::{ModelDigest, RunManifest, RunOutcome, StageRecord, write_manifest};
use crate::observability::MetricsCollector;
use crate::run_state::RunState;
use crate::stages::{
    RunContext, Stage, StageArtifact, StageInput, StageRegistry, register_defaults,
};
use crate::store::ArtifactStore;
use crate::timestamp::Timestamp;

/// What a call to [`PipelineOrchestrator::run`] did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Another run held the guard; nothing was executed.
    AlreadyRunning,
    Completed(RunReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub timestamp: Timestamp,
    pub run_dir: PathBuf,
    pub model_path: PathBuf,
    pub duration_ms: f64,
    pub stages: Vec<StageRecord>,
}

/// Executes the six stages in order under the single-flight guard.
pub struct PipelineOrchestrator {
    stages: Vec<Box<dyn Stage>>,
    store: ArtifactStore,
    run_state: Arc<RunState>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: StageRegistry,
        store: ArtifactStore,
        run_state: Arc<RunState>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            stages: registry.into_sequence()?,
            store,
            run_state,
            metrics: MetricsCollector::new(),
        })
    }

    /// Production wiring: default stages and the process-wide run state.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = StageRegistry::new();
        register_defaults(&mut registry, config)?;
        let orchestrator = Self::new(
            registry,
            ArtifactStore::from_config(config),
            RunState::global(),
        )?;
        Ok(orchestrator)
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    #[instrument(skip(self))]
    pub fn run(&self) -> Result<RunStatus, PipelineError> {
        let Some(_permit) = self.run_state.try_acquire() else {
            info!("Training pipeline is already running");
            self.metrics.record_run_skipped();
            return Ok(RunStatus::AlreadyRunning);
        };
        self.metrics.record_run_started();
        let clock = Instant::now();

        let run = match self.store.allocate_run() {
            Ok(run) => run,
            Err(err) => {
                error!(error = %format!("{err:#}"), "Failed to allocate run directory");
                self.metrics.record_run_finished(false, clock.elapsed());
                return Err(PipelineError::Store(err));
            }
        };
        let ctx = RunContext::new(run);
        let span = tracing::info_span!("run", timestamp = %ctx.timestamp());
        let _run_guard = span.enter();
        info!(run_dir = %ctx.run().path().display(), "Training run started");

        let started_at = Utc::now();
        let mut records = Vec::with_capacity(self.stages.len());
        let outcome = self.execute_stages(&ctx, &mut records);

        let model = match &outcome {
            Ok(model_path) => match ModelDigest::compute(model_path) {
                Ok(digest) => Some(digest),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "Failed to hash published model");
                    None
                }
            },
            Err(_) => None,
        };
        let manifest = RunManifest {
            timestamp: ctx.timestamp(),
            started_at,
            finished_at: Utc::now(),
            status: if outcome.is_ok() {
                RunOutcome::Succeeded
            } else {
                RunOutcome::Failed
            },
            stages: records.clone(),
            model,
            error: outcome.as_ref().err().map(ToString::to_string),
        };
        let manifest_result = write_manifest(&manifest, &ctx.run().manifest_path());

        let duration = clock.elapsed();
        self.metrics.record_run_finished(outcome.is_ok(), duration);

        let model_path = match outcome {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "Training run failed");
                if let Err(manifest_err) = manifest_result {
                    warn!(error = %format!("{manifest_err:#}"), "Failed to write run manifest");
                }
                return Err(err);
            }
        };
        manifest_result.map_err(PipelineError::Store)?;

        info!(
            model = %model_path.display(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Training run completed"
        );
        Ok(RunStatus::Completed(RunReport {
            timestamp: ctx.timestamp(),
            run_dir: ctx.run().path().to_path_buf(),
            model_path,
            duration_ms: duration.as_secs_f64() * 1_000.0,
            stages: records,
        }))
    }

    /// Run every stage, threading each artifact into the next. Returns the
    /// path of the published model.
    fn execute_stages(
        &self,
        ctx: &RunContext,
        records: &mut Vec<StageRecord>,
    ) -> Result<PathBuf, PipelineError> {
        let mut input = StageInput::Config;
        for stage in &self.stages {
            let kind = stage.kind();
            let span = tracing::info_span!("stage", stage = %kind);
            let _span_guard = span.enter();
            let mut timer = self.metrics.start_stage(kind.as_str());

            match stage.run(input, ctx) {
                Ok(artifact) => {
                    let elapsed = timer.elapsed_ms();
                    info!(duration_ms = elapsed, "Stage completed");
                    records.push(StageRecord::succeeded(kind, elapsed, artifact.summary()));
                    input = StageInput::Artifact(artifact);
                }
                Err(source) => {
                    timer.mark_failed();
                    let elapsed = timer.elapsed_ms();
                    error!(error = %source, duration_ms = elapsed, "Stage failed");
                    records.push(StageRecord::failed(kind, elapsed, source.to_string()));
                    return Err(PipelineError::Stage {
                        stage: kind,
                        timestamp: ctx.timestamp(),
                        source,
                    });
                }
            }
        }

        match input {
            StageInput::Artifact(StageArtifact::Push(pushed)) => Ok(pushed.saved_model_file),
            StageInput::Artifact(other) => Err(PipelineError::Store(anyhow::anyhow!(
                "final stage produced a {} artifact instead of a pushed model",
                other.kind()
            ))),
            StageInput::Config => Err(PipelineError::Store(anyhow::anyhow!(
                "pipeline finished without running any stage"
            ))),
        }
    }
}
