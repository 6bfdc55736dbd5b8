//! Job state machine.
//!
//! The orchestrator is the only writer of [`Job`] records. Every stage returns
//! a plain value; progress is persisted at fixed checkpoints:
//!
//! | progress  | checkpoint                         |
//! |-----------|------------------------------------|
//! | 0.0       | accepted, status `running`         |
//! | 0.1       | model and config loaded            |
//! | 0.3       | preprocessing done                 |
//! | 0.3..0.7  | sliding-window progress            |
//! | 0.7       | inference done                     |
//! | 0.9       | postprocessing done                |
//! | 1.0       | result persisted, status `completed` |
//!
//! A stage error marks the job `failed` with the error's message before the
//! error is handed back to the caller.
//!
//! Cancellation is persisted as status `cancelled`, so any orchestrator sharing
//! the store can stop a job. A running job rereads its record at every
//! cancellation check and never writes over a terminal one.

use crate::config::InferenceDefaults;
use crate::error::{PipelineError, Result};
use crate::image_source::ImageSource;
use crate::inference::InferenceEngine;
use crate::job::{Job, JobStatus, SegmentationMetrics, SegmentationResultRecord};
use crate::metrics::{Timer, JOBS_FINISHED, JOBS_RUNNING, JOBS_STARTED, JOB_FAILURES};
use crate::model_cache::ModelCache;
use crate::postprocess::Postprocessor;
use crate::preprocess::Preprocessor;
use crate::storage::{JobStore, ObjectStore};
use chrono::Utc;
use dashmap::DashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PROGRESS_MODEL_LOADED: f64 = 0.1;
pub const PROGRESS_PREPROCESSED: f64 = 0.3;
pub const PROGRESS_INFERRED: f64 = 0.7;
pub const PROGRESS_POSTPROCESSED: f64 = 0.9;
pub const PROGRESS_DONE: f64 = 1.0;

/// Cancellation flags for jobs running in this process.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    flags: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: Uuid) -> Arc<AtomicBool> {
        self.flags
            .entry(job_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn unregister(&self, job_id: Uuid) {
        self.flags.remove(&job_id);
    }

    /// Raises the flag of a running job. Returns false if the job is not
    /// running here.
    pub fn signal(&self, job_id: Uuid) -> bool {
        match self.flags.get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.flags.contains_key(&job_id)
    }
}

/// `(probability, pathology)`: any detected class counts as a finding.
pub fn pathology_verdict(metrics: &SegmentationMetrics) -> (f64, u8) {
    if metrics.detected_classes.is_empty() {
        (0.0, 0)
    } else {
        (1.0, 1)
    }
}

/// Reasons a running job stops early: a cancellation request (raised in this
/// process or persisted by any other) or its deadline.
struct Interrupts<'a> {
    job_id: Uuid,
    store: &'a dyn JobStore,
    flag: &'a AtomicBool,
    deadline: Option<(Instant, Duration)>,
}

impl Interrupts<'_> {
    fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled(String::new()));
        }
        let stored = self.store.load_job(self.job_id)?;
        if stored.status.is_terminal() {
            info!(job_id = %self.job_id, status = %stored.status, "Job was stopped externally");
            return Err(PipelineError::Cancelled(String::new()));
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(PipelineError::InferenceRuntime(format!(
                "Job exceeded inference timeout of {}s",
                limit.as_secs()
            ))),
            _ => Ok(()),
        }
    }
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    images: Arc<dyn ImageSource>,
    models: Arc<ModelCache>,
    preprocessor: Preprocessor,
    engine: InferenceEngine,
    postprocessor: Postprocessor,
    defaults: InferenceDefaults,
    cancellations: CancellationRegistry,
    timeout: Option<Duration>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        images: Arc<dyn ImageSource>,
        models: Arc<ModelCache>,
        defaults: InferenceDefaults,
        cancel_check_interval: usize,
    ) -> Self {
        Self {
            store,
            images,
            models,
            preprocessor: Preprocessor::new(),
            engine: InferenceEngine::new(cancel_check_interval),
            postprocessor: Postprocessor::new(objects),
            defaults,
            cancellations: CancellationRegistry::new(),
            timeout: None,
        }
    }

    /// Fails jobs that run longer than `timeout`. Checked between stages and
    /// at every sliding-window progress report.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Cancels a pending or running job by persisting `cancelled`. A running
    /// job, in this process or any other sharing the store, stops at its next
    /// cancellation check with its progress untouched. Returns the status the
    /// job has afterwards.
    pub fn request_cancel(&self, job_id: Uuid) -> Result<JobStatus> {
        let signalled = self.cancellations.signal(job_id);
        let mut job = self.store.load_job(job_id)?;
        let previous = job.status;
        if previous.is_terminal() {
            return Ok(previous);
        }

        job.transition(JobStatus::Cancelled)?;
        if let Some(stored) = self.store.save_unless_terminal(&job)? {
            return Ok(stored.status);
        }
        if previous == JobStatus::Pending {
            JOBS_FINISHED.with_label_values(&[JobStatus::Cancelled.as_str()]).inc();
            info!(job_id = %job_id, "Pending job cancelled");
        } else {
            info!(job_id = %job_id, in_process = signalled, "Cancellation requested for running job");
        }
        Ok(JobStatus::Cancelled)
    }

    /// Runs a pending job end to end.
    pub fn run(&self, job_id: Uuid) -> Result<SegmentationResultRecord> {
        let job = self.store.load_job(job_id)?;
        if job.status != JobStatus::Pending {
            return Err(PipelineError::Validation(format!(
                "Job {} is {} and cannot be started",
                job_id, job.status
            )));
        }

        let flag = self.cancellations.register(job_id);
        let result = self.run_registered(job, &flag);
        self.cancellations.unregister(job_id);
        result
    }

    fn run_registered(&self, mut job: Job, flag: &AtomicBool) -> Result<SegmentationResultRecord> {
        let job_id = job.id;
        job.transition(JobStatus::Running)?;
        job.error_message = None;
        if let Some(stored) = self.store.save_unless_terminal(&job)? {
            info!(job_id = %job_id, status = %stored.status, "Job stopped before it started");
            return Err(PipelineError::Cancelled(job_id.to_string()));
        }
        JOBS_STARTED.inc();
        JOBS_RUNNING.inc();
        info!(job_id = %job_id, model_id = %job.model_id, "Starting inference job");

        let interrupts = Interrupts {
            job_id,
            store: self.store.as_ref(),
            flag,
            deadline: self.timeout.map(|t| (Instant::now() + t, t)),
        };
        let outcome = self.execute(&mut job, &interrupts);
        JOBS_RUNNING.dec();

        match outcome {
            Ok(record) => {
                JOBS_FINISHED.with_label_values(&[JobStatus::Completed.as_str()]).inc();
                info!(job_id = %job_id, result = %record.segmentation_key, "Job completed");
                Ok(record)
            }
            Err(PipelineError::Cancelled(_)) => {
                if !job.status.is_terminal() {
                    if let Err(e) = self.persist_terminal(&mut job, JobStatus::Cancelled) {
                        error!(job_id = %job_id, "Failed to persist cancelled state: {}", e);
                    }
                }
                JOBS_FINISHED.with_label_values(&[job.status.as_str()]).inc();
                info!(job_id = %job_id, status = %job.status, progress = job.progress, "Job cancelled");
                Err(PipelineError::Cancelled(job_id.to_string()))
            }
            Err(e) => {
                error!(job_id = %job_id, kind = e.kind(), "Job failed: {}", e);
                job.error_message = Some(e.to_string());
                match self.persist_terminal(&mut job, JobStatus::Failed) {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = %job_id, status = %job.status, "Job already finished, failure not recorded"),
                    Err(persist_err) => error!(job_id = %job_id, "Failed to persist failed state: {}", persist_err),
                }
                JOBS_FINISHED.with_label_values(&[job.status.as_str()]).inc();
                JOB_FAILURES.with_label_values(&[e.kind()]).inc();
                Err(e)
            }
        }
    }

    /// Persists progress. A job already finished in the store, typically
    /// cancelled from elsewhere, is left alone and reported as cancelled.
    fn checkpoint(&self, job: &mut Job, progress: f64) -> Result<()> {
        job.advance(progress);
        match self.store.save_unless_terminal(job)? {
            None => Ok(()),
            Some(_) => Err(PipelineError::Cancelled(String::new())),
        }
    }

    /// Saves `job` in `status` and returns whether it was written. When the
    /// stored record is already terminal, that record is kept and adopted.
    fn persist_terminal(&self, job: &mut Job, status: JobStatus) -> Result<bool> {
        let mut next = job.clone();
        next.transition(status)?;
        if status == JobStatus::Completed {
            next.advance(PROGRESS_DONE);
        }
        match self.store.save_unless_terminal(&next)? {
            None => {
                *job = next;
                Ok(true)
            }
            Some(stored) => {
                *job = stored;
                Ok(false)
            }
        }
    }

    fn execute(&self, job: &mut Job, interrupts: &Interrupts) -> Result<SegmentationResultRecord> {
        job.parameters.validate()?;
        let output_format = job.parameters.output_format()?;
        let options = job.parameters.inference_options(&self.defaults);

        // Model + config
        let timer = Timer::new();
        let descriptor = self.store.load_model(&job.model_id)?;
        descriptor.ensure_active()?;
        let model = self.models.load(
            &descriptor.weights_path,
            &descriptor.config_path,
            Some(descriptor.model_type.as_str()),
        )?;
        timer.observe_stage("model_load");
        self.checkpoint(job, PROGRESS_MODEL_LOADED)?;
        interrupts.check()?;

        // Preprocessing
        let timer = Timer::new();
        let (volume, geometry) = self
            .images
            .load(&job.study_reference, job.series_reference.as_deref())?;
        let preprocessed = self.preprocessor.process(&volume, &geometry, &model.config)?;
        timer.observe_stage("preprocess");
        self.checkpoint(job, PROGRESS_PREPROCESSED)?;
        interrupts.check()?;

        // Sliding-window inference
        let timer = Timer::new();
        let store = &self.store;
        let mut stopped_by: Option<PipelineError> = None;
        let mut on_progress = |done: usize, total: usize| {
            let fraction = done as f64 / total.max(1) as f64;
            job.advance(PROGRESS_PREPROCESSED + (PROGRESS_INFERRED - PROGRESS_PREPROCESSED) * fraction);
            match store.save_unless_terminal(job) {
                Ok(None) => {}
                Ok(Some(_)) => {
                    stopped_by = Some(PipelineError::Cancelled(String::new()));
                    return ControlFlow::Break(());
                }
                Err(e) => warn!(job_id = %job.id, "Failed to persist progress: {}", e),
            }
            match interrupts.check() {
                Ok(()) => ControlFlow::Continue(()),
                Err(reason) => {
                    stopped_by = Some(reason);
                    ControlFlow::Break(())
                }
            }
        };
        let logits = self
            .engine
            .predict(
                model.predictor.as_ref(),
                &preprocessed.tensor,
                &model.config,
                &options,
                Some(&mut on_progress),
            )
            .map_err(|e| match (e, stopped_by.take()) {
                (PipelineError::Cancelled(_), Some(reason)) => reason,
                (e, _) => e,
            })?;
        timer.observe_stage("inference");
        self.checkpoint(job, PROGRESS_INFERRED)?;
        interrupts.check()?;

        // Postprocessing
        let timer = Timer::new();
        let output = self.postprocessor.process(
            job.id,
            &logits,
            &preprocessed.metadata,
            output_format,
            &model.config,
            Some(volume.view()),
        )?;
        timer.observe_stage("postprocess");
        self.checkpoint(job, PROGRESS_POSTPROCESSED)?;

        let (probability, pathology) = pathology_verdict(&output.metrics);
        info!(
            job_id = %job.id,
            probability,
            pathology,
            foreground = output.metrics.total_foreground_voxels,
            "Segmentation finished"
        );

        let record = SegmentationResultRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            output_format,
            segmentation_key: output.segmentation_key.clone(),
            source_key: output.source_key,
            metrics: output.metrics.clone(),
            created_at: Utc::now(),
        };
        interrupts.check()?;
        self.store.save_result(&record)?;

        job.result_reference = Some(output.segmentation_key);
        job.metrics = Some(output.metrics);
        if !self.persist_terminal(job, JobStatus::Completed)? {
            return Err(PipelineError::Cancelled(String::new()));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ClassStats;

    #[test]
    fn test_pathology_verdict() {
        let mut metrics = SegmentationMetrics::default();
        assert_eq!(pathology_verdict(&metrics), (0.0, 0));
        metrics.detected_classes.insert(
            "tumor".into(),
            ClassStats {
                class_id: 1,
                voxel_count: 12,
                volume_mm3: 12.0,
            },
        );
        assert_eq!(pathology_verdict(&metrics), (1.0, 1));
    }

    #[test]
    fn test_registry_signals_only_registered_jobs() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.signal(id));
        let flag = registry.register(id);
        assert!(registry.is_running(id));
        assert!(registry.signal(id));
        assert!(flag.load(Ordering::SeqCst));
        registry.unregister(id);
        assert!(!registry.is_running(id));
    }
}
