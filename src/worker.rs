//! Queue consumer: polls the job store and runs pending jobs one at a time.

use crate::error::PipelineError;
use crate::orchestrator::JobOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Worker {
    orchestrator: Arc<JobOrchestrator>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(orchestrator: Arc<JobOrchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            poll_interval,
        }
    }

    /// Runs every job that is pending right now, oldest first, and returns
    /// how many were attempted.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let orchestrator = self.orchestrator.clone();
        let pending = tokio::task::spawn_blocking(move || orchestrator.store().pending_jobs()).await??;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!("{} pending job(s)", pending.len());

        let mut attempted = 0;
        for job in pending {
            let orchestrator = self.orchestrator.clone();
            let job_id = job.id;
            attempted += 1;
            // The pipeline is blocking end to end; keep it off the async workers.
            match tokio::task::spawn_blocking(move || orchestrator.run(job_id)).await {
                Ok(Ok(record)) => info!(job_id = %job_id, result = %record.segmentation_key, "Job finished"),
                Ok(Err(PipelineError::Cancelled(_))) => info!(job_id = %job_id, "Job cancelled"),
                Ok(Err(e)) => warn!(job_id = %job_id, kind = e.kind(), "Job failed: {}", e),
                Err(join_err) => error!(job_id = %job_id, "Job task panicked: {}", join_err),
            }
        }
        Ok(attempted)
    }

    /// Polls until `shutdown` flips to `true`. A job already running when the
    /// signal arrives is allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker started, polling every {:?}", self.poll_interval);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                error!("Polling for jobs failed: {}", e);
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Worker stopped");
    }
}
