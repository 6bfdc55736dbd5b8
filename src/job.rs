//! Job, model and result records.
//!
//! Only the orchestrator mutates a [`Job`]; everything here is plain data plus
//! the transition rules of the job state machine.

use crate::config::InferenceDefaults;
use crate::error::{PipelineError, Result};
use crate::inference::InferenceOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// `pending → running → {completed | failed | cancelled}`; a pending job
    /// may also fail or be cancelled before it starts.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Nifti,
    DicomSeg,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "nifti" => Ok(OutputFormat::Nifti),
            "dicom-seg" => Ok(OutputFormat::DicomSeg),
            other => Err(PipelineError::Validation(format!(
                "Unsupported output format: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Nifti => "nifti",
            OutputFormat::DicomSeg => "dicom-seg",
        }
    }
}

fn default_output_format() -> String {
    "nifti".to_string()
}

/// Submitted job parameters. Unset inference knobs fall back to the worker's
/// configured defaults; the output format stays a raw string until the job
/// runs so that an unsupported value fails the job instead of the decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    #[serde(default)]
    pub step_size: Option<f64>,
    #[serde(default)]
    pub use_gaussian: Option<bool>,
    #[serde(default)]
    pub use_tta: Option<bool>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            step_size: None,
            use_gaussian: None,
            use_tta: None,
            output_format: default_output_format(),
        }
    }
}

impl JobParameters {
    pub fn validate(&self) -> Result<()> {
        if let Some(step) = self.step_size {
            if !(step > 0.0 && step <= 1.0) {
                return Err(PipelineError::Validation(format!(
                    "step_size must be in (0, 1], got {}",
                    step
                )));
            }
        }
        OutputFormat::parse(&self.output_format)?;
        Ok(())
    }

    pub fn output_format(&self) -> Result<OutputFormat> {
        OutputFormat::parse(&self.output_format)
    }

    pub fn inference_options(&self, defaults: &InferenceDefaults) -> InferenceOptions {
        InferenceOptions {
            step_size: self.step_size.unwrap_or(defaults.step_size),
            use_gaussian: self.use_gaussian.unwrap_or(defaults.use_gaussian),
            use_tta: self.use_tta.unwrap_or(defaults.use_tta),
        }
    }
}

/// Submission payload handed over by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    pub study_reference: String,
    #[serde(default)]
    pub series_reference: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub parameters: JobParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub study_reference: String,
    pub series_reference: Option<String>,
    pub model_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub parameters: JobParameters,
    pub result_reference: Option<String>,
    pub metrics: Option<SegmentationMetrics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            study_reference: request.study_reference,
            series_reference: request.series_reference,
            model_id: request.model_id,
            status: JobStatus::Pending,
            progress: 0.0,
            error_message: None,
            parameters: request.parameters,
            result_reference: None,
            metrics: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves to `next`, stamping `started_at`/`completed_at`.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::Validation(format!(
                "Job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Raises progress to `value`. Lower values are ignored.
    pub fn advance(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            status: self.status,
            progress: self.progress,
            error_message: self.error_message.clone(),
            result_reference: self.result_reference.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// What callers polling a job get to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SegmentationMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    /// Model family tag, e.g. `nnunet`.
    pub model_type: String,
    pub weights_path: PathBuf,
    pub config_path: PathBuf,
    pub modality: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ModelDescriptor {
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(PipelineError::Validation(format!("Model {} is not active", self.name)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    pub class_id: u8,
    pub voxel_count: u64,
    /// Currently equal to `voxel_count`; spacing is not applied yet.
    pub volume_mm3: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    pub detected_classes: BTreeMap<String, ClassStats>,
    pub total_foreground_voxels: u64,
    pub output_shape: [usize; 3],
    pub unique_class_ids: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResultRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub output_format: OutputFormat,
    pub segmentation_key: String,
    pub source_key: Option<String>,
    pub metrics: SegmentationMetrics,
    pub created_at: DateTime<Utc>,
}
