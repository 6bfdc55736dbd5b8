pub mod components;
pub mod config;
pub mod error;
pub mod image_source;
pub mod inference;
pub mod job;
pub mod metrics;
pub mod model_cache;
pub mod model_config;
pub mod nifti;
pub mod orchestrator;
pub mod postprocess;
pub mod preprocess;
pub mod resample;
pub mod storage;
pub mod volume;
pub mod worker;

// Re-export commonly used types for easier testing
pub use crate::config::{InferenceDefaults, RuntimeConfig, Settings, WorkerConfig};
pub use crate::error::{PipelineError, Result};
pub use crate::image_source::{ImageSource, NiftiImageSource};
pub use crate::inference::{InferenceEngine, InferenceOptions, PatchPredictor};
pub use crate::job::{
    ClassStats, Job, JobParameters, JobRequest, JobStatus, JobStatusView, ModelDescriptor, OutputFormat,
    SegmentationMetrics, SegmentationResultRecord,
};
pub use crate::model_cache::{LoadedModel, ModelCache, OrtSessionFactory, SessionFactory};
pub use crate::model_config::{ConfigParser, ModelConfig, NormalizationScheme};
pub use crate::orchestrator::{pathology_verdict, CancellationRegistry, JobOrchestrator};
pub use crate::postprocess::Postprocessor;
pub use crate::preprocess::{PreprocessedVolume, Preprocessor};
pub use crate::storage::{FsObjectStore, JobStore, MemoryJobStore, MemoryObjectStore, ObjectStore, SledJobStore};
pub use crate::volume::{BoundingBox, Geometry, GeometryMetadata};
pub use crate::worker::Worker;
