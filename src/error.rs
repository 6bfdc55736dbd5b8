use thiserror::Error;

/// Errors raised by any pipeline stage.
///
/// The orchestrator catches these once, records `to_string()` as the job's
/// `error_message`, and hands the error back to the caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Inference failed: {0}")]
    InferenceRuntime(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("Job {0} was cancelled")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable tag used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::InferenceRuntime(_) => "inference_runtime",
            PipelineError::NotImplemented(_) => "not_implemented",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Storage(_) => "storage",
            PipelineError::Codec(_) => "codec",
            PipelineError::Io(_) => "io",
            PipelineError::Json(_) => "json",
        }
    }
}

impl From<sled::Error> for PipelineError {
    fn from(err: sled::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<ort::Error> for PipelineError {
    fn from(err: ort::Error) -> Self {
        PipelineError::InferenceRuntime(err.to_string())
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        PipelineError::InferenceRuntime(format!("tensor shape mismatch: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_passed_through() {
        let err = PipelineError::Validation("Unsupported output format: png".to_string());
        assert_eq!(err.to_string(), "Unsupported output format: png");
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("gone"));
    }
}
