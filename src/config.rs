use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub models_path: PathBuf,
    pub data_dir: PathBuf,
    pub object_store_path: PathBuf,
    pub image_root: PathBuf,
    pub metrics_addr: String,
    pub runtime: RuntimeConfig,
    pub inference: InferenceDefaults,
    pub worker: WorkerConfig,
}

/// ONNX Runtime session options shared by every cached model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub providers: Vec<String>, // priority order, first available wins
    pub gpu_device_id: i32,
    pub gpu_memory_limit: usize,
}

/// Parameter values used when a job leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceDefaults {
    pub step_size: f64,
    pub use_gaussian: bool,
    pub use_tta: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub cancel_check_interval: usize, // in sliding windows
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                "CUDAExecutionProvider".to_string(),
                "CPUExecutionProvider".to_string(),
            ],
            gpu_device_id: 0,
            gpu_memory_limit: 8 * 1024 * 1024 * 1024, // 8GB
        }
    }
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self {
            step_size: 0.5,
            use_gaussian: true,
            use_tta: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            job_timeout: Duration::from_secs(3600),
            cancel_check_interval: 10,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparsable {}={:?}, using default", name, raw);
            default
        }),
        _ => default,
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let object_store_path = env::var("OBJECT_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("objects"));

        let image_root = env::var("IMAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("studies"));

        let providers: Vec<String> = env::var("ONNX_PROVIDERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| RuntimeConfig::default().providers);

        if providers.is_empty() {
            return Err(anyhow::anyhow!("ONNX_PROVIDERS must name at least one execution provider"));
        }

        let defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            providers,
            gpu_device_id: env_or("GPU_DEVICE_ID", defaults.gpu_device_id),
            gpu_memory_limit: env_or("GPU_MEMORY_LIMIT", defaults.gpu_memory_limit),
        };

        let step_size: f64 = env_or("SLIDING_WINDOW_OVERLAP", 0.5);
        if !(step_size > 0.0 && step_size <= 1.0) {
            return Err(anyhow::anyhow!(
                "SLIDING_WINDOW_OVERLAP must be in (0, 1], got {}",
                step_size
            ));
        }

        let inference = InferenceDefaults {
            step_size,
            use_gaussian: env_or("USE_GAUSSIAN_WEIGHTING", true),
            use_tta: env_or("USE_TEST_TIME_AUGMENTATION", false),
        };

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 1000u64)),
            job_timeout: Duration::from_secs(env_or("INFERENCE_TIMEOUT", 3600u64)),
            cancel_check_interval: env_or("CANCEL_CHECK_INTERVAL", 10usize).max(1),
        };

        Ok(Self {
            models_path: PathBuf::from(
                env::var("MODELS_PATH").unwrap_or_else(|_| "/models".to_string()),
            ),
            data_dir,
            object_store_path,
            image_root,
            metrics_addr: env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9100".to_string()),
            runtime,
            inference,
            worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_without_environment() {
        for name in ["SLIDING_WINDOW_OVERLAP", "ONNX_PROVIDERS", "CANCEL_CHECK_INTERVAL"] {
            env::remove_var(name);
        }
        let settings = Settings::load().unwrap();
        assert_eq!(settings.inference.step_size, 0.5);
        assert!(settings.inference.use_gaussian);
        assert!(!settings.inference.use_tta);
        assert_eq!(settings.runtime.providers[0], "CUDAExecutionProvider");
        assert_eq!(settings.worker.cancel_check_interval, 10);
    }

    #[test]
    #[serial]
    fn test_rejects_out_of_range_overlap() {
        env::set_var("SLIDING_WINDOW_OVERLAP", "1.5");
        let result = Settings::load();
        env::remove_var("SLIDING_WINDOW_OVERLAP");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_provider_list_parsing() {
        env::set_var("ONNX_PROVIDERS", "CPUExecutionProvider, ");
        let settings = Settings::load().unwrap();
        env::remove_var("ONNX_PROVIDERS");
        assert_eq!(settings.runtime.providers, vec!["CPUExecutionProvider".to_string()]);
    }
}
