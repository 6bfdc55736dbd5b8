//! Process-wide cache of loaded models.
//!
//! Entries are keyed by `(weights_path, config_path)` and live for the life of
//! the worker; there is no eviction. Concurrent first loads of the same key are
//! coalesced so a model is only ever read from disk once.
//!
//! Relative descriptor paths resolve against the models root when one is set.

use crate::config::RuntimeConfig;
use crate::error::{PipelineError, Result};
use crate::inference::PatchPredictor;
use crate::metrics::{cache_hit_rate, CACHE_HITS, CACHE_MISSES, CACHE_SIZE};
use crate::model_config::{parse_model_config, ModelConfig};
use moka::sync::Cache;
use ndarray::{Array5, ArrayView5, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Builds a predictor from a weights file.
pub trait SessionFactory: Send + Sync {
    fn create(&self, weights_path: &Path) -> Result<Arc<dyn PatchPredictor>>;
}

/// A cached model: its inference session and parsed configuration.
#[derive(Clone)]
pub struct LoadedModel {
    pub predictor: Arc<dyn PatchPredictor>,
    pub config: Arc<ModelConfig>,
}

type CacheKey = (PathBuf, PathBuf);

pub struct ModelCache {
    factory: Arc<dyn SessionFactory>,
    entries: Cache<CacheKey, LoadedModel>,
    models_root: Option<PathBuf>,
}

impl ModelCache {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            entries: Cache::builder().build(),
            models_root: None,
        }
    }

    pub fn with_models_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.models_root = Some(root.into());
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.models_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Returns the cached model for these paths, loading it on first use.
    ///
    /// `family_hint` is the descriptor's model-family tag, used when the
    /// config file itself does not name one.
    pub fn load(&self, weights_path: &Path, config_path: &Path, family_hint: Option<&str>) -> Result<LoadedModel> {
        let key = (self.resolve(weights_path), self.resolve(config_path));
        let mut loaded_now = false;

        let model = self
            .entries
            .try_get_with(key.clone(), || {
                loaded_now = true;
                self.load_uncached(&key.0, &key.1, family_hint)
            })
            .map_err(rehydrate)?;

        if loaded_now {
            CACHE_MISSES.inc();
            CACHE_SIZE.inc();
        } else {
            CACHE_HITS.inc();
            info!("Using cached model {:?}", key.0);
        }
        debug!("Model cache hit rate {:.1}%", cache_hit_rate());
        Ok(model)
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_uncached(&self, weights_path: &Path, config_path: &Path, family_hint: Option<&str>) -> Result<LoadedModel> {
        if !weights_path.exists() {
            return Err(PipelineError::NotFound(format!(
                "Model file not found: {}",
                weights_path.display()
            )));
        }
        if !config_path.exists() {
            return Err(PipelineError::NotFound(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        info!("Loading model config from {:?}", config_path);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let config = parse_model_config(&raw, family_hint);

        info!("Loading ONNX model from {:?}", weights_path);
        let predictor = self.factory.create(weights_path)?;
        info!(
            "Model loaded: patch {:?}, spacing {:?}, {} classes",
            config.patch_size, config.spacing, config.num_classes
        );

        Ok(LoadedModel {
            predictor,
            config: Arc::new(config),
        })
    }
}

/// Cache init errors come back shared; rebuild an owned error of the same kind.
fn rehydrate(err: Arc<PipelineError>) -> PipelineError {
    match Arc::try_unwrap(err) {
        Ok(owned) => owned,
        Err(shared) => match &*shared {
            PipelineError::Validation(m) => PipelineError::Validation(m.clone()),
            PipelineError::NotFound(m) => PipelineError::NotFound(m.clone()),
            PipelineError::InferenceRuntime(m) => PipelineError::InferenceRuntime(m.clone()),
            PipelineError::NotImplemented(m) => PipelineError::NotImplemented(m.clone()),
            PipelineError::Cancelled(m) => PipelineError::Cancelled(m.clone()),
            PipelineError::Storage(m) => PipelineError::Storage(m.clone()),
            PipelineError::Codec(m) => PipelineError::Codec(m.clone()),
            PipelineError::Io(e) => PipelineError::Io(std::io::Error::new(e.kind(), e.to_string())),
            PipelineError::Json(e) => PipelineError::Codec(e.to_string()),
        },
    }
}

// ============================================================================
// ONNX Runtime
// ============================================================================

/// Creates ONNX Runtime sessions with the configured execution providers.
pub struct OrtSessionFactory {
    runtime: RuntimeConfig,
}

impl OrtSessionFactory {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }

    fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut providers = Vec::new();
        for name in &self.runtime.providers {
            match name.as_str() {
                "CUDAExecutionProvider" => providers.push(
                    CUDAExecutionProvider::default()
                        .with_device_id(self.runtime.gpu_device_id)
                        .with_memory_limit(self.runtime.gpu_memory_limit)
                        .build(),
                ),
                "CPUExecutionProvider" => providers.push(CPUExecutionProvider::default().build()),
                other => warn!("Unknown execution provider {}, skipping", other),
            }
        }
        providers
    }
}

impl SessionFactory for OrtSessionFactory {
    fn create(&self, weights_path: &Path) -> Result<Arc<dyn PatchPredictor>> {
        let providers = self.execution_providers();
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_memory_pattern(true))
            .and_then(|b| b.with_execution_providers(providers))
            .and_then(|b| b.commit_from_file(weights_path))
            .map_err(|e| {
                PipelineError::InferenceRuntime(format!(
                    "failed to create ONNX session for {}: {}",
                    weights_path.display(),
                    e
                ))
            })?;
        Ok(Arc::new(OrtSegmenter::new(session)?))
    }
}

/// A single-input, single-output segmentation network.
pub struct OrtSegmenter {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OrtSegmenter {
    pub fn new(session: Session) -> Result<Self> {
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| PipelineError::InferenceRuntime("model declares no inputs".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| PipelineError::InferenceRuntime("model declares no outputs".into()))?;
        info!("ONNX session ready: input '{}' -> output '{}'", input_name, output_name);
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl PatchPredictor for OrtSegmenter {
    fn predict_patch(&self, patch: ArrayView5<f32>) -> Result<Array5<f32>> {
        let contiguous = patch.as_standard_layout();
        let input = TensorRef::from_array_view(contiguous.view())?;
        let inputs = ort::inputs![self.input_name.as_str() => input];

        let mut session_guard = self
            .session
            .lock()
            .map_err(|_| PipelineError::InferenceRuntime("session lock poisoned".into()))?;
        let outputs = session_guard.run(inputs)?;
        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() != 5 {
            return Err(PipelineError::InferenceRuntime(format!(
                "expected 5-D logits, model returned shape {:?}",
                dims
            )));
        }
        let logits = ndarray::Array::from_shape_vec(IxDyn(&dims), data.to_vec())?;
        Ok(logits.into_dimensionality()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ZeroModel;

    impl PatchPredictor for ZeroModel {
        fn predict_patch(&self, patch: ArrayView5<f32>) -> Result<Array5<f32>> {
            let s = patch.shape();
            Ok(Array5::zeros((1, 2, s[2], s[3], s[4])))
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl SessionFactory for CountingFactory {
        fn create(&self, _weights_path: &Path) -> Result<Arc<dyn PatchPredictor>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ZeroModel))
        }
    }

    fn write_model(dir: &Path) -> (PathBuf, PathBuf) {
        let weights = dir.join("model.onnx");
        let config = dir.join("config.json");
        std::fs::write(&weights, b"onnx").unwrap();
        std::fs::write(
            &config,
            r#"{"model_parameters": {"patch_size": [32, 48, 48]}, "dataset_parameters": {"num_classes": 3}}"#,
        )
        .unwrap();
        (weights, config)
    }

    #[test]
    fn test_second_load_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (weights, config) = write_model(dir.path());
        let factory = Arc::new(CountingFactory::default());
        let cache = ModelCache::new(factory.clone());

        let first = cache.load(&weights, &config, Some("nnunet")).unwrap();
        std::fs::remove_file(&config).unwrap();
        let second = cache.load(&weights, &config, Some("nnunet")).unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.config, &second.config));
        assert_eq!(second.config.patch_size, [32, 48, 48]);
        assert_eq!(second.config.num_classes, 3);
    }

    #[test]
    fn test_missing_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (weights, config) = write_model(dir.path());
        let cache = ModelCache::new(Arc::new(CountingFactory::default()));

        let err = cache.load(&dir.path().join("absent.onnx"), &config, None).err().unwrap();
        assert!(matches!(err, PipelineError::NotFound(_)), "{:?}", err);
        let err = cache.load(&weights, &dir.path().join("absent.json"), None).err().unwrap();
        assert!(matches!(err, PipelineError::NotFound(_)), "{:?}", err);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_relative_paths_resolve_against_models_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("liver")).unwrap();
        let (weights, config) = write_model(&dir.path().join("liver"));
        let factory = Arc::new(CountingFactory::default());
        let cache = ModelCache::new(factory.clone()).with_models_root(dir.path());

        let model = cache
            .load(Path::new("liver/model.onnx"), Path::new("liver/config.json"), None)
            .unwrap();
        assert_eq!(model.config.num_classes, 3);

        // Same files by absolute path: one entry.
        cache.load(&weights, &config, None).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let unrooted = ModelCache::new(Arc::new(CountingFactory::default()));
        let err = unrooted
            .load(Path::new("liver/model.onnx"), Path::new("liver/config.json"), None)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::NotFound(_)), "{:?}", err);
    }

    #[test]
    fn test_concurrent_first_loads_create_once() {
        let dir = tempfile::tempdir().unwrap();
        let (weights, config) = write_model(dir.path());
        let factory = Arc::new(CountingFactory::default());
        let cache = Arc::new(ModelCache::new(factory.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let (w, c) = (weights.clone(), config.clone());
                std::thread::spawn(move || cache.load(&w, &c, None).map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }
}
