//! Storage Module
//!
//! Record persistence for jobs, models and results, plus blob storage for
//! pipeline artifacts.
//!
//! ## Components
//! - **JobStore**: last-write-wins record store. `SledJobStore` keeps one tree
//!   per record kind with JSON values.
//! - **ObjectStore**: addressable blobs. `FsObjectStore` maps keys to files
//!   under a root directory.
//! - In-memory variants backed by `dashmap` for tests and embedding.

use crate::error::{PipelineError, Result};
use crate::job::{Job, JobStatus, ModelDescriptor, SegmentationResultRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

pub trait JobStore: Send + Sync {
    fn load_job(&self, id: Uuid) -> Result<Job>;
    fn save_job(&self, job: &Job) -> Result<()>;
    /// Saves `job` unless the stored record already reached a terminal
    /// status. A refused write returns the stored record.
    fn save_unless_terminal(&self, job: &Job) -> Result<Option<Job>>;
    fn load_model(&self, id: &str) -> Result<ModelDescriptor>;
    fn save_model(&self, model: &ModelDescriptor) -> Result<()>;
    fn save_result(&self, result: &SegmentationResultRecord) -> Result<()>;
    fn load_result(&self, job_id: Uuid) -> Result<SegmentationResultRecord>;
    /// Pending jobs, oldest first.
    fn pending_jobs(&self) -> Result<Vec<Job>>;
}

pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Stores `bytes` under `key` and returns the key it was stored at.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

fn oldest_first(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    jobs
}

// ============================================================================
// Sled
// ============================================================================

#[derive(Clone)]
pub struct SledJobStore {
    db: sled::Db,
    jobs: sled::Tree,
    models: sled::Tree,
    results: sled::Tree,
}

impl SledJobStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(64 * 1024 * 1024)
            .flush_every_ms(Some(1000))
            .use_compression(true)
            .open()?;
        Self::from_db(db)
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let store = Self {
            jobs: db.open_tree("jobs")?,
            models: db.open_tree("models")?,
            results: db.open_tree("results")?,
            db,
        };
        tracing::info!(
            "Job store opened: {} jobs, {} models, {} results",
            store.jobs.len(),
            store.models.len(),
            store.results.len()
        );
        Ok(store)
    }

    /// Forces buffered writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8], what: &str, id: &str) -> Result<T> {
        match tree.get(key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(PipelineError::NotFound(format!("{} {} not found", what, id))),
        }
    }

    fn put<T: Serialize>(tree: &sled::Tree, key: &[u8], value: &T) -> Result<()> {
        tree.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }
}

impl JobStore for SledJobStore {
    fn load_job(&self, id: Uuid) -> Result<Job> {
        Self::get(&self.jobs, id.as_bytes(), "Job", &id.to_string())
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        Self::put(&self.jobs, job.id.as_bytes(), job)?;
        // Terminal states must survive a crash right after they are written.
        if job.status.is_terminal() {
            self.jobs.flush()?;
        }
        Ok(())
    }

    fn save_unless_terminal(&self, job: &Job) -> Result<Option<Job>> {
        let key = job.id.as_bytes();
        let encoded = serde_json::to_vec(job)?;
        loop {
            let current = self.jobs.get(key)?;
            if let Some(bytes) = &current {
                let stored: Job = serde_json::from_slice(bytes)?;
                if stored.status.is_terminal() {
                    return Ok(Some(stored));
                }
            }
            // Another writer got in between; look again.
            if self.jobs.compare_and_swap(key, current, Some(encoded.clone()))?.is_ok() {
                break;
            }
        }
        if job.status.is_terminal() {
            self.jobs.flush()?;
        }
        Ok(None)
    }

    fn load_model(&self, id: &str) -> Result<ModelDescriptor> {
        Self::get(&self.models, id.as_bytes(), "Model", id)
    }

    fn save_model(&self, model: &ModelDescriptor) -> Result<()> {
        Self::put(&self.models, model.id.as_bytes(), model)
    }

    fn save_result(&self, result: &SegmentationResultRecord) -> Result<()> {
        Self::put(&self.results, result.job_id.as_bytes(), result)?;
        self.results.flush()?;
        Ok(())
    }

    fn load_result(&self, job_id: Uuid) -> Result<SegmentationResultRecord> {
        Self::get(&self.results, job_id.as_bytes(), "Result for job", &job_id.to_string())
    }

    fn pending_jobs(&self) -> Result<Vec<Job>> {
        let mut pending = Vec::new();
        for item in self.jobs.iter() {
            let (_, bytes) = item?;
            let job: Job = serde_json::from_slice(&bytes)?;
            if job.status == JobStatus::Pending {
                pending.push(job);
            }
        }
        Ok(oldest_first(pending))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<Uuid, Job>,
    models: DashMap<String, ModelDescriptor>,
    results: DashMap<Uuid, SegmentationResultRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn load_job(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("Job {} not found", id)))
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn save_unless_terminal(&self, job: &Job) -> Result<Option<Job>> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(entry) if entry.get().status.is_terminal() => Ok(Some(entry.get().clone())),
            Entry::Occupied(mut entry) => {
                entry.insert(job.clone());
                Ok(None)
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
                Ok(None)
            }
        }
    }

    fn load_model(&self, id: &str) -> Result<ModelDescriptor> {
        self.models
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("Model {} not found", id)))
    }

    fn save_model(&self, model: &ModelDescriptor) -> Result<()> {
        self.models.insert(model.id.clone(), model.clone());
        Ok(())
    }

    fn save_result(&self, result: &SegmentationResultRecord) -> Result<()> {
        self.results.insert(result.job_id, result.clone());
        Ok(())
    }

    fn load_result(&self, job_id: Uuid) -> Result<SegmentationResultRecord> {
        self.results
            .get(&job_id)
            .map(|r| r.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("Result for job {} not found", job_id)))
    }

    fn pending_jobs(&self) -> Result<Vec<Job>> {
        let pending = self
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(oldest_first(pending))
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("Object {} not found", key)))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!("Object store rooted at {:?}", root);
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PipelineError::Validation(format!("Invalid object key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::NotFound(format!("Object {} not found", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Readers never see a partial artifact.
        let tmp = path.with_extension("partial");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!("Stored {} bytes at {}", bytes.len(), key);
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        for key in ["../escape", "a/../../b", "/etc/passwd", ""] {
            assert!(
                matches!(store.put(key, b"x"), Err(PipelineError::Validation(_))),
                "{}",
                key
            );
        }
    }

    #[test]
    fn test_fs_store_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let key = store.put("inference_results/j1/j1.nii.gz", b"payload").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"payload");
        assert!(matches!(store.get("missing"), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_missing_records() {
        let store = MemoryJobStore::new();
        assert!(matches!(store.load_job(Uuid::new_v4()), Err(PipelineError::NotFound(_))));
        assert!(matches!(store.load_model("nope"), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_keeps_terminal_jobs() {
        let store = MemoryJobStore::new();
        let mut job = Job::from_request(crate::job::JobRequest {
            user_id: None,
            study_reference: "s1".into(),
            series_reference: None,
            model_id: "m1".into(),
            parameters: Default::default(),
        });
        assert_eq!(store.save_unless_terminal(&job).unwrap(), None);

        job.transition(JobStatus::Running).unwrap();
        assert_eq!(store.save_unless_terminal(&job).unwrap(), None);

        let mut cancelled = job.clone();
        cancelled.transition(JobStatus::Cancelled).unwrap();
        store.save_job(&cancelled).unwrap();

        job.advance(0.5);
        let stored = store.save_unless_terminal(&job).unwrap();
        assert_eq!(stored.map(|j| j.status), Some(JobStatus::Cancelled));
        assert_eq!(store.load_job(job.id).unwrap(), cancelled);
    }
}
