//! Volume retrieval for a study/series reference.

use crate::error::{PipelineError, Result};
use crate::nifti;
use crate::volume::Geometry;
use ndarray::Array3;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Supplies a reconstructed 3-D volume plus its geometry.
pub trait ImageSource: Send + Sync {
    fn load(&self, study_reference: &str, series_reference: Option<&str>) -> Result<(Array3<f32>, Geometry)>;
}

/// Reads `<root>/<study>/<series>.nii[.gz]`, or `<root>/<study>/volume.nii[.gz]`
/// when no series is given.
pub struct NiftiImageSource {
    root: PathBuf,
}

impl NiftiImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn segment(value: &str, what: &str) -> Result<()> {
        let mut components = Path::new(value).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(()),
            _ => Err(PipelineError::Validation(format!("Invalid {} reference: {:?}", what, value))),
        }
    }

    fn locate(&self, study: &str, series: Option<&str>) -> Result<PathBuf> {
        let stem = series.unwrap_or("volume");
        let dir = self.root.join(study);
        for ext in ["nii.gz", "nii"] {
            let candidate = dir.join(format!("{}.{}", stem, ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(PipelineError::NotFound(format!(
            "No volume found for study {} series {}",
            study,
            series.unwrap_or("<none>")
        )))
    }
}

impl ImageSource for NiftiImageSource {
    fn load(&self, study_reference: &str, series_reference: Option<&str>) -> Result<(Array3<f32>, Geometry)> {
        if study_reference.trim().is_empty() {
            return Err(PipelineError::Validation("Missing study reference".into()));
        }
        Self::segment(study_reference, "study")?;
        if let Some(series) = series_reference {
            Self::segment(series, "series")?;
        }

        let path = self.locate(study_reference, series_reference)?;
        let (volume, geometry) = nifti::read_file(&path)?;
        info!(
            "Loaded volume {:?} from {:?}, spacing {:?}",
            volume.dim(),
            path,
            geometry.spacing
        );
        Ok((volume, geometry))
    }
}
