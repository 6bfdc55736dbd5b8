//! Logits → label volume in the source geometry, plus metrics and artifacts.

use crate::components::keep_largest_component;
use crate::error::{PipelineError, Result};
use crate::job::{ClassStats, OutputFormat, SegmentationMetrics};
use crate::model_config::ModelConfig;
use crate::nifti;
use crate::resample::resample_nearest_to_shape;
use crate::storage::ObjectStore;
use crate::volume::GeometryMetadata;
use ndarray::{Array3, Array5, ArrayView3, Axis, Zip};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Object-store prefix every artifact of a job is written under.
pub fn result_prefix(job_id: Uuid) -> String {
    format!("inference_results/{}", job_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostprocessOutput {
    pub segmentation_key: String,
    pub source_key: Option<String>,
    pub metrics: SegmentationMetrics,
}

pub struct Postprocessor {
    store: Arc<dyn ObjectStore>,
}

impl Postprocessor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Turns `(1, C, Z, Y, X)` logits into persisted artifacts.
    ///
    /// `source` is the volume as originally loaded; when given it is written
    /// next to the segmentation with identical geometry.
    pub fn process(
        &self,
        job_id: Uuid,
        logits: &Array5<f32>,
        metadata: &GeometryMetadata,
        output_format: OutputFormat,
        config: &ModelConfig,
        source: Option<ArrayView3<f32>>,
    ) -> Result<PostprocessOutput> {
        let labels = argmax_labels(logits)?;
        let restored = restore_labels(labels.view(), metadata)?;
        let metrics = compute_metrics(restored.view(), config);
        info!(
            "Segmentation metrics: {} foreground voxels, classes {:?}",
            metrics.total_foreground_voxels, metrics.unique_class_ids
        );

        let prefix = result_prefix(job_id);
        match output_format {
            OutputFormat::Nifti => {
                let segmentation = nifti::encode(restored.view(), &metadata.original, "segmentation")?;
                let source_bytes = match source {
                    Some(volume) => {
                        let dim = volume.dim();
                        if [dim.0, dim.1, dim.2] != metadata.original_shape {
                            return Err(PipelineError::Validation(format!(
                                "Source volume {:?} does not match original shape {:?}",
                                dim, metadata.original_shape
                            )));
                        }
                        Some(nifti::encode(volume, &metadata.original, "source")?)
                    }
                    None => None,
                };

                let segmentation_key = self
                    .store
                    .put(&format!("{}/{}.nii.gz", prefix, job_id), &segmentation)?;
                let source_key = match source_bytes {
                    Some(bytes) => Some(self.store.put(&format!("{}/{}_image.nii.gz", prefix, job_id), &bytes)?),
                    None => None,
                };
                info!("Uploaded segmentation to {}", segmentation_key);

                Ok(PostprocessOutput {
                    segmentation_key,
                    source_key,
                    metrics,
                })
            }
            OutputFormat::DicomSeg => Err(PipelineError::NotImplemented(
                "DICOM-SEG export not yet implemented".into(),
            )),
        }
    }
}

/// Per-voxel arg-max over the class axis. Ties go to the lower class id.
pub fn argmax_labels(logits: &Array5<f32>) -> Result<Array3<u8>> {
    let shape = logits.shape();
    if shape[0] != 1 || shape[1] == 0 {
        return Err(PipelineError::InferenceRuntime(format!(
            "Expected (1, C, Z, Y, X) logits, got {:?}",
            shape
        )));
    }
    if shape[1] > u8::MAX as usize + 1 {
        return Err(PipelineError::InferenceRuntime(format!(
            "{} classes do not fit an 8-bit label volume",
            shape[1]
        )));
    }

    let classes = logits.index_axis(Axis(0), 0);
    let mut best = classes.index_axis(Axis(0), 0).to_owned();
    let mut labels = Array3::<u8>::zeros(best.raw_dim());
    for (c, channel) in classes.axis_iter(Axis(0)).enumerate().skip(1) {
        Zip::from(&mut labels)
            .and(&mut best)
            .and(&channel)
            .for_each(|label, best, &v| {
                if v > *best {
                    *best = v;
                    *label = c as u8;
                }
            });
    }
    Ok(labels)
}

/// Nearest-neighbour back to the native spacing at the cropped size, connected
/// component cleanup, then placement back into the full original volume.
pub fn restore_labels(labels: ArrayView3<u8>, metadata: &GeometryMetadata) -> Result<Array3<u8>> {
    let dim = labels.dim();
    if [dim.0, dim.1, dim.2] != metadata.resampled_shape {
        return Err(PipelineError::InferenceRuntime(format!(
            "Prediction shape {:?} does not match preprocessed shape {:?}",
            dim, metadata.resampled_shape
        )));
    }

    let native = resample_nearest_to_shape(
        labels,
        metadata.target_spacing,
        metadata.original.spacing,
        metadata.cropped_shape,
    );
    info!(
        "Resampled to original spacing: {:?} -> {:?}",
        metadata.resampled_shape, metadata.cropped_shape
    );

    let cleaned = remove_small_components(native);
    let restored = metadata.bbox.uncrop(cleaned.view(), metadata.original_shape);
    info!(
        "Restored original shape: {:?} -> {:?}",
        metadata.cropped_shape, metadata.original_shape
    );
    Ok(restored)
}

/// Keeps the largest foreground component, then the largest component of
/// each class that survived.
pub fn remove_small_components(labels: Array3<u8>) -> Array3<u8> {
    let foreground = labels.mapv(|v| v > 0);
    let kept = keep_largest_component(foreground.view());
    let mut filtered = labels;
    Zip::from(&mut filtered).and(&kept).for_each(|v, &keep| {
        if !keep {
            *v = 0;
        }
    });

    for class_id in present_labels(filtered.view()).into_iter().filter(|&c| c > 0) {
        let mask = filtered.mapv(|v| v == class_id);
        let largest = keep_largest_component(mask.view());
        Zip::from(&mut filtered).and(&largest).for_each(|v, &keep| {
            if *v == class_id && !keep {
                *v = 0;
            }
        });
    }
    filtered
}

fn present_labels(labels: ArrayView3<u8>) -> Vec<u8> {
    let mut seen = [false; 256];
    for &v in labels.iter() {
        seen[v as usize] = true;
    }
    (0..=255u8).filter(|&v| seen[v as usize]).collect()
}

pub fn compute_metrics(labels: ArrayView3<u8>, config: &ModelConfig) -> SegmentationMetrics {
    let mut counts = [0u64; 256];
    for &v in labels.iter() {
        counts[v as usize] += 1;
    }

    let mut detected_classes = BTreeMap::new();
    let mut total_foreground_voxels = 0;
    let mut unique_class_ids = Vec::new();
    for (id, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        unique_class_ids.push(id as u8);
        if id == 0 {
            continue;
        }
        total_foreground_voxels += count;
        detected_classes.insert(
            config.class_name(id as u32),
            ClassStats {
                class_id: id as u8,
                voxel_count: count,
                volume_mm3: count as f64,
            },
        );
    }

    let (d, h, w) = labels.dim();
    SegmentationMetrics {
        detected_classes,
        total_foreground_voxels,
        output_shape: [d, h, w],
        unique_class_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::label_components;
    use crate::storage::MemoryObjectStore;
    use crate::volume::{BoundingBox, Geometry};

    fn metadata(original: [usize; 3], bbox: BoundingBox, spacing: [f64; 3], target: [f64; 3], resampled: [usize; 3]) -> GeometryMetadata {
        GeometryMetadata {
            original_shape: original,
            original: Geometry {
                spacing,
                ..Geometry::default()
            },
            bbox,
            target_spacing: target,
            cropped_shape: bbox.shape(),
            resampled_shape: resampled,
        }
    }

    #[test]
    fn test_argmax_prefers_first_on_ties() {
        let mut logits = Array5::<f32>::zeros((1, 3, 1, 1, 3));
        logits[[0, 1, 0, 0, 1]] = 2.0;
        logits[[0, 2, 0, 0, 2]] = 1.0;
        logits[[0, 1, 0, 0, 2]] = 1.0;
        let labels = argmax_labels(&logits).unwrap();
        assert_eq!(labels.iter().copied().collect::<Vec<_>>(), vec![0, 1, 1]);
    }

    #[test]
    fn test_each_class_left_with_one_component() {
        let mut labels = Array3::<u8>::zeros((10, 10, 10));
        // Main blob with two classes touching.
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    labels[[z, y, x]] = if x < 2 { 1 } else { 2 };
                }
            }
        }
        // Detached foreground island.
        labels[[9, 9, 9]] = 1;
        // Class 2 fragment touching the main blob only through class 1 voxels.
        labels[[0, 0, 0]] = 2;

        let cleaned = remove_small_components(labels);
        assert_eq!(cleaned[[9, 9, 9]], 0);
        assert_eq!(cleaned[[0, 0, 0]], 0);
        for class_id in [1u8, 2] {
            let mask = cleaned.mapv(|v| v == class_id);
            let (_, sizes) = label_components(mask.view());
            assert_eq!(sizes.len(), 1, "class {}", class_id);
        }
    }

    #[test]
    fn test_restore_places_labels_at_bbox() {
        let bbox = BoundingBox {
            z_min: 2,
            z_max: 6,
            y_min: 1,
            y_max: 5,
            x_min: 3,
            x_max: 7,
        };
        let meta = metadata([8, 8, 10], bbox, [2.0, 1.0, 1.0], [1.0, 1.0, 1.0], [8, 4, 4]);
        let labels = Array3::<u8>::from_elem((8, 4, 4), 1);
        let restored = restore_labels(labels.view(), &meta).unwrap();
        assert_eq!(restored.dim(), (8, 8, 10));
        assert_eq!(restored.iter().filter(|&&v| v == 1).count(), 4 * 4 * 4);
        assert_eq!(restored[[2, 1, 3]], 1);
        assert_eq!(restored[[5, 4, 6]], 1);
        assert_eq!(restored[[1, 1, 3]], 0);
    }

    #[test]
    fn test_metrics_use_class_names() {
        let mut config = ModelConfig::default();
        config.class_names.insert(1, "liver".into());
        let mut labels = Array3::<u8>::zeros((2, 2, 2));
        labels[[0, 0, 0]] = 1;
        labels[[0, 0, 1]] = 1;
        labels[[1, 1, 1]] = 3;

        let metrics = compute_metrics(labels.view(), &config);
        assert_eq!(metrics.total_foreground_voxels, 3);
        assert_eq!(metrics.unique_class_ids, vec![0, 1, 3]);
        assert_eq!(metrics.detected_classes["liver"].voxel_count, 2);
        assert_eq!(metrics.detected_classes["class_3"].class_id, 3);
        assert_eq!(metrics.detected_classes["class_3"].volume_mm3, 1.0);
        assert_eq!(metrics.output_shape, [2, 2, 2]);
    }

    #[test]
    fn test_process_uploads_both_artifacts() {
        let store = Arc::new(MemoryObjectStore::new());
        let post = Postprocessor::new(store.clone());
        let job_id = Uuid::new_v4();
        let bbox = BoundingBox::full([4, 4, 4]);
        let meta = metadata([4, 4, 4], bbox, [1.0; 3], [1.0; 3], [4, 4, 4]);
        let mut logits = Array5::<f32>::zeros((1, 2, 4, 4, 4));
        logits[[0, 1, 1, 1, 1]] = 5.0;
        let source = Array3::<f32>::ones((4, 4, 4));

        let out = post
            .process(job_id, &logits, &meta, OutputFormat::Nifti, &ModelConfig::default(), Some(source.view()))
            .unwrap();
        assert_eq!(out.segmentation_key, format!("inference_results/{}/{}.nii.gz", job_id, job_id));
        assert_eq!(store.keys().len(), 2);

        let (seg, _) = nifti::decode(&store.get(&out.segmentation_key).unwrap()).unwrap();
        assert_eq!(seg[[1, 1, 1]], 1.0);
        assert_eq!(out.metrics.total_foreground_voxels, 1);
    }

    #[test]
    fn test_dicom_seg_fails_without_upload() {
        let store = Arc::new(MemoryObjectStore::new());
        let post = Postprocessor::new(store.clone());
        let meta = metadata([2, 2, 2], BoundingBox::full([2, 2, 2]), [1.0; 3], [1.0; 3], [2, 2, 2]);
        let logits = Array5::<f32>::zeros((1, 2, 2, 2, 2));
        let err = post
            .process(Uuid::new_v4(), &logits, &meta, OutputFormat::DicomSeg, &ModelConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotImplemented(_)));
        assert_eq!(err.to_string(), "DICOM-SEG export not yet implemented");
        assert!(store.keys().is_empty());
    }
}
