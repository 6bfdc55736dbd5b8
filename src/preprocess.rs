//! Raw volume → network-ready tensor.
//!
//! Order: crop to the nonzero box, normalize intensities at native
//! resolution, resample to the model's spacing, add batch/channel axes. The
//! returned [`GeometryMetadata`] is all postprocessing needs to undo it.

use crate::error::{PipelineError, Result};
use crate::model_config::{ForegroundStats, ModelConfig, NormalizationScheme};
use crate::resample::resample_cubic;
use crate::volume::{BoundingBox, Geometry, GeometryMetadata};
use ndarray::{Array3, Array5, ArrayView3, Axis};
use tracing::{info, warn};

const STD_EPSILON: f64 = 1e-8;

/// A `(1, 1, Z, Y, X)` tensor plus the transforms that produced it.
#[derive(Debug, Clone)]
pub struct PreprocessedVolume {
    pub tensor: Array5<f32>,
    pub metadata: GeometryMetadata,
}

#[derive(Debug, Default, Clone)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(
        &self,
        volume: &Array3<f32>,
        geometry: &Geometry,
        config: &ModelConfig,
    ) -> Result<PreprocessedVolume> {
        let (d, h, w) = volume.dim();
        if d == 0 || h == 0 || w == 0 {
            return Err(PipelineError::Validation(format!(
                "Cannot preprocess empty volume with shape {:?}",
                volume.dim()
            )));
        }
        if geometry.spacing.iter().any(|&s| !(s > 0.0)) {
            return Err(PipelineError::Validation(format!(
                "Invalid voxel spacing {:?}",
                geometry.spacing
            )));
        }
        let original_shape = [d, h, w];

        let bbox = match BoundingBox::of_nonzero(volume.view()) {
            Some(bbox) => bbox,
            None => {
                warn!("No nonzero voxels found, skipping crop");
                BoundingBox::full(original_shape)
            }
        };
        let cropped = bbox.crop(volume.view());
        let cropped_shape = bbox.shape();
        info!("Cropped to nonzero: {:?} -> {:?}", original_shape, cropped_shape);

        let normalized = normalize(
            cropped.view(),
            &config.normalization_scheme,
            config.foreground_stats.as_ref(),
        );

        let resampled = resample_cubic(normalized.view(), geometry.spacing, config.spacing);
        let (rd, rh, rw) = resampled.dim();
        info!(
            "Resampled: {:?} -> {:?}, spacing {:?} -> {:?}",
            cropped_shape,
            [rd, rh, rw],
            geometry.spacing,
            config.spacing
        );

        let tensor = resampled.insert_axis(Axis(0)).insert_axis(Axis(0));

        Ok(PreprocessedVolume {
            tensor,
            metadata: GeometryMetadata {
                original_shape,
                original: geometry.clone(),
                bbox,
                target_spacing: config.spacing,
                cropped_shape,
                resampled_shape: [rd, rh, rw],
            },
        })
    }
}

fn mean_std<'a>(values: impl Iterator<Item = &'a f32>) -> Option<(f64, f64)> {
    let mut count = 0usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in values {
        let v = v as f64;
        count += 1;
        sum += v;
        sum_sq += v * v;
    }
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    let var = (sum_sq / count as f64 - mean * mean).max(0.0);
    Some((mean, var.sqrt()))
}

/// Linear-interpolated percentile, `p` in [0, 100].
pub fn percentile(values: ArrayView3<f32>, p: f64) -> f64 {
    let mut sorted: Vec<f32> = values.iter().copied().collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
}

fn z_score(volume: ArrayView3<f32>, mean: f64, std: f64) -> Array3<f32> {
    let denom = std + STD_EPSILON;
    volume.mapv(|v| ((v as f64 - mean) / denom) as f32)
}

/// Applies `scheme` to a cropped volume.
pub fn normalize(
    volume: ArrayView3<f32>,
    scheme: &NormalizationScheme,
    stats: Option<&ForegroundStats>,
) -> Array3<f32> {
    match scheme {
        NormalizationScheme::Ct => {
            let lower = stats
                .and_then(|s| s.percentile_00_5)
                .unwrap_or_else(|| percentile(volume, 0.5));
            let upper = stats
                .and_then(|s| s.percentile_99_5)
                .unwrap_or_else(|| percentile(volume, 99.5));
            let (lower, upper) = if lower <= upper { (lower, upper) } else { (upper, lower) };

            let clipped = volume.mapv(|v| (v as f64).clamp(lower, upper) as f32);
            let (mean, std) = mean_std(clipped.iter()).unwrap_or((0.0, 0.0));
            info!(
                "CT normalization: percentiles=({:.1}, {:.1}), mean={:.1}, std={:.1}",
                lower, upper, mean, std
            );
            z_score(clipped.view(), mean, std)
        }
        NormalizationScheme::ZScore => {
            let (mean, std) = mean_std(volume.iter()).unwrap_or((0.0, 0.0));
            info!("ZScore normalization: mean={:.1}, std={:.1}", mean, std);
            z_score(volume, mean, std)
        }
        NormalizationScheme::Other(name) => {
            warn!("Unknown normalization scheme: {}, using foreground-based", name);
            let (overall_mean, _) = mean_std(volume.iter()).unwrap_or((0.0, 0.0));
            match mean_std(volume.iter().filter(|&&v| v as f64 > overall_mean)) {
                Some((mean, std)) => {
                    info!("Foreground normalization: mean={:.1}, std={:.1}", mean, std);
                    z_score(volume, mean, std)
                }
                None => {
                    warn!("No voxels above the volume mean, leaving intensities unchanged");
                    volume.to_owned()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_of(a: &Array3<f32>) -> (f64, f64) {
        mean_std(a.iter()).unwrap()
    }

    #[test]
    fn test_zscore_normalization() {
        let v = Array3::from_shape_fn((4, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32);
        let out = normalize(v.view(), &NormalizationScheme::ZScore, None);
        let (mean, std) = stats_of(&out);
        assert!(mean.abs() < 1e-5);
        assert!((std - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_volume_does_not_divide_by_zero() {
        let v = Array3::<f32>::from_elem((3, 3, 3), 42.0);
        for scheme in [
            NormalizationScheme::Ct,
            NormalizationScheme::ZScore,
            NormalizationScheme::Other("MRI".into()),
        ] {
            let out = normalize(v.view(), &scheme, None);
            assert!(out.iter().all(|x| x.is_finite()), "{:?}", scheme);
        }
    }

    #[test]
    fn test_ct_normalization_uses_model_percentiles() {
        let v = Array3::from_shape_fn((2, 2, 4), |(z, y, x)| -1000.0 + 300.0 * (z * 8 + y * 4 + x) as f32);
        let stats = ForegroundStats {
            percentile_00_5: Some(-100.0),
            percentile_99_5: Some(200.0),
            mean: None,
            std: None,
        };
        let out = normalize(v.view(), &NormalizationScheme::Ct, Some(&stats));
        // Everything below -100 collapses onto the same normalized value.
        assert_eq!(out[[0, 0, 0]], out[[0, 0, 1]]);
        assert_eq!(out[[1, 1, 3]], out[[1, 1, 2]]);
        let (mean, _) = stats_of(&out);
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = Array3::from_shape_fn((1, 1, 5), |(_, _, x)| x as f32 * 10.0);
        assert_eq!(percentile(v.view(), 0.0), 0.0);
        assert_eq!(percentile(v.view(), 50.0), 20.0);
        assert!((percentile(v.view(), 99.5) - 39.8).abs() < 1e-9);
    }

    #[test]
    fn test_process_records_geometry() {
        let mut volume = Array3::<f32>::zeros((10, 12, 14));
        for z in 2..8 {
            for y in 3..9 {
                for x in 4..12 {
                    volume[[z, y, x]] = (z + y + x) as f32;
                }
            }
        }
        let geometry = Geometry {
            spacing: [2.0, 1.0, 1.0],
            ..Geometry::default()
        };
        let config = ModelConfig {
            spacing: [1.0, 1.0, 2.0],
            normalization_scheme: NormalizationScheme::ZScore,
            ..ModelConfig::default()
        };
        let out = Preprocessor::new().process(&volume, &geometry, &config).unwrap();
        assert_eq!(out.metadata.original_shape, [10, 12, 14]);
        assert_eq!(out.metadata.bbox.as_tuple(), (2, 8, 3, 9, 4, 12));
        assert_eq!(out.metadata.cropped_shape, [6, 6, 8]);
        assert_eq!(out.metadata.resampled_shape, [12, 6, 4]);
        assert_eq!(out.tensor.shape(), &[1, 1, 12, 6, 4]);
        assert_eq!(out.metadata.target_spacing, [1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_all_zero_volume_keeps_full_extent() {
        let volume = Array3::<f32>::zeros((4, 5, 6));
        let out = Preprocessor::new()
            .process(&volume, &Geometry::default(), &ModelConfig::default())
            .unwrap();
        assert_eq!(out.metadata.bbox, BoundingBox::full([4, 5, 6]));
        assert_eq!(out.metadata.cropped_shape, [4, 5, 6]);
    }
}
