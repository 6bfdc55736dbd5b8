//! Sliding-window inference.
//!
//! A volume larger than the model's input is covered with overlapping
//! patch-sized windows. Each window's logits are weighted by an importance map
//! and accumulated; the final logits are the weighted average per voxel.

use crate::error::{PipelineError, Result};
use crate::metrics::{Timer, PATCH_LATENCY, WINDOWS_PROCESSED};
use crate::model_config::ModelConfig;
use ndarray::{s, Array3, Array4, Array5, ArrayView5, Axis};
use std::ops::ControlFlow;
use tracing::{debug, info, warn};

const WEIGHT_EPSILON: f32 = 1e-8;
const MIN_IMPORTANCE: f32 = 0.1;

/// Default number of windows between progress reports.
pub const DEFAULT_REPORT_INTERVAL: usize = 10;

/// Anything that maps a `(1, 1, pz, py, px)` patch to `(1, C, pz, py, px)` logits.
///
/// Implemented by the ONNX session wrapper in [`crate::model_cache`] and by
/// test doubles.
pub trait PatchPredictor: Send + Sync {
    fn predict_patch(&self, patch: ArrayView5<f32>) -> Result<Array5<f32>>;
}

/// Per-job knobs for [`InferenceEngine::predict`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceOptions {
    pub step_size: f64,
    pub use_gaussian: bool,
    pub use_tta: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            step_size: 0.5,
            use_gaussian: true,
            use_tta: false,
        }
    }
}

/// Called with `(windows_done, windows_total)`. Returning `Break` aborts the
/// loop with [`PipelineError::Cancelled`].
pub type ProgressCallback<'a> = dyn FnMut(usize, usize) -> ControlFlow<()> + 'a;

/// One patch placement, as voxel offsets into the (padded) volume.
pub type WindowOrigin = [usize; 3];

#[derive(Debug, Clone)]
pub struct InferenceEngine {
    report_interval: usize,
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}

impl InferenceEngine {
    pub fn new(report_interval: usize) -> Self {
        Self {
            report_interval: report_interval.max(1),
        }
    }

    /// Runs sliding-window inference over a `(1, 1, Z, Y, X)` tensor and
    /// returns `(1, C, Z, Y, X)` logits.
    pub fn predict(
        &self,
        model: &dyn PatchPredictor,
        tensor: &Array5<f32>,
        config: &ModelConfig,
        options: &InferenceOptions,
        mut progress: Option<&mut ProgressCallback<'_>>,
    ) -> Result<Array5<f32>> {
        let shape = tensor.shape();
        if shape[0] != 1 || shape[1] != 1 {
            return Err(PipelineError::Validation(format!(
                "Expected a (1, 1, Z, Y, X) tensor, got {:?}",
                shape
            )));
        }
        if !(options.step_size > 0.0 && options.step_size <= 1.0) {
            return Err(PipelineError::Validation(format!(
                "step_size must be in (0, 1], got {}",
                options.step_size
            )));
        }
        let patch = config.patch_size;
        if patch.iter().any(|&p| p == 0) {
            return Err(PipelineError::Validation(format!("Invalid patch size {:?}", patch)));
        }

        let volume = tensor.index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned();
        let original_shape = [volume.dim().0, volume.dim().1, volume.dim().2];
        let padding = edge_padding(original_shape, patch);
        let volume = if padding.iter().any(|&(before, after)| before + after > 0) {
            info!("Padding volume {:?} to patch size {:?}: {:?}", original_shape, patch, padding);
            pad_edge(&volume, padding)
        } else {
            volume
        };
        let padded_shape = [volume.dim().0, volume.dim().1, volume.dim().2];

        let windows = sliding_windows(padded_shape, patch, options.step_size);
        let total = windows.len();
        info!(
            "Sliding window inference: {} windows, patch {:?}, step {}, gaussian={}, tta={}",
            total, patch, options.step_size, options.use_gaussian, options.use_tta
        );

        let importance = if options.use_gaussian {
            gaussian_importance_map(patch)
        } else {
            Array3::<f32>::ones((patch[0], patch[1], patch[2]))
        };

        let mut logits: Option<Array4<f32>> = None;
        let mut weights = Array3::<f32>::zeros((padded_shape[0], padded_shape[1], padded_shape[2]));

        for (done, &[z, y, x]) in windows.iter().enumerate() {
            let region = s![z..z + patch[0], y..y + patch[1], x..x + patch[2]];
            let input = volume
                .slice(region)
                .to_owned()
                .insert_axis(Axis(0))
                .insert_axis(Axis(0));

            let timer = Timer::new();
            let prediction = if options.use_tta {
                predict_with_mirroring(model, &input)?
            } else {
                run_patch(model, &input)?
            };
            timer.observe_duration_seconds(&PATCH_LATENCY);
            WINDOWS_PROCESSED.inc();

            let patch_logits = prediction.index_axis(Axis(0), 0);
            let accumulator = logits.get_or_insert_with(|| {
                let classes = patch_logits.dim().0;
                if classes != config.num_classes {
                    warn!(
                        "Model emits {} channels but config declares {} classes",
                        classes, config.num_classes
                    );
                }
                Array4::<f32>::zeros((classes, padded_shape[0], padded_shape[1], padded_shape[2]))
            });
            if patch_logits.dim().0 != accumulator.dim().0 {
                return Err(PipelineError::InferenceRuntime(format!(
                    "channel count changed between windows: {} vs {}",
                    patch_logits.dim().0,
                    accumulator.dim().0
                )));
            }

            for (mut acc_channel, channel) in accumulator
                .axis_iter_mut(Axis(0))
                .zip(patch_logits.axis_iter(Axis(0)))
            {
                let mut target = acc_channel.slice_mut(region);
                ndarray::Zip::from(&mut target)
                    .and(&channel)
                    .and(&importance)
                    .for_each(|acc, &value, &w| *acc += value * w);
            }
            weights.slice_mut(region).zip_mut_with(&importance, |acc, &w| *acc += w);

            let done = done + 1;
            if done % self.report_interval == 0 || done == total {
                debug!("Processed {}/{} windows", done, total);
                if let Some(callback) = progress.as_deref_mut() {
                    if callback(done, total).is_break() {
                        info!("Sliding window loop stopped at {}/{} windows", done, total);
                        return Err(PipelineError::Cancelled(String::new()));
                    }
                }
            }
        }

        let mut logits = logits.ok_or_else(|| PipelineError::InferenceRuntime("no windows generated".into()))?;
        for mut channel in logits.axis_iter_mut(Axis(0)) {
            channel.zip_mut_with(&weights, |v, &w| *v /= w + WEIGHT_EPSILON);
        }

        let trimmed = logits
            .slice(s![
                ..,
                padding[0].0..padding[0].0 + original_shape[0],
                padding[1].0..padding[1].0 + original_shape[1],
                padding[2].0..padding[2].0 + original_shape[2]
            ])
            .to_owned();
        Ok(trimmed.insert_axis(Axis(0)))
    }
}

fn run_patch(model: &dyn PatchPredictor, input: &Array5<f32>) -> Result<Array5<f32>> {
    let output = model.predict_patch(input.view())?;
    let (ish, osh) = (input.shape(), output.shape());
    if osh[0] != 1 || osh[2..] != ish[2..] {
        return Err(PipelineError::InferenceRuntime(format!(
            "model returned shape {:?} for input {:?}",
            osh, ish
        )));
    }
    Ok(output)
}

/// Averages the prediction on the patch and on its three single-axis mirrors.
fn predict_with_mirroring(model: &dyn PatchPredictor, input: &Array5<f32>) -> Result<Array5<f32>> {
    let mut sum = run_patch(model, input)?;
    for axis in 2..5 {
        let mut mirrored = input.clone();
        mirrored.invert_axis(Axis(axis));
        let mut prediction = run_patch(model, &mirrored)?;
        prediction.invert_axis(Axis(axis));
        if prediction.shape() != sum.shape() {
            return Err(PipelineError::InferenceRuntime(
                "mirrored prediction changed channel count".into(),
            ));
        }
        sum += &prediction;
    }
    sum.mapv_inplace(|v| v / 4.0);
    Ok(sum)
}

/// `(before, after)` edge padding per axis so each axis reaches at least the
/// patch size.
pub fn edge_padding(shape: [usize; 3], patch: [usize; 3]) -> [(usize, usize); 3] {
    let mut padding = [(0, 0); 3];
    for axis in 0..3 {
        if shape[axis] < patch[axis] {
            let total = patch[axis] - shape[axis];
            padding[axis] = (total / 2, total - total / 2);
        }
    }
    padding
}

/// Edge-replicating pad.
fn pad_edge(volume: &Array3<f32>, padding: [(usize, usize); 3]) -> Array3<f32> {
    let (d, h, w) = volume.dim();
    let out = (
        d + padding[0].0 + padding[0].1,
        h + padding[1].0 + padding[1].1,
        w + padding[2].0 + padding[2].1,
    );
    let clamp = |i: usize, before: usize, n: usize| i.saturating_sub(before).min(n - 1);
    Array3::from_shape_fn(out, |(z, y, x)| {
        volume[[
            clamp(z, padding[0].0, d),
            clamp(y, padding[1].0, h),
            clamp(x, padding[2].0, w),
        ]]
    })
}

/// Window start offsets along one axis, with a far-edge window appended when
/// the regular stride does not land on it.
pub fn axis_positions(dim: usize, patch: usize, step_size: f64) -> Vec<usize> {
    let stride = ((patch as f64 * step_size).floor() as usize).max(1);
    let span = dim.saturating_sub(patch) + 1;
    let mut positions: Vec<usize> = (0..span.max(1)).step_by(stride).collect();
    if dim > patch && (dim - patch) % stride != 0 {
        positions.push(dim - patch);
    }
    positions
}

/// All window origins over a volume at least as large as `patch`.
///
/// The far-edge window of each axis is combined with every position of the
/// other two axes, edge positions included, so corners are covered too.
pub fn sliding_windows(shape: [usize; 3], patch: [usize; 3], step_size: f64) -> Vec<WindowOrigin> {
    let zs = axis_positions(shape[0], patch[0], step_size);
    let ys = axis_positions(shape[1], patch[1], step_size);
    let xs = axis_positions(shape[2], patch[2], step_size);
    let mut windows = Vec::with_capacity(zs.len() * ys.len() * xs.len());
    for &z in &zs {
        for &y in &ys {
            for &x in &xs {
                windows.push([z, y, x]);
            }
        }
    }
    windows
}

fn gaussian_1d(length: usize) -> Vec<f64> {
    let sigma = length as f64 / 8.0;
    let center = (length as f64 - 1.0) / 2.0;
    (0..length)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect()
}

/// Separable Gaussian weights rescaled to `[0.1, 1.0]`.
pub fn gaussian_importance_map(patch: [usize; 3]) -> Array3<f32> {
    let gz = gaussian_1d(patch[0]);
    let gy = gaussian_1d(patch[1]);
    let gx = gaussian_1d(patch[2]);
    let raw = Array3::from_shape_fn((patch[0], patch[1], patch[2]), |(z, y, x)| gz[z] * gy[y] * gx[x]);

    let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max - min <= f64::EPSILON {
        return Array3::ones(raw.dim());
    }
    let scale = 1.0 - MIN_IMPORTANCE as f64;
    raw.mapv(|v| (((v - min) / (max - min)) * scale + MIN_IMPORTANCE as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits two channels: the input and its negation.
    struct EchoModel {
        calls: AtomicUsize,
    }

    impl EchoModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PatchPredictor for EchoModel {
        fn predict_patch(&self, patch: ArrayView5<f32>) -> Result<Array5<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let inner = patch.index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned();
            let neg = inner.mapv(|v| -v);
            let stacked = ndarray::stack(Axis(0), &[inner.view(), neg.view()])?;
            Ok(stacked.insert_axis(Axis(0)))
        }
    }

    fn config_with_patch(patch: [usize; 3]) -> ModelConfig {
        ModelConfig {
            patch_size: patch,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_window_count_for_exact_fit() {
        let windows = sliding_windows([64, 64, 64], [32, 32, 32], 0.5);
        assert_eq!(windows.len(), 27);
        assert_eq!(axis_positions(64, 32, 0.5), vec![0, 16, 32]);
    }

    #[test]
    fn test_edge_window_added_on_remainder_axis() {
        assert_eq!(axis_positions(70, 32, 0.5), vec![0, 16, 32, 38]);
        let windows = sliding_windows([70, 64, 64], [32, 32, 32], 0.5);
        assert_eq!(windows.len(), 36);
        assert_eq!(windows.iter().filter(|w| w[0] == 38).count(), 9);
    }

    #[test]
    fn test_stride_never_zero() {
        assert_eq!(axis_positions(5, 1, 0.5), vec![0, 1, 2, 3, 4]);
        assert_eq!(axis_positions(4, 4, 0.5), vec![0]);
    }

    #[test]
    fn test_every_voxel_gets_weight() {
        let shape = [37, 45, 50];
        let patch = [16, 20, 24];
        let map = gaussian_importance_map(patch);
        let mut weights = Array3::<f32>::zeros((shape[0], shape[1], shape[2]));
        for [z, y, x] in sliding_windows(shape, patch, 0.5) {
            weights
                .slice_mut(s![z..z + patch[0], y..y + patch[1], x..x + patch[2]])
                .zip_mut_with(&map, |a, &w| *a += w);
        }
        assert!(weights.iter().all(|&w| w > 0.0));
    }

    #[test]
    fn test_gaussian_map_range_and_symmetry() {
        let map = gaussian_importance_map([9, 12, 16]);
        let max = map.iter().copied().fold(f32::MIN, f32::max);
        let min = map.iter().copied().fold(f32::MAX, f32::min);
        assert!((max - 1.0).abs() < 1e-5);
        assert!((min - 0.1).abs() < 1e-5);
        assert!(map.iter().all(|&v| (0.1 - 1e-6..=1.0 + 1e-6).contains(&v)));

        for x in 0..16 {
            assert!((map[[4, 6, x]] - map[[4, 6, 15 - x]]).abs() < 1e-6);
        }
        // Non-increasing from the centre outwards along z.
        for z in 4..8 {
            assert!(map[[z, 6, 8]] >= map[[z + 1, 6, 8]]);
        }
    }

    #[test]
    fn test_predict_reproduces_identity_model() {
        let tensor = Array5::from_shape_fn((1, 1, 40, 33, 35), |(_, _, z, y, x)| (z * 3 + y + 2 * x) as f32 * 0.01);
        let model = EchoModel::new();
        let out = InferenceEngine::default()
            .predict(&model, &tensor, &config_with_patch([16, 16, 16]), &InferenceOptions::default(), None)
            .unwrap();
        assert_eq!(out.shape(), &[1, 2, 40, 33, 35]);
        for ((_, c, z, y, x), &v) in out.indexed_iter() {
            let expected = tensor[[0, 0, z, y, x]] * if c == 0 { 1.0 } else { -1.0 };
            assert!((v - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_small_volume_is_padded_and_trimmed() {
        let tensor = Array5::from_shape_fn((1, 1, 5, 20, 7), |(_, _, z, y, x)| (z + y + x) as f32);
        let model = EchoModel::new();
        let out = InferenceEngine::default()
            .predict(&model, &tensor, &config_with_patch([8, 16, 16]), &InferenceOptions::default(), None)
            .unwrap();
        assert_eq!(out.shape(), &[1, 2, 5, 20, 7]);
        assert!((out[[0, 0, 4, 19, 6]] - 29.0).abs() < 1e-3);
    }

    #[test]
    fn test_edge_padding_splits_remainder() {
        assert_eq!(edge_padding([5, 20, 7], [8, 16, 16]), [(1, 2), (0, 0), (4, 5)]);
        let v = Array3::from_shape_fn((2, 1, 1), |(z, _, _)| z as f32 + 1.0);
        let padded = pad_edge(&v, [(1, 2), (0, 0), (0, 0)]);
        assert_eq!(padded.iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_tta_runs_four_passes_per_window() {
        let tensor = Array5::<f32>::from_elem((1, 1, 8, 8, 8), 1.0);
        let model = EchoModel::new();
        let options = InferenceOptions {
            use_tta: true,
            ..InferenceOptions::default()
        };
        let out = InferenceEngine::default()
            .predict(&model, &tensor, &config_with_patch([8, 8, 8]), &options, None)
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
        assert!(out.iter().all(|&v| (v.abs() - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_progress_reported_every_interval() {
        let tensor = Array5::<f32>::zeros((1, 1, 64, 64, 64));
        let model = EchoModel::new();
        let mut seen = Vec::new();
        let mut callback = |done: usize, total: usize| {
            seen.push((done, total));
            ControlFlow::Continue(())
        };
        InferenceEngine::default()
            .predict(
                &model,
                &tensor,
                &config_with_patch([32, 32, 32]),
                &InferenceOptions::default(),
                Some(&mut callback),
            )
            .unwrap();
        assert_eq!(seen, vec![(10, 27), (20, 27), (27, 27)]);
    }

    #[test]
    fn test_break_aborts_loop() {
        let tensor = Array5::<f32>::zeros((1, 1, 64, 64, 64));
        let model = EchoModel::new();
        let mut callback = |_: usize, _: usize| ControlFlow::Break(());
        let result = InferenceEngine::new(5).predict(
            &model,
            &tensor,
            &config_with_patch([32, 32, 32]),
            &InferenceOptions::default(),
            Some(&mut callback),
        );
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        assert_eq!(model.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_rejects_multichannel_input() {
        let tensor = Array5::<f32>::zeros((1, 2, 8, 8, 8));
        let result = InferenceEngine::default().predict(
            &EchoModel::new(),
            &tensor,
            &config_with_patch([8, 8, 8]),
            &InferenceOptions::default(),
            None,
        );
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}
