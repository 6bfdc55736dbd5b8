//! Spacing changes for intensity and label volumes.
//!
//! Both resamplers keep voxel (0, 0, 0) fixed in physical space: output voxel
//! `i` along an axis samples the input at continuous index
//! `i * out_spacing / in_spacing`. Samples further than half a voxel past the
//! last input voxel are outside the buffer and read as 0.

use ndarray::{Array3, ArrayView3, Axis, Zip};

/// Per-axis output size for a spacing change: `round(n * from / to)`, at least 1.
pub fn output_shape(shape: [usize; 3], from: [f64; 3], to: [f64; 3]) -> [usize; 3] {
    let mut out = [0usize; 3];
    for axis in 0..3 {
        let scaled = (shape[axis] as f64 * from[axis] / to[axis]).round();
        out[axis] = (scaled as usize).max(1);
    }
    out
}

fn same_spacing(from: [f64; 3], to: [f64; 3]) -> bool {
    from.iter().zip(to.iter()).all(|(a, b)| (a - b).abs() < 1e-9)
}

/// Resamples an intensity volume with cubic B-spline interpolation.
pub fn resample_cubic(volume: ArrayView3<f32>, from: [f64; 3], to: [f64; 3]) -> Array3<f32> {
    let shape = [volume.dim().0, volume.dim().1, volume.dim().2];
    let out_shape = output_shape(shape, from, to);
    if out_shape == shape && same_spacing(from, to) {
        return volume.to_owned();
    }

    let mut current = volume.to_owned();
    for axis in 0..3 {
        let step = to[axis] / from[axis];
        current = resample_axis_cubic(current.view(), axis, out_shape[axis], step);
    }
    current
}

fn resample_axis_cubic(input: ArrayView3<f32>, axis: usize, out_len: usize, step: f64) -> Array3<f32> {
    let mut dim = [input.dim().0, input.dim().1, input.dim().2];
    let in_len = dim[axis];
    dim[axis] = out_len;
    let mut output = Array3::<f32>::zeros(dim);

    let mut coeffs = vec![0.0f64; in_len];
    Zip::from(output.lanes_mut(Axis(axis)))
        .and(input.lanes(Axis(axis)))
        .for_each(|mut out_lane, in_lane| {
            for (c, &v) in coeffs.iter_mut().zip(in_lane.iter()) {
                *c = v as f64;
            }
            bspline_prefilter(&mut coeffs);
            for (i, out) in out_lane.iter_mut().enumerate() {
                *out = bspline_eval(&coeffs, i as f64 * step) as f32;
            }
        });
    output
}

const POLE: f64 = -0.267_949_192_431_122_7; // sqrt(3) - 2
const TOLERANCE: f64 = 1e-10;

fn mirror_index(k: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let k = k.rem_euclid(period);
    if k >= n as isize {
        (period - k) as usize
    } else {
        k as usize
    }
}

/// Converts samples into cubic B-spline coefficients in place (mirror boundary).
fn bspline_prefilter(c: &mut [f64]) {
    let n = c.len();
    if n < 2 {
        return;
    }
    let z = POLE;
    let lambda = (1.0 - z) * (1.0 - 1.0 / z);
    for v in c.iter_mut() {
        *v *= lambda;
    }

    c[0] = causal_init(c, z);
    for k in 1..n {
        c[k] += z * c[k - 1];
    }
    c[n - 1] = (z / (z * z - 1.0)) * (z * c[n - 2] + c[n - 1]);
    for k in (0..n - 1).rev() {
        c[k] = z * (c[k + 1] - c[k]);
    }
}

fn causal_init(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    let horizon = (TOLERANCE.ln() / z.abs().ln()).ceil() as usize;
    if horizon < n {
        let mut zn = z;
        let mut sum = c[0];
        for &v in &c[1..horizon] {
            sum += zn * v;
            zn *= z;
        }
        sum
    } else {
        let iz = 1.0 / z;
        let mut zn = z;
        let mut z2n = z.powi(n as i32 - 1);
        let mut sum = c[0] + z2n * c[n - 1];
        z2n *= z2n * iz;
        for &v in &c[1..n - 1] {
            sum += (zn + z2n) * v;
            zn *= z;
            z2n *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}

fn bspline_eval(c: &[f64], x: f64) -> f64 {
    let n = c.len();
    if x < -0.5 || x > n as f64 - 0.5 {
        return 0.0;
    }
    if n == 1 {
        return c[0];
    }
    let base = x.floor();
    let t = x - base;
    let t2 = t * t;
    let t3 = t2 * t;
    let weights = [
        (1.0 - t).powi(3) / 6.0,
        (3.0 * t3 - 6.0 * t2 + 4.0) / 6.0,
        (-3.0 * t3 + 3.0 * t2 + 3.0 * t + 1.0) / 6.0,
        t3 / 6.0,
    ];
    let first = base as isize - 1;
    weights
        .iter()
        .enumerate()
        .map(|(k, w)| w * c[mirror_index(first + k as isize, n)])
        .sum()
}

/// Resamples a label volume onto `out_shape` with nearest-neighbour lookup.
/// Label values are never blended.
pub fn resample_nearest_to_shape(
    labels: ArrayView3<u8>,
    from: [f64; 3],
    to: [f64; 3],
    out_shape: [usize; 3],
) -> Array3<u8> {
    let in_shape = [labels.dim().0, labels.dim().1, labels.dim().2];
    if in_shape == out_shape && same_spacing(from, to) {
        return labels.to_owned();
    }

    // Source index per output index, None when outside the input buffer.
    let lookup: Vec<Vec<Option<usize>>> = (0..3)
        .map(|axis| {
            let step = to[axis] / from[axis];
            (0..out_shape[axis])
                .map(|i| {
                    let x = i as f64 * step;
                    let nearest = (x + 0.5).floor();
                    (nearest >= 0.0 && (nearest as usize) < in_shape[axis]).then(|| nearest as usize)
                })
                .collect()
        })
        .collect();

    Array3::from_shape_fn(out_shape, |(z, y, x)| {
        match (lookup[0][z], lookup[1][y], lookup[2][x]) {
            (Some(sz), Some(sy), Some(sx)) => labels[[sz, sy, sx]],
            _ => 0,
        }
    })
}
