//! Volume geometry and bounding-box crop/uncrop.
//!
//! Arrays are indexed `(Z, Y, X)` and spacing follows the same axis order.
//! Origin and direction stay in the scanner's physical frame (LPS, x/y/z,
//! direction row-major) exactly as the image source reported them.

use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Voxel spacing in mm, (Z, Y, X).
    pub spacing: [f64; 3],
    /// Physical position of voxel (0, 0, 0), (x, y, z).
    pub origin: [f64; 3],
    /// Direction cosines, row-major 3x3 in (x, y, z).
    pub direction: [f64; 9],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0, 1.0, 1.0],
            origin: [0.0, 0.0, 0.0],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Half-open voxel box `[min, max)` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub z_min: usize,
    pub z_max: usize,
    pub y_min: usize,
    pub y_max: usize,
    pub x_min: usize,
    pub x_max: usize,
}

impl BoundingBox {
    pub fn full(shape: [usize; 3]) -> Self {
        Self {
            z_min: 0,
            z_max: shape[0],
            y_min: 0,
            y_max: shape[1],
            x_min: 0,
            x_max: shape[2],
        }
    }

    /// Tight box around every nonzero voxel, or `None` for an all-zero volume.
    ///
    /// Background is assumed to be exactly zero; scanners that store air as
    /// a negative value are never cropped.
    pub fn of_nonzero(volume: ArrayView3<f32>) -> Option<Self> {
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut found = false;
        for ((z, y, x), &v) in volume.indexed_iter() {
            if v != 0.0 {
                found = true;
                for (axis, idx) in [z, y, x].into_iter().enumerate() {
                    lo[axis] = lo[axis].min(idx);
                    hi[axis] = hi[axis].max(idx + 1);
                }
            }
        }
        found.then(|| Self {
            z_min: lo[0],
            z_max: hi[0],
            y_min: lo[1],
            y_max: hi[1],
            x_min: lo[2],
            x_max: hi[2],
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [
            self.z_max - self.z_min,
            self.y_max - self.y_min,
            self.x_max - self.x_min,
        ]
    }

    pub fn as_tuple(&self) -> (usize, usize, usize, usize, usize, usize) {
        (self.z_min, self.z_max, self.y_min, self.y_max, self.x_min, self.x_max)
    }

    pub fn crop<T: Clone>(&self, volume: ArrayView3<T>) -> Array3<T> {
        volume
            .slice(s![self.z_min..self.z_max, self.y_min..self.y_max, self.x_min..self.x_max])
            .to_owned()
    }

    /// Places `cropped` at this box's offset inside a zero-filled volume of
    /// `full_shape`.
    pub fn uncrop<T: Clone + Default>(&self, cropped: ArrayView3<T>, full_shape: [usize; 3]) -> Array3<T> {
        let mut restored = Array3::<T>::default(full_shape);
        restored
            .slice_mut(s![self.z_min..self.z_max, self.y_min..self.y_max, self.x_min..self.x_max])
            .assign(&cropped);
        restored
    }
}

/// Everything needed to map a prediction back onto the source volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryMetadata {
    pub original_shape: [usize; 3],
    pub original: Geometry,
    pub bbox: BoundingBox,
    pub target_spacing: [f64; 3],
    pub cropped_shape: [usize; 3],
    pub resampled_shape: [usize; 3],
}
