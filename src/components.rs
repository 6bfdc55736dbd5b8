//! 26-connected component labelling on binary 3-D masks.

use ndarray::{Array3, ArrayView3};

/// Labels every connected foreground region of `mask`.
///
/// Returns the label volume (0 = background, components numbered from 1) and
/// the voxel count of each component, indexed by `label - 1`.
pub fn label_components(mask: ArrayView3<bool>) -> (Array3<u32>, Vec<usize>) {
    let (d, h, w) = mask.dim();
    let mut labels = Array3::<u32>::zeros((d, h, w));
    let mut sizes = Vec::new();
    let mut stack: Vec<[usize; 3]> = Vec::new();

    for ((z, y, x), &fg) in mask.indexed_iter() {
        if !fg || labels[[z, y, x]] != 0 {
            continue;
        }
        let label = sizes.len() as u32 + 1;
        let mut size = 0usize;
        labels[[z, y, x]] = label;
        stack.push([z, y, x]);

        while let Some([cz, cy, cx]) = stack.pop() {
            size += 1;
            for nz in cz.saturating_sub(1)..=(cz + 1).min(d - 1) {
                for ny in cy.saturating_sub(1)..=(cy + 1).min(h - 1) {
                    for nx in cx.saturating_sub(1)..=(cx + 1).min(w - 1) {
                        if mask[[nz, ny, nx]] && labels[[nz, ny, nx]] == 0 {
                            labels[[nz, ny, nx]] = label;
                            stack.push([nz, ny, nx]);
                        }
                    }
                }
            }
        }
        sizes.push(size);
    }

    (labels, sizes)
}

/// Keeps only the largest 26-connected component of `mask`.
///
/// Ties go to the component found first in raster order. An empty mask is
/// returned unchanged.
pub fn keep_largest_component(mask: ArrayView3<bool>) -> Array3<bool> {
    let (labels, sizes) = label_components(mask);
    if sizes.len() <= 1 {
        return mask.to_owned();
    }
    let mut largest = 0;
    for (i, &size) in sizes.iter().enumerate() {
        if size > sizes[largest] {
            largest = i;
        }
    }
    let keep = largest as u32 + 1;
    labels.mapv(|l| l == keep)
}
