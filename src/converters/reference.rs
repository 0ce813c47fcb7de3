//! Placing a label volume on the grid of a reference DICOM series.

use ndarray::Array3;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::interpolator::Interpolator;
use crate::volume::{Volume, invert3};

/// Nearest-neighbour resampling of `labels` onto the voxel grid of
/// `reference`, matching voxels by physical position. Reference voxels
/// outside the label grid are 0.
pub(crate) fn resample_onto(labels: &Volume, reference: &Volume) -> Result<Array3<f32>> {
    let Some(inverse) = invert3(&labels.direction) else {
        if labels.dim() == reference.dim() {
            return Ok(labels.data.clone());
        }
        return Err(Error::ShapeMismatch {
            expected: reference.dim(),
            found: labels.dim(),
        });
    };
    let spacing = [
        labels.spacing.0 as f64,
        labels.spacing.1 as f64,
        labels.spacing.2 as f64,
    ];

    let (depth, height, width) = reference.dim();
    let values: Vec<f32> = (0..depth * height * width)
        .into_par_iter()
        .map(|flat| {
            let z = flat / (height * width);
            let y = (flat / width) % height;
            let x = flat % width;
            let point = reference.index_to_physical([x as f64, y as f64, z as f64]);
            let offset = [
                point[0] - labels.origin[0],
                point[1] - labels.origin[1],
                point[2] - labels.origin[2],
            ];
            let mut index = [0.0; 3];
            for (axis, value) in index.iter_mut().enumerate() {
                let along: f64 = (0..3).map(|col| inverse[axis][col] * offset[col]).sum();
                *value = along / spacing[axis];
            }
            Interpolator::nearest(&labels.data, index).unwrap_or(0.0)
        })
        .collect();

    debug!(
        reference = ?reference.dim(),
        labels = ?labels.dim(),
        "resampled labels onto reference grid"
    );
    Ok(Array3::from_shape_vec((depth, height, width), values)?)
}
