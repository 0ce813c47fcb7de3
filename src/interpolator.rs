use ndarray::{Array3, ArrayView2};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Output size (depth, height, width) that gives every axis the finest
    /// spacing of the volume.
    pub(crate) fn get_isotropic_dimensions(
        spacing: (f32, f32, f32),
        original_dim: (usize, usize, usize),
    ) -> (u32, u32, u32) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let min_spacing = x_spacing.min(y_spacing).min(z_spacing);
        if !(min_spacing > 0.0) {
            return (
                original_dim.0 as u32,
                original_dim.1 as u32,
                original_dim.2 as u32,
            );
        }
        let inv_min_spacing = 1.0 / min_spacing;

        // original_dim is (depth, height, width) corresponding to (z, y, x)
        let new_x = (original_dim.2 as f32 * x_spacing * inv_min_spacing) as u32;
        let new_y = (original_dim.1 as f32 * y_spacing * inv_min_spacing) as u32;
        let new_z = (original_dim.0 as f32 * z_spacing * inv_min_spacing) as u32;

        (new_z.max(1), new_y.max(1), new_x.max(1))
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]];
        let v01 = slice[[y0, x1]];
        let v10 = slice[[y1, x0]];
        let v11 = slice[[y1, x1]];

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }

    /// Value of the voxel closest to a continuous `[x, y, z]` index, or `None`
    /// when the index falls outside the grid.
    #[inline]
    pub(crate) fn nearest(data: &Array3<f32>, index: [f64; 3]) -> Option<f32> {
        let (depth, height, width) = data.dim();
        let x = index[0].round();
        let y = index[1].round();
        let z = index[2].round();
        if x < 0.0 || y < 0.0 || z < 0.0 {
            return None;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= width || y >= height || z >= depth {
            return None;
        }
        Some(data[[z, y, x]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn isotropic_dimensions_stretch_coarse_axes() {
        let dims = Interpolator::get_isotropic_dimensions((0.5, 0.5, 2.0), (10, 64, 64));
        assert_eq!(dims, (40, 64, 64));
    }

    #[test]
    fn bilinear_midpoint_is_average() {
        let slice = array![[0.0f32, 10.0], [20.0, 30.0]];
        let value = Interpolator::bilinear_interpolate(&slice.view(), 0.5, 0.5);
        assert!((value - 15.0).abs() < 1e-5);
    }

    #[test]
    fn nearest_rejects_outside_grid() {
        let data = Array3::<f32>::from_elem((2, 2, 2), 7.0);
        assert_eq!(Interpolator::nearest(&data, [1.2, 0.4, 0.0]), Some(7.0));
        assert_eq!(Interpolator::nearest(&data, [-0.6, 0.0, 0.0]), None);
        assert_eq!(Interpolator::nearest(&data, [0.0, 0.0, 1.6]), None);
    }
}
