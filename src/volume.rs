use std::collections::BTreeSet;

use crate::enums::Interpolation;
use crate::enums::Orientation;
use crate::enums::PixelType;
use crate::interpolator::Interpolator;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

pub type GrayImage = ImageBuffer<Luma<u8>, Vec<u8>>;

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Intensity range mapped onto 0..=255 when rendering slices.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayWindow {
    pub min: f32,
    pub max: f32,
}

impl DisplayWindow {
    pub fn from_center_width(center: f32, width: f32) -> Self {
        Self {
            min: center - width / 2.0,
            max: center + width / 2.0,
        }
    }

    #[inline]
    fn to_u8(self, value: f32) -> u8 {
        let range = self.max - self.min;
        if range <= 0.0 {
            return if value > self.min { 255 } else { 0 };
        }
        (((value - self.min) / range) * 255.0).clamp(0.0, 255.0) as u8
    }
}

/// A voxel grid plus the spatial metadata needed to place it in patient
/// space.
///
/// Voxels are stored `[z, y, x]` (depth, height, width). Spacing is given as
/// `(x, y, z)` in millimetres. Origin and direction follow the DICOM patient
/// coordinate system (LPS); the columns of `direction` are the unit vectors of
/// the x, y and z index axes.
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: (f32, f32, f32),
    pub origin: [f64; 3],
    pub direction: [[f64; 3]; 3],
    pub pixel_type: PixelType,
    pub interpolated_dim: (u32, u32, u32),
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let original_dim = data.dim();
        Self {
            data,
            spacing,
            origin: [0.0; 3],
            direction: IDENTITY,
            pixel_type: PixelType::default(),
            interpolated_dim: Interpolator::get_isotropic_dimensions(spacing, original_dim),
        }
    }

    pub fn with_geometry(mut self, origin: [f64; 3], direction: [[f64; 3]; 3]) -> Self {
        self.origin = origin;
        self.direction = direction;
        self
    }

    pub fn with_pixel_type(mut self, pixel_type: PixelType) -> Self {
        self.pixel_type = pixel_type;
        self
    }

    /// New volume on the same grid with different voxel values.
    pub fn with_data(&self, data: Array3<f32>, pixel_type: PixelType) -> Self {
        Self::new(data, self.spacing)
            .with_geometry(self.origin, self.direction)
            .with_pixel_type(pixel_type)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// Physical (LPS) position of a continuous `[x, y, z]` index.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let scaled = [
            index[0] * self.spacing.0 as f64,
            index[1] * self.spacing.1 as f64,
            index[2] * self.spacing.2 as f64,
        ];
        let mut point = self.origin;
        for (row, value) in point.iter_mut().enumerate() {
            *value += (0..3)
                .map(|col| self.direction[row][col] * scaled[col])
                .sum::<f64>();
        }
        point
    }

    /// Continuous `[x, y, z]` index of a physical (LPS) position. `None` when
    /// the direction matrix is singular.
    pub fn physical_to_index(&self, point: [f64; 3]) -> Option<[f64; 3]> {
        let inverse = invert3(&self.direction)?;
        let offset = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        let spacing = [
            self.spacing.0 as f64,
            self.spacing.1 as f64,
            self.spacing.2 as f64,
        ];
        let mut index = [0.0; 3];
        for (row, value) in index.iter_mut().enumerate() {
            let along: f64 = (0..3).map(|col| inverse[row][col] * offset[col]).sum();
            *value = along / spacing[row];
        }
        Some(index)
    }

    /// Smallest and largest voxel value, `(0, 0)` for an empty volume.
    pub fn min_max(&self) -> (f32, f32) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Mean and population standard deviation of all voxels.
    pub fn mean_std(&self) -> (f64, f64) {
        let values: Vec<f32> = self.data.iter().copied().collect();
        if values.is_empty() {
            return (0.0, 0.0);
        }
        let count = values.len() as f64;
        let mean = values.par_iter().map(|&v| v as f64).sum::<f64>() / count;
        let variance = values
            .par_iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count;
        (mean, variance.sqrt())
    }

    /// Sorted non-zero labels of a segmentation (values rounded to integers).
    pub fn unique_labels(&self) -> Vec<i32> {
        let labels: BTreeSet<i32> = self
            .data
            .iter()
            .map(|&v| v.round() as i32)
            .filter(|&label| label != 0)
            .collect();
        labels.into_iter().collect()
    }

    /// Binary mask (0/1) of the voxels carrying `label`.
    pub fn label_mask(&self, label: i32) -> Array3<u8> {
        self.data.mapv(|v| u8::from(v.round() as i32 == label))
    }

    /// Binary mask (0/1) of the voxels at or above `level`.
    pub fn threshold_mask(&self, level: f32) -> Array3<u8> {
        self.data.mapv(|v| u8::from(v >= level))
    }

    /// Block-average the volume by `factor` along every axis. Partial blocks
    /// at the upper edges are averaged over the voxels they contain.
    pub fn downsample_mean(&self, factor: usize) -> Volume {
        if factor <= 1 {
            return self.clone();
        }
        let (depth, height, width) = self.dim();
        let out_dim = (
            depth.div_ceil(factor),
            height.div_ceil(factor),
            width.div_ceil(factor),
        );
        let data = Array3::from_shape_fn(out_dim, |(z, y, x)| {
            let block = self.data.slice(s![
                z * factor..((z + 1) * factor).min(depth),
                y * factor..((y + 1) * factor).min(height),
                x * factor..((x + 1) * factor).min(width)
            ]);
            block.sum() / block.len() as f32
        });
        let half = (factor as f64 - 1.0) / 2.0;
        let origin = self.index_to_physical([half, half, half]);
        let f = factor as f32;
        Volume::new(
            data,
            (self.spacing.0 * f, self.spacing.1 * f, self.spacing.2 * f),
        )
        .with_geometry(origin, self.direction)
        .with_pixel_type(PixelType::F32)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    fn get_output_dimensions(&self, orientation: &Orientation) -> (u32, u32) {
        // Always return (width, height) - standard image convention
        match orientation {
            Orientation::Axial => {
                // Looking down Z-axis: X is width, Y is height
                (self.interpolated_dim.2, self.interpolated_dim.1)
            }
            Orientation::Coronal => {
                // Looking down Y-axis: X is width, Z is height
                (self.interpolated_dim.2, self.interpolated_dim.0)
            }
            Orientation::Sagittal => {
                // Looking down X-axis: Y is width, Z is height
                (self.interpolated_dim.1, self.interpolated_dim.0)
            }
        }
    }

    fn slice_to_image(slice: &ArrayView2<'_, f32>, window: DisplayWindow) -> Option<GrayImage> {
        let (height, width) = slice.dim();
        let values: Vec<f32> = slice.iter().copied().collect();
        let pixel_data: Vec<u8> = values.par_iter().map(|&v| window.to_u8(v)).collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Render one orthogonal slice to an 8-bit image. Without a window the
    /// full value range of the volume is used.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
        interpolation: Interpolation,
        window: Option<DisplayWindow>,
    ) -> Option<GrayImage> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let window = window.unwrap_or_else(|| {
            let (min, max) = self.min_max();
            DisplayWindow { min, max }
        });

        match interpolation {
            Interpolation::None => Self::slice_to_image(&slice, window),
            Interpolation::Bilinear => {
                // Axial doesn't need interpolation (already isotropic in-plane)
                if matches!(orientation, Orientation::Axial) {
                    return Self::slice_to_image(&slice, window);
                }
                let (width, height) = self.get_output_dimensions(&orientation);
                Self::interpolate_slice(&slice, width, height, window)
            }
        }
    }

    fn interpolate_slice(
        slice: &ArrayView2<'_, f32>,
        width: u32,
        height: u32,
        window: DisplayWindow,
    ) -> Option<GrayImage> {
        let (slice_height, slice_width) = slice.dim();

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map(|y| {
                (0..width)
                    .map(|x| {
                        // normalized coordinates with half-pixel offset
                        let norm_x = (x as f32 + 0.5) / width as f32;
                        let norm_y = (y as f32 + 0.5) / height as f32;

                        let src_x = norm_x * slice_width as f32 - 0.5;
                        let src_y = norm_y * slice_height as f32 - 0.5;

                        let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
                        let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

                        let value = Interpolator::bilinear_interpolate(slice, src_y, src_x);
                        window.to_u8(value)
                    })
                    .collect::<Vec<u8>>()
            })
            .collect();

        ImageBuffer::from_raw(width, height, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

pub(crate) fn invert3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Volume {
        let data = Array3::from_shape_fn((4, 6, 8), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        Volume::new(data, (0.5, 0.5, 2.0))
    }

    #[test]
    fn index_and_physical_round_trip() {
        let flipped = [[-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]];
        let volume = ramp().with_geometry([10.0, -5.0, 3.0], flipped);
        let point = volume.index_to_physical([2.0, 3.0, 1.0]);
        assert_eq!(point, [9.0, -3.0, 4.5]);
        let index = volume.physical_to_index(point).unwrap();
        for (a, b) in index.iter().zip([2.0, 3.0, 1.0]) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn labels_and_masks() {
        let mut data = Array3::<f32>::zeros((2, 3, 3));
        data[[0, 1, 1]] = 2.0;
        data[[1, 2, 2]] = 5.0;
        data[[1, 0, 0]] = 2.0;
        let volume = Volume::new(data, (1.0, 1.0, 1.0));
        assert_eq!(volume.unique_labels(), vec![2, 5]);
        assert_eq!(volume.label_mask(2).sum(), 2);
        assert_eq!(volume.threshold_mask(1.0).sum(), 3);
    }

    #[test]
    fn statistics() {
        let data = Array3::from_shape_vec((1, 1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let volume = Volume::new(data, (1.0, 1.0, 1.0));
        assert_eq!(volume.min_max(), (1.0, 4.0));
        let (mean, std) = volume.mean_std();
        assert!((mean - 2.5).abs() < 1e-12);
        assert!((std - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn downsample_averages_blocks() {
        let data = Array3::from_elem((4, 4, 4), 2.0f32);
        let volume = Volume::new(data, (1.0, 1.0, 1.0)).downsample_mean(2);
        assert_eq!(volume.dim(), (2, 2, 2));
        assert_eq!(volume.spacing, (2.0, 2.0, 2.0));
        assert_eq!(volume.origin, [0.5, 0.5, 0.5]);
        assert!(volume.data.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn axial_image_has_slice_dimensions() {
        let volume = ramp();
        let image = volume
            .get_image_from_axis(1, Orientation::Axial, Interpolation::None, None)
            .unwrap();
        assert_eq!(image.dimensions(), (8, 6));
    }

    #[test]
    fn coronal_image_is_stretched_to_isotropic() {
        let volume = ramp();
        let image = volume
            .get_image_from_axis(
                2,
                Orientation::Coronal,
                Interpolation::Bilinear,
                Some(DisplayWindow::from_center_width(200.0, 400.0)),
            )
            .unwrap();
        // depth 4 at 2mm becomes 16 rows at 0.5mm
        assert_eq!(image.dimensions(), (8, 16));
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let volume = ramp();
        assert!(
            volume
                .get_image_from_axis(8, Orientation::Sagittal, Interpolation::None, None)
                .is_none()
        );
    }
}
