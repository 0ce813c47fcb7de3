use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, imageops};
use ndarray::{Array2, ArrayView2, Axis};
use serde::Deserialize;
use tracing::info;

use crate::batch::{BatchReport, Converter};
use crate::converters::NIFTI_EXTENSIONS;
use crate::enums::ImageKind;
use crate::error::Result;
use crate::io::{case_name, read_nifti};
use crate::volume::GrayImage;

/// Writes every axial slice of a NIfTI file as `<case>_####.png` (RGB,
/// rotated by 180 degrees). Intensity volumes are clipped to
/// `[min_v, max_v]` and scaled to 0-255; segmentations are stored as-is.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NiftiToPngConverter {
    pub min_v: f32,
    pub max_v: f32,
    pub kind: ImageKind,
}

impl Default for NiftiToPngConverter {
    fn default() -> Self {
        Self {
            min_v: -200.0,
            max_v: 200.0,
            kind: ImageKind::Volume,
        }
    }
}

impl NiftiToPngConverter {
    pub fn new(min_v: f32, max_v: f32) -> Self {
        Self {
            min_v,
            max_v,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: ImageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn prepare_slice(&self, slice: ArrayView2<'_, f32>) -> Array2<u8> {
        match self.kind {
            ImageKind::Volume => {
                let range = self.max_v - self.min_v;
                slice.mapv(|v| {
                    if range <= 0.0 {
                        return 0;
                    }
                    let clipped = v.clamp(self.min_v, self.max_v);
                    ((clipped - self.min_v) / range * 255.0) as u8
                })
            }
            ImageKind::Segmentation => slice.mapv(|v| v.clamp(0.0, 255.0) as u8),
        }
    }

    /// Convert the volumes of `volume_dir` into `<out>/images` and the
    /// segmentations of `segmentation_dir` into `<out>/labels`.
    pub fn run(
        &self,
        volume_dir: Option<&Path>,
        segmentation_dir: Option<&Path>,
        output_dir: &Path,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        if let Some(dir) = volume_dir {
            info!("converting volume files");
            let converter = self.clone().with_kind(ImageKind::Volume);
            report.merge(converter.convert(dir, &output_dir.join("images"))?);
        }
        if let Some(dir) = segmentation_dir {
            info!("converting segmentation files");
            let converter = self.clone().with_kind(ImageKind::Segmentation);
            report.merge(converter.convert(dir, &output_dir.join("labels"))?);
        }
        Ok(report)
    }
}

impl Converter for NiftiToPngConverter {
    fn name(&self) -> &'static str {
        "nifti to png"
    }

    fn extensions(&self) -> &[&'static str] {
        NIFTI_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let volume = read_nifti(input)?;
        let case = case_name(input);
        fs::create_dir_all(output_dir)?;

        let mut written = Vec::with_capacity(volume.dim().0);
        for (i, slice) in volume.data.axis_iter(Axis(0)).enumerate() {
            let pixels = self.prepare_slice(slice);
            let (height, width) = pixels.dim();
            let gray: GrayImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                image::Luma([pixels[[y as usize, x as usize]]])
            });
            let rgb = DynamicImage::ImageLuma8(imageops::rotate180(&gray)).to_rgb8();
            let path = output_dir.join(format!("{case}_{i:04}.png"));
            rgb.save(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::write_nifti;
    use crate::volume::Volume;
    use ndarray::{Array3, array};
    use tempfile::tempdir;

    #[test]
    fn volume_slices_are_windowed() {
        let converter = NiftiToPngConverter::default();
        let slice = array![[-1000.0f32, -200.0], [0.0, 500.0]];
        let prepared = converter.prepare_slice(slice.view());
        assert_eq!(prepared, array![[0u8, 0], [127, 255]]);
    }

    #[test]
    fn segmentation_slices_are_cast() {
        let converter = NiftiToPngConverter::default().with_kind(ImageKind::Segmentation);
        let prepared = converter.prepare_slice(array![[0.0f32, 2.0]].view());
        assert_eq!(prepared, array![[0u8, 2]]);
    }

    #[test]
    fn run_writes_images_and_labels() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let vol_dir = input.path().join("volumes");
        let seg_dir = input.path().join("segmentations");
        fs::create_dir_all(&vol_dir).unwrap();
        fs::create_dir_all(&seg_dir).unwrap();

        let mut data = Array3::<f32>::zeros((2, 3, 4));
        data[[0, 0, 0]] = 1.0;
        let volume = Volume::new(data, (1.0, 1.0, 1.0));
        write_nifti(&volume, vol_dir.join("case_01.nii.gz")).unwrap();
        write_nifti(&volume, seg_dir.join("case_01.nii.gz")).unwrap();

        let report = NiftiToPngConverter::default()
            .run(Some(&vol_dir), Some(&seg_dir), output.path())
            .unwrap();
        assert_eq!(report.converted.len(), 4);

        let label = image::open(output.path().join("labels/case_01_0000.png"))
            .unwrap()
            .to_rgb8();
        assert_eq!(label.dimensions(), (4, 3));
        // rotated: voxel (0, 0) lands in the opposite corner
        assert_eq!(label.get_pixel(3, 2).0, [1, 1, 1]);
        assert_eq!(label.get_pixel(0, 0).0, [0, 0, 0]);
        assert!(output.path().join("images/case_01_0001.png").exists());
    }
}
