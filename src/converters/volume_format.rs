use std::path::{Path, PathBuf};

use crate::batch::Converter;
use crate::converters::{NIFTI_EXTENSIONS, NRRD_EXTENSIONS};
use crate::error::Result;
use crate::io::{VolumeFormat, case_name, read_volume, write_volume};

/// `*.nii` / `*.nii.gz` to `<case>.nrrd`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiftiToNrrdConverter;

/// `*.nrrd` to `<case>.nii.gz`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NrrdToNiftiConverter;

fn rewrite(input: &Path, output_dir: &Path, format: VolumeFormat) -> Result<Vec<PathBuf>> {
    let volume = read_volume(input)?;
    let output = output_dir.join(format!("{}.{}", case_name(input), format.extension()));
    write_volume(&volume, &output)?;
    Ok(vec![output])
}

impl Converter for NiftiToNrrdConverter {
    fn name(&self) -> &'static str {
        "nifti to nrrd"
    }

    fn extensions(&self) -> &[&'static str] {
        NIFTI_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        rewrite(input, output_dir, VolumeFormat::Nrrd)
    }
}

impl Converter for NrrdToNiftiConverter {
    fn name(&self) -> &'static str {
        "nrrd to nifti"
    }

    fn extensions(&self) -> &[&'static str] {
        NRRD_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        rewrite(input, output_dir, VolumeFormat::Nifti)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::PixelType;
    use crate::io::{read_nifti, read_nrrd, write_nifti};
    use crate::volume::Volume;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn labels() -> Volume {
        let mut data = Array3::<f32>::zeros((4, 5, 6));
        data[[1, 2, 3]] = 2.0;
        data[[3, 4, 5]] = 1.0;
        Volume::new(data, (0.9, 0.9, 1.5))
            .with_geometry(
                [12.0, -40.0, 7.5],
                [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            )
            .with_pixel_type(PixelType::U8)
    }

    #[test]
    fn nifti_to_nrrd_keeps_voxels_and_geometry() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let original = labels();
        write_nifti(&original, input.path().join("case_7.nii.gz")).unwrap();

        let report = NiftiToNrrdConverter
            .convert(input.path(), output.path())
            .unwrap();
        assert_eq!(report.converted, vec![output.path().join("case_7.nrrd")]);

        let volume = read_nrrd(&report.converted[0]).unwrap();
        assert_eq!(volume.data, original.data);
        assert_eq!(volume.pixel_type, PixelType::U8);
        for (a, b) in volume.origin.iter().zip(original.origin) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn nrrd_to_nifti_single_file() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let path = input.path().join("scan.nrrd");
        crate::io::write_nrrd(&labels(), &path).unwrap();

        let report = NrrdToNiftiConverter.convert(&path, output.path()).unwrap();
        assert_eq!(report.converted.len(), 1);
        let volume = read_nifti(output.path().join("scan.nii.gz")).unwrap();
        assert_eq!(volume.dim(), (4, 5, 6));
        assert_eq!(volume.data[[1, 2, 3]], 2.0);
    }

    #[test]
    fn unreadable_file_is_reported() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        std::fs::write(input.path().join("broken.nrrd"), b"not a nrrd").unwrap();
        let report = NrrdToNiftiConverter
            .convert(input.path(), output.path())
            .unwrap();
        assert!(report.converted.is_empty());
        assert_eq!(report.failed.len(), 1);
    }
}
