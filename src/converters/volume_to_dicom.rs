use std::path::{Path, PathBuf};

use crate::batch::{BatchReport, Converter, run_batch};
use crate::converters::{NIFTI_EXTENSIONS, NRRD_EXTENSIONS};
use crate::error::Result;
use crate::io::{DicomSeriesOptions, DicomSeriesWriter, case_name, read_volume};

/// Writes NRRD volumes as DICOM series. A single input file is written
/// straight into the output directory, a directory of inputs gets one
/// sub-directory per case.
#[derive(Clone, Debug, Default)]
pub struct NrrdToDicomConverter {
    pub options: DicomSeriesOptions,
}

/// NIfTI counterpart of [`NrrdToDicomConverter`].
#[derive(Clone, Debug, Default)]
pub struct NiftiToDicomConverter {
    pub options: DicomSeriesOptions,
}

fn write_series(options: &DicomSeriesOptions, input: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    let volume = read_volume(input)?;
    DicomSeriesWriter::new(options.clone()).write(&volume, target)
}

fn convert_single(options: &DicomSeriesOptions, input: &Path, output_dir: &Path) -> BatchReport {
    let mut report = BatchReport::new();
    match write_series(options, input, output_dir) {
        Ok(paths) => paths.into_iter().for_each(|p| report.record_success(p)),
        Err(err) => report.record_failure(input, err),
    }
    report
}

impl NrrdToDicomConverter {
    pub fn new(options: DicomSeriesOptions) -> Self {
        Self { options }
    }
}

impl NiftiToDicomConverter {
    pub fn new(options: DicomSeriesOptions) -> Self {
        Self { options }
    }
}

impl Converter for NrrdToDicomConverter {
    fn name(&self) -> &'static str {
        "nrrd to dicom"
    }

    fn extensions(&self) -> &[&'static str] {
        NRRD_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        write_series(&self.options, input, &output_dir.join(case_name(input)))
    }

    fn convert(&self, input: &Path, output_dir: &Path) -> Result<BatchReport> {
        if input.is_file() {
            return Ok(convert_single(&self.options, input, output_dir));
        }
        run_batch(self, input, output_dir)
    }
}

impl Converter for NiftiToDicomConverter {
    fn name(&self) -> &'static str {
        "nifti to dicom"
    }

    fn extensions(&self) -> &[&'static str] {
        NIFTI_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        write_series(&self.options, input, &output_dir.join(case_name(input)))
    }

    fn convert(&self, input: &Path, output_dir: &Path) -> Result<BatchReport> {
        if input.is_file() {
            return Ok(convert_single(&self.options, input, output_dir));
        }
        run_batch(self, input, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SortBy;
    use crate::io::{write_nifti, write_nrrd};
    use crate::volume::Volume;
    use crate::volume_loader::VolumeLoader;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn volume() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 4), |(z, y, x)| (z * 16 + y * 4 + x) as f32);
        Volume::new(data, (1.0, 1.0, 3.0))
    }

    #[test]
    fn single_nrrd_becomes_one_series() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let path = input.path().join("ct.nrrd");
        write_nrrd(&volume(), &path).unwrap();

        let report = NrrdToDicomConverter::default()
            .convert(&path, output.path())
            .unwrap();
        assert_eq!(report.converted.len(), 3);
        assert!(output.path().join("slice0000.dcm").exists());

        let back = VolumeLoader::load_from_directory(output.path(), SortBy::ImagePositionPatient)
            .unwrap();
        assert_eq!(back.data, volume().data);
    }

    #[test]
    fn directory_of_nifti_gets_one_folder_per_case() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        write_nifti(&volume(), input.path().join("a.nii.gz")).unwrap();
        write_nifti(&volume(), input.path().join("b.nii")).unwrap();

        let report = NiftiToDicomConverter::default()
            .convert(input.path(), output.path())
            .unwrap();
        assert_eq!(report.converted.len(), 6);
        assert!(output.path().join("a/slice0002.dcm").exists());
        assert!(output.path().join("b/slice0000.dcm").exists());
    }
}
