use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use web_time::Instant;

use crate::batch::{BatchReport, unique_output};
use crate::enums::SortBy;
use crate::error::{Error, Result};
use crate::io::{VolumeFormat, write_volume};
use crate::volume_loader::{DicomSeries, VolumeLoader};

pub const DEFAULT_MIN_IMAGES_PER_SERIES: usize = 5;

/// Converts every DICOM series below a root directory to `<series dir>.nii.gz`.
#[derive(Clone, Debug)]
pub struct DicomToNiftiConverter {
    pub min_images_per_series: usize,
}

impl Default for DicomToNiftiConverter {
    fn default() -> Self {
        Self {
            min_images_per_series: DEFAULT_MIN_IMAGES_PER_SERIES,
        }
    }
}

impl DicomToNiftiConverter {
    pub fn new(min_images_per_series: usize) -> Self {
        Self {
            min_images_per_series,
        }
    }

    pub fn convert(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        convert_series(
            input_dir,
            output_dir,
            self.min_images_per_series,
            VolumeFormat::Nifti,
            None,
        )
    }
}

/// Converts every DICOM series below a root directory to NRRD, named after
/// the series directory or after an explicit output name.
#[derive(Clone, Debug)]
pub struct DicomToNrrdConverter {
    pub min_images_per_series: usize,
    pub output_name: Option<String>,
}

impl Default for DicomToNrrdConverter {
    fn default() -> Self {
        Self {
            min_images_per_series: DEFAULT_MIN_IMAGES_PER_SERIES,
            output_name: None,
        }
    }
}

impl DicomToNrrdConverter {
    pub fn new(min_images_per_series: usize, output_name: Option<String>) -> Self {
        Self {
            min_images_per_series,
            output_name,
        }
    }

    pub fn convert(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        let name = self
            .output_name
            .as_deref()
            .map(|name| name.strip_suffix(".nrrd").unwrap_or(name));
        convert_series(
            input_dir,
            output_dir,
            self.min_images_per_series,
            VolumeFormat::Nrrd,
            name,
        )
    }
}

fn convert_series(
    input_dir: &Path,
    output_dir: &Path,
    min_images: usize,
    format: VolumeFormat,
    output_name: Option<&str>,
) -> Result<BatchReport> {
    let started = Instant::now();
    if !input_dir.is_dir() {
        return Err(Error::NotFound(input_dir.to_path_buf()));
    }
    let series = VolumeLoader::find_dicom_series(input_dir, min_images);
    let mut report = BatchReport::new();
    if series.is_empty() {
        warn!(
            input = %input_dir.display(),
            min_images,
            "no DICOM series found"
        );
        return Ok(report);
    }
    fs::create_dir_all(output_dir)?;

    for candidate in &series {
        match convert_one(candidate, output_dir, format, output_name) {
            Ok(output) => {
                info!(
                    series = %candidate.directory.display(),
                    output = %output.display(),
                    slices = candidate.files.len(),
                    "converted series"
                );
                report.record_success(output);
            }
            Err(err) => report.record_failure(&candidate.directory, err),
        }
    }
    report.log_summary("dicom series", started);
    Ok(report)
}

fn convert_one(
    series: &DicomSeries,
    output_dir: &Path,
    format: VolumeFormat,
    output_name: Option<&str>,
) -> Result<PathBuf> {
    let volume = VolumeLoader::load_from_file_paths(&series.files, SortBy::ImagePositionPatient)?;
    let base = output_name
        .map(str::to_string)
        .or_else(|| {
            series
                .directory
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "series".to_string());
    let output = unique_output(output_dir, &base, format.extension());
    write_volume(&volume, &output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DicomSeriesOptions, DicomSeriesWriter, read_nifti, read_nrrd};
    use crate::volume::Volume;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn write_series(dir: &Path, depth: usize) {
        let data = Array3::from_shape_fn((depth, 4, 4), |(z, y, x)| (z + y + x) as f32);
        let volume = Volume::new(data, (1.0, 1.0, 2.0));
        DicomSeriesWriter::new(DicomSeriesOptions::default())
            .write(&volume, dir)
            .unwrap();
    }

    #[test]
    fn converts_each_series_directory() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_series(&root.path().join("case_a"), 6);
        write_series(&root.path().join("nested/case_b"), 5);
        write_series(&root.path().join("too_small"), 3);

        let report = DicomToNiftiConverter::default()
            .convert(root.path(), out.path())
            .unwrap();
        assert_eq!(report.converted.len(), 2);
        assert!(out.path().join("case_a.nii.gz").exists());
        let volume = read_nifti(out.path().join("case_b.nii.gz")).unwrap();
        assert_eq!(volume.dim(), (5, 4, 4));
    }

    #[test]
    fn explicit_nrrd_name_gets_suffix_on_collision() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_series(&root.path().join("a"), 5);
        write_series(&root.path().join("b"), 5);

        let report = DicomToNrrdConverter::new(5, Some("scan.nrrd".to_string()))
            .convert(root.path(), out.path())
            .unwrap();
        assert_eq!(report.converted.len(), 2);
        assert!(read_nrrd(out.path().join("scan.nrrd")).is_ok());
        assert!(out.path().join("scan_1.nrrd").exists());
    }

    #[test]
    fn no_series_gives_empty_report() {
        let root = tempdir().unwrap();
        let out = tempdir().unwrap();
        let report = DicomToNiftiConverter::default()
            .convert(root.path(), out.path())
            .unwrap();
        assert!(report.is_empty());
    }
}
