//! Intensity windowing of CT and MRI series and volumes.
//!
//! CT windowing clips Hounsfield units to a fixed window and rescales the
//! result to the full 0–255 range. MRI windowing derives its window from the
//! intensity statistics of the whole series.

use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::VR;
use dicom::object::{InMemDicomObject, open_file};
use dicom_dictionary_std::{tags, uids};
use ndarray::{Array2, ArrayViewMut, Dimension, Zip};
use serde::Deserialize;
use tracing::{info, warn};

use crate::batch::BatchReport;
use crate::enums::PixelType;
use crate::error::{Error, Result};
use crate::io::dicom::{new_uid, put_ds, put_i16_image, put_str, read_string, write_object};
use crate::io::{read_nifti, write_nifti};
use crate::volume_loader::{DicomFile, VolumeLoader};

/// CT display window in Hounsfield units.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Window {
    pub center: f64,
    pub width: f64,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            center: 40.0,
            width: 400.0,
        }
    }
}

impl Window {
    pub fn new(center: f64, width: f64) -> Self {
        Self { center, width }
    }

    /// `[center - ⌊width / 2⌋, center + ⌊width / 2⌋]`
    pub fn bounds(&self) -> (f64, f64) {
        let half = (self.width / 2.0).floor();
        (self.center - half, self.center + half)
    }
}

/// Clip to `[lo, hi]` then stretch the clipped values to 0–255.
fn stretch_to_byte_range<D: Dimension>(mut values: ArrayViewMut<'_, f32, D>, lo: f64, hi: f64) {
    let (lo, hi) = (lo as f32, hi as f32);
    values.mapv_inplace(|v| v.clamp(lo, hi));
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
    let range = max - min;
    if range > 0.0 {
        values.mapv_inplace(|v| (v - min) / range * 255.0);
    } else {
        values.fill(0.0);
    }
}

/// Linear map of `[lo, hi]` onto 0–255, saturating outside.
fn intensity_window<D: Dimension>(mut values: ArrayViewMut<'_, f32, D>, lo: f64, hi: f64) {
    let range = hi - lo;
    values.mapv_inplace(|v| {
        if range <= 0.0 {
            0.0
        } else {
            (((v as f64 - lo) / range) * 255.0).clamp(0.0, 255.0) as f32
        }
    });
}

fn dicom_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    VolumeLoader::list_directory(dir)
}

/// Write `image` onto the header of `file` as `out_dir/slice_####.dcm`.
fn save_slice(
    file: DicomFile,
    image: &Array2<f32>,
    out_dir: &Path,
    index: usize,
    rescale: Option<(f64, f64)>,
    window: Option<Window>,
) -> Result<PathBuf> {
    let mut obj: InMemDicomObject = file.into_inner();
    put_i16_image(&mut obj, image.view());
    if let Some((slope, intercept)) = rescale {
        put_ds(&mut obj, tags::RESCALE_SLOPE, &[slope]);
        put_ds(&mut obj, tags::RESCALE_INTERCEPT, &[intercept]);
    }
    if let Some(window) = window {
        put_ds(&mut obj, tags::WINDOW_CENTER, &[window.center]);
        put_ds(&mut obj, tags::WINDOW_WIDTH, &[window.width]);
    }
    let sop_class = read_string(&obj, tags::SOP_CLASS_UID).unwrap_or_else(|| uids::CT_IMAGE_STORAGE.to_string());
    let sop_instance = match read_string(&obj, tags::SOP_INSTANCE_UID) {
        Some(uid) => uid,
        None => {
            let uid = new_uid();
            put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, uid.as_str());
            uid
        }
    };
    let path = out_dir.join(format!("slice_{index:04}.dcm"));
    write_object(obj, &sop_class, &sop_instance, &path)?;
    Ok(path)
}

fn open_and_decode(path: &Path) -> Result<(DicomFile, Array2<f32>)> {
    let file = open_file(path)?;
    let image = VolumeLoader::decode_image(&file)
        .ok_or_else(|| Error::UnsupportedFormat(format!("undecodable pixel data in {}", path.display())))?;
    Ok((file, image))
}

/// CT windowing of DICOM series.
///
/// Each slice is clipped to the window and stretched to 0–255. The stored
/// samples are those 0–255 values; `RescaleSlope`/`RescaleIntercept` map them
/// back into the window's Hounsfield range.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomCtWindowing {
    pub window: Window,
}

impl DicomCtWindowing {
    pub fn new(window: Window) -> Self {
        Self { window }
    }

    /// Window every `.dcm` file of `input_dir` (in name order) into
    /// `output_dir`. Files that fail are logged and skipped.
    pub fn process_directory(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        let files = match dicom_files(input_dir) {
            Ok(files) => files,
            Err(Error::NoValidImages) => {
                warn!(dir = %input_dir.display(), "no DICOM files found");
                return Ok(report);
            }
            Err(err) => return Err(err),
        };
        fs::create_dir_all(output_dir)?;
        let (lo, hi) = self.window.bounds();

        for (i, path) in files.iter().enumerate() {
            let result = open_and_decode(path).and_then(|(file, mut image)| {
                stretch_to_byte_range(image.view_mut(), lo, hi);
                save_slice(
                    file,
                    &image,
                    output_dir,
                    i,
                    Some(((hi - lo) / 255.0, lo)),
                    Some(self.window),
                )
            });
            match result {
                Ok(output) => report.record_success(output),
                Err(err) => report.record_failure(path, err),
            }
        }
        info!(dir = %input_dir.display(), slices = report.converted.len(), "CT windowing done");
        Ok(report)
    }

    /// Window several series, each into `output_dir/<series dir name>`.
    pub fn process_directories(&self, input_dirs: &[PathBuf], output_dir: &Path) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        for dir in input_dirs {
            let name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
            report.merge(self.process_directory(dir, &output_dir.join(name))?);
        }
        Ok(report)
    }
}

/// CT windowing of NIfTI volumes. The output holds int16 values inside the
/// window's Hounsfield range.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiftiCtWindowing {
    pub window: Window,
}

impl NiftiCtWindowing {
    pub fn new(window: Window) -> Self {
        Self { window }
    }

    pub fn convert(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        let volume = read_nifti(input)?;
        let (lo, hi) = self.window.bounds();
        let mut data = volume.data.clone();
        stretch_to_byte_range(data.view_mut(), lo, hi);
        let scale = ((hi - lo) / 255.0) as f32;
        data.par_mapv_inplace(|v| (v * scale + lo as f32).trunc());

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        write_nifti(&volume.with_data(data, PixelType::I16), output)?;
        info!(input = %input.display(), output = %output.display(), "CT windowing done");
        Ok(output.to_path_buf())
    }
}

/// Window `[mean - coef·σ, mean + coef·σ]` of the values.
fn statistics_bounds<'a>(values: impl Iterator<Item = &'a f32>, coef: f64) -> (f64, f64) {
    let (mut n, mut sum, mut sum_sq) = (0usize, 0f64, 0f64);
    for &v in values {
        n += 1;
        sum += v as f64;
        sum_sq += (v as f64) * (v as f64);
    }
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / n as f64;
    let std = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
    (mean - coef * std, mean + coef * std)
}

/// Statistics-based windowing of a dark DICOM series (MRI, CBCT).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DicomMriWindowing {
    pub coef: f64,
}

impl Default for DicomMriWindowing {
    fn default() -> Self {
        Self { coef: 4.0 }
    }
}

impl DicomMriWindowing {
    pub fn new(coef: f64) -> Self {
        Self { coef }
    }

    /// Window the series of `input_dir` as a whole and write each slice onto
    /// its original header as `output_dir/slice_####.dcm`.
    pub fn window_series(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        let files = dicom_files(input_dir)?;
        let mut report = BatchReport::new();
        let mut slices = Vec::with_capacity(files.len());
        for path in &files {
            match open_and_decode(path) {
                Ok(slice) => slices.push((path, slice)),
                Err(err) => report.record_failure(path, err),
            }
        }
        if slices.is_empty() {
            return Err(Error::NoValidImages);
        }
        let (lo, hi) = statistics_bounds(slices.iter().flat_map(|(_, (_, image))| image.iter()), self.coef);
        info!(lower = lo, upper = hi, "MRI window");

        fs::create_dir_all(output_dir)?;
        for (i, (path, (file, mut image))) in slices.into_iter().enumerate() {
            intensity_window(image.view_mut(), lo, hi);
            image.mapv_inplace(f32::trunc);
            match save_slice(file, &image, output_dir, i, Some((1.0, 0.0)), None) {
                Ok(output) => report.record_success(output),
                Err(err) => report.record_failure(path, err),
            }
        }
        Ok(report)
    }
}

/// Statistics-based windowing of NIfTI volumes, uint8 output.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct NiftiMriWindowing {
    pub coef: f64,
}

impl Default for NiftiMriWindowing {
    fn default() -> Self {
        Self { coef: 4.0 }
    }
}

impl NiftiMriWindowing {
    pub fn new(coef: f64) -> Self {
        Self { coef }
    }

    pub fn convert(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        let volume = read_nifti(input)?;
        let (mean, std) = volume.mean_std();
        let (lo, hi) = (mean - self.coef * std, mean + self.coef * std);
        let mut data = volume.data.clone();
        intensity_window(data.view_mut(), lo, hi);
        Zip::from(&mut data).par_for_each(|v| *v = v.trunc());

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        write_nifti(&volume.with_data(data, PixelType::U8), output)?;
        info!(input = %input.display(), output = %output.display(), "MRI windowing done");
        Ok(output.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dicom::{read_f64, read_int};
    use crate::io::{DicomSeriesOptions, DicomSeriesWriter};
    use crate::volume::Volume;
    use ndarray::{Array1, Array3};
    use tempfile::tempdir;

    #[test]
    fn default_window_bounds() {
        assert_eq!(Window::default().bounds(), (-160.0, 240.0));
        assert_eq!(Window::new(50.0, 351.0).bounds(), (-125.0, 225.0));
    }

    #[test]
    fn stretch_clips_then_normalizes() {
        let mut values = Array1::from(vec![-1000.0f32, -160.0, 40.0, 240.0, 3000.0]);
        stretch_to_byte_range(values.view_mut(), -160.0, 240.0);
        assert_eq!(values.to_vec(), vec![0.0, 0.0, 127.5, 255.0, 255.0]);
    }

    #[test]
    fn flat_input_maps_to_zero() {
        let mut values = Array1::from(vec![500.0f32; 4]);
        stretch_to_byte_range(values.view_mut(), -160.0, 240.0);
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn statistics_window_uses_mean_and_sigma() {
        let values = [1.0f32, 3.0, 1.0, 3.0];
        let (lo, hi) = statistics_bounds(values.iter(), 2.0);
        assert!((lo - 0.0).abs() < 1e-12);
        assert!((hi - 4.0).abs() < 1e-12);
    }

    fn write_ct(dir: &Path) {
        let data = Array3::from_shape_fn((3, 4, 4), |(z, y, x)| (z * 200) as f32 + (y * 4 + x) as f32 * 20.0 - 300.0);
        DicomSeriesWriter::new(DicomSeriesOptions::default())
            .write(&Volume::new(data, (1.0, 1.0, 1.0)), dir)
            .unwrap();
    }

    #[test]
    fn dicom_ct_windowing_writes_rescaled_slices() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write_ct(&input);

        let report = DicomCtWindowing::default().process_directory(&input, &output).unwrap();
        assert_eq!(report.converted.len(), 3);
        assert!(report.failed.is_empty());

        let obj = open_file(output.join("slice_0000.dcm")).unwrap();
        assert_eq!(read_f64(&obj, tags::RESCALE_INTERCEPT), Some(-160.0));
        assert!((read_f64(&obj, tags::RESCALE_SLOPE).unwrap() - 400.0 / 255.0).abs() < 1e-6);
        assert_eq!(read_int(&obj, tags::WINDOW_CENTER), Some(40));

        let (_, image) = open_and_decode(&output.join("slice_0000.dcm")).unwrap();
        let (min, max) = image.iter().fold((f32::MAX, f32::MIN), |(a, b), &v| (a.min(v), b.max(v)));
        // stored 0 and 255 rescale to the window bounds
        assert!((min - -160.0).abs() < 1e-3);
        assert!((max - 240.0).abs() < 1e-3);
    }

    #[test]
    fn empty_directory_gives_empty_report() {
        let dir = tempdir().unwrap();
        let report = DicomCtWindowing::default()
            .process_directory(dir.path(), &dir.path().join("out"))
            .unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn multiple_series_get_their_own_directory() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_ct(&a);
        write_ct(&b);
        let out = dir.path().join("out");
        let report = DicomCtWindowing::default()
            .process_directories(&[a, b], &out)
            .unwrap();
        assert_eq!(report.converted.len(), 6);
        assert!(out.join("a/slice_0002.dcm").exists());
        assert!(out.join("b/slice_0000.dcm").exists());
    }

    #[test]
    fn nifti_windowing_keeps_geometry() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("ct.nii.gz");
        let data = Array3::from_shape_fn((2, 3, 3), |(z, y, x)| (z * 9 + y * 3 + x) as f32 * 100.0 - 500.0);
        let volume = Volume::new(data, (0.7, 0.7, 2.0)).with_geometry(
            [10.0, -20.0, 5.0],
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        );
        write_nifti(&volume, &input).unwrap();

        let ct_out = dir.path().join("ct/windowed.nii.gz");
        NiftiCtWindowing::default().convert(&input, &ct_out).unwrap();
        let windowed = read_nifti(&ct_out).unwrap();
        assert_eq!(windowed.pixel_type, PixelType::I16);
        assert_eq!(windowed.origin, volume.origin);
        assert!(windowed.data.iter().all(|&v| (-160.0..=240.0).contains(&v)));

        let mri_out = dir.path().join("mri/windowed.nii.gz");
        NiftiMriWindowing::default().convert(&input, &mri_out).unwrap();
        let windowed = read_nifti(&mri_out).unwrap();
        assert_eq!(windowed.pixel_type, PixelType::U8);
        assert!(windowed.data.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }

    #[test]
    fn dicom_mri_windowing_writes_every_slice() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        write_ct(&input);
        let output = dir.path().join("out");
        let report = DicomMriWindowing::default().window_series(&input, &output).unwrap();
        assert_eq!(report.converted.len(), 3);
        let (_, image) = open_and_decode(&output.join("slice_0001.dcm")).unwrap();
        assert!(image.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }
}
