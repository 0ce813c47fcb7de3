use crate::enums::{PixelType, SortBy};
use crate::error::{Error, Result};
use crate::io::dicom::{read_f64, read_f64s, read_int, read_string};
use crate::volume::{Volume, cross, dot};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub(crate) type DicomFile = FileDicomObject<InMemDicomObject>;

/// A directory holding the files of one candidate DICOM series.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DicomSeries {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Identifiers of one slice of a loaded series, in volume order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceReference {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
}

/// A series loaded together with what derived objects need to reference it.
pub struct ReferenceSeries {
    pub volume: Volume,
    /// One entry per axial slice of `volume`.
    pub slices: Vec<SliceReference>,
    /// Data set of the first slice, source of patient and study attributes.
    pub header: InMemDicomObject,
}

impl ReferenceSeries {
    pub fn series_instance_uid(&self) -> Option<String> {
        read_string(&self.header, tags::SERIES_INSTANCE_UID)
    }

    pub fn frame_of_reference_uid(&self) -> Option<String> {
        read_string(&self.header, tags::FRAME_OF_REFERENCE_UID)
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Find every directory below `root` (including `root`) that holds at
    /// least `min_images` `.dcm` files.
    pub fn find_dicom_series(root: impl AsRef<Path>, min_images: usize) -> Vec<DicomSeries> {
        let mut by_directory: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for entry in WalkDir::new(root.as_ref()).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_dicom_file(entry.path()) {
                if let Some(parent) = entry.path().parent() {
                    by_directory
                        .entry(parent.to_path_buf())
                        .or_default()
                        .push(entry.path().to_path_buf());
                }
            }
        }
        by_directory
            .into_iter()
            .filter(|(_, files)| files.len() >= min_images)
            .map(|(directory, files)| DicomSeries { directory, files })
            .collect()
    }

    /// Load a volume from DICOM objects
    ///
    /// Only the first series (Series Instance UID) found is used. Slices whose
    /// pixel data cannot be decoded are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(dicom_objects: &[DicomFile], sort_by: SortBy) -> Result<Volume> {
        let ordered = Self::order_slices(dicom_objects.iter().collect(), sort_by);
        Self::assemble(&ordered).map(|(volume, _)| volume)
    }

    /// Load a volume from file paths. Unreadable files are skipped.
    pub fn load_from_file_paths(paths: &[impl AsRef<Path>], sort_by: SortBy) -> Result<Volume> {
        let objects = Self::open_all(paths);
        Self::load_from_dicom_objects(&objects, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(path: impl AsRef<Path>, sort_by: SortBy) -> Result<Volume> {
        let paths = Self::list_directory(path.as_ref())?;
        Self::load_from_file_paths(&paths, sort_by)
    }

    /// Load the series in `path` sorted along the slice normal, keeping the
    /// identifiers of each slice.
    pub fn load_reference_series(path: impl AsRef<Path>) -> Result<ReferenceSeries> {
        let paths = Self::list_directory(path.as_ref())?;
        let objects = Self::open_all(&paths);
        let ordered = Self::order_slices(objects.iter().collect(), SortBy::ImagePositionPatient);
        let (volume, kept) = Self::assemble(&ordered)?;

        let slices = kept
            .iter()
            .map(|&i| SliceReference {
                sop_class_uid: read_string(ordered[i], tags::SOP_CLASS_UID).unwrap_or_default(),
                sop_instance_uid: read_string(ordered[i], tags::SOP_INSTANCE_UID)
                    .unwrap_or_default(),
            })
            .collect();
        let header = (**ordered[kept[0]]).clone();

        Ok(ReferenceSeries {
            volume,
            slices,
            header,
        })
    }

    pub(crate) fn list_directory(path: &Path) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<_> = fs::read_dir(path)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_dicom_file(path))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(Error::NoValidImages);
        }
        Ok(paths)
    }

    fn open_all(paths: &[impl AsRef<Path>]) -> Vec<DicomFile> {
        paths
            .iter()
            .filter_map(|path| match open_file(path.as_ref()) {
                Ok(object) => Some(object),
                Err(err) => {
                    warn!(path = %path.as_ref().display(), "skipping unreadable file: {err}");
                    None
                }
            })
            .collect()
    }

    /// Restrict to the first series and sort the slices.
    fn order_slices(objects: Vec<&DicomFile>, sort_by: SortBy) -> Vec<&DicomFile> {
        let series_uid = objects
            .iter()
            .find_map(|object| read_string(object, tags::SERIES_INSTANCE_UID));
        let mut keyed: Vec<(f64, &DicomFile)> = objects
            .into_iter()
            .filter(|object| {
                let uid = read_string(object, tags::SERIES_INSTANCE_UID);
                uid.is_none() || uid == series_uid
            })
            .enumerate()
            .filter_map(|(i, object)| {
                let key = Self::get_sort_order(object, sort_by, i);
                if key.is_none() {
                    warn!("skipping slice without a sort key for {sort_by:?}");
                }
                key.map(|key| (key, object))
            })
            .collect();

        if !matches!(sort_by, SortBy::None) {
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
        keyed.into_iter().map(|(_, object)| object).collect()
    }

    fn get_sort_order(dicom_object: &DicomFile, sort_by: SortBy, position: usize) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => {
                let ipp = read_f64s(dicom_object, tags::IMAGE_POSITION_PATIENT)?;
                if ipp.len() < 3 {
                    return None;
                }
                let normal = slice_normal(dicom_object);
                Some(dot([ipp[0], ipp[1], ipp[2]], normal))
            }
            SortBy::TablePosition => read_f64(dicom_object, tags::TABLE_POSITION),
            SortBy::InstanceNumber => {
                read_int(dicom_object, tags::INSTANCE_NUMBER).map(|n| n as f64)
            }
            SortBy::None => Some(position as f64),
        }
    }

    pub(crate) fn decode_image(dicom_object: &DicomFile) -> Option<Array2<f32>> {
        let pixel_data = match dicom_object.decode_pixel_data() {
            Ok(pixel_data) => pixel_data,
            Err(err) => {
                warn!("skipping slice with undecodable pixel data: {err}");
                return None;
            }
        };
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::Default)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    /// Decode and stack the ordered slices. Returns the volume and the
    /// indices into `ordered` of the slices it holds.
    fn assemble(ordered: &[&DicomFile]) -> Result<(Volume, Vec<usize>)> {
        let (kept, images): (Vec<usize>, Vec<Array2<f32>>) = ordered
            .iter()
            .enumerate()
            .filter_map(|(i, object)| Self::decode_image(object).map(|image| (i, image)))
            .unzip();

        if images.is_empty() {
            return Err(Error::NoValidImages);
        }
        Self::validate_dimensions(&images)?;

        let volume_array = Self::build_volume_array(&images);
        let first = ordered[kept[0]];
        let second = kept.get(1).map(|&i| ordered[i]);
        let (spacing, origin, direction) = Self::get_geometry(first, second);
        let pixel_type = Self::get_pixel_type(first);

        debug!(
            slices = images.len(),
            ?spacing,
            ?origin,
            "assembled DICOM volume"
        );
        let volume = Volume::new(volume_array, spacing)
            .with_geometry(origin, direction)
            .with_pixel_type(pixel_type);
        Ok((volume, kept))
    }

    fn validate_dimensions(images: &[Array2<f32>]) -> Result<()> {
        let first_dim = images[0].dim();
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(Error::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// Spacing `(x, y, z)`, origin and direction of the stacked slices.
    fn get_geometry(
        first: &DicomFile,
        second: Option<&DicomFile>,
    ) -> ((f32, f32, f32), [f64; 3], [[f64; 3]; 3]) {
        let (row, col) = slice_axes(first);
        let mut normal = cross(row, col);

        // PixelSpacing is (row spacing, column spacing)
        let (x_spacing, y_spacing) = match read_f64s(first, tags::PIXEL_SPACING).as_deref() {
            Some([row_spacing, col_spacing, ..]) => (*col_spacing, *row_spacing),
            _ => (1.0, 1.0),
        };

        let position = |object: &DicomFile| {
            read_f64s(object, tags::IMAGE_POSITION_PATIENT)
                .filter(|ipp| ipp.len() >= 3)
                .map(|ipp| [ipp[0], ipp[1], ipp[2]])
        };
        let origin = position(first).unwrap_or([0.0; 3]);

        let step = second.and_then(position).map(|next| {
            dot(
                [next[0] - origin[0], next[1] - origin[1], next[2] - origin[2]],
                normal,
            )
        });
        let z_spacing = match step {
            Some(step) if step.abs() > 1e-6 => {
                if step < 0.0 {
                    normal = [-normal[0], -normal[1], -normal[2]];
                }
                step.abs()
            }
            _ => read_f64(first, tags::SPACING_BETWEEN_SLICES)
                .or_else(|| read_f64(first, tags::SLICE_THICKNESS))
                .filter(|v| *v > 0.0)
                .unwrap_or(1.0),
        };

        let direction = [
            [row[0], col[0], normal[0]],
            [row[1], col[1], normal[1]],
            [row[2], col[2], normal[2]],
        ];
        (
            (x_spacing as f32, y_spacing as f32, z_spacing as f32),
            origin,
            direction,
        )
    }

    fn get_pixel_type(object: &DicomFile) -> PixelType {
        let bits = read_int(object, tags::BITS_ALLOCATED).unwrap_or(16);
        let signed = read_int(object, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;
        let slope = read_f64(object, tags::RESCALE_SLOPE).unwrap_or(1.0);
        let intercept = read_f64(object, tags::RESCALE_INTERCEPT).unwrap_or(0.0);

        let identity = slope == 1.0 && intercept == 0.0;
        if !identity {
            return if slope.fract() == 0.0 && intercept.fract() == 0.0 && bits <= 16 {
                PixelType::I16
            } else {
                PixelType::F32
            };
        }
        match (bits, signed) {
            (8, false) => PixelType::U8,
            (8, true) => PixelType::I8,
            (16, false) => PixelType::U16,
            (16, true) => PixelType::I16,
            (32, false) => PixelType::U32,
            (32, true) => PixelType::I32,
            _ => PixelType::F32,
        }
    }
}

fn is_dicom_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
}

/// Row and column direction cosines, axial identity when absent.
fn slice_axes(object: &DicomFile) -> ([f64; 3], [f64; 3]) {
    match read_f64s(object, tags::IMAGE_ORIENTATION_PATIENT).as_deref() {
        Some([r0, r1, r2, c0, c1, c2, ..]) => ([*r0, *r1, *r2], [*c0, *c1, *c2]),
        _ => ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    }
}

fn slice_normal(object: &DicomFile) -> [f64; 3] {
    let (row, col) = slice_axes(object);
    cross(row, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DicomSeriesOptions, DicomSeriesWriter};
    use tempfile::tempdir;

    fn write_series(dir: &Path) -> Volume {
        let data = Array3::from_shape_fn((4, 3, 5), |(z, y, x)| (z * 100 + y * 10 + x) as f32 - 200.0);
        let volume = Volume::new(data, (0.5, 0.8, 2.5)).with_geometry(
            [-50.0, 12.0, 100.0],
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        );
        DicomSeriesWriter::new(DicomSeriesOptions::default())
            .write(&volume, dir)
            .unwrap();
        volume
    }

    #[test]
    fn finds_directories_with_enough_files() {
        let root = tempdir().unwrap();
        let big = root.path().join("patient/series_a");
        let small = root.path().join("patient/series_b");
        fs::create_dir_all(&big).unwrap();
        fs::create_dir_all(&small).unwrap();
        for i in 0..5 {
            fs::write(big.join(format!("{i}.DCM")), b"").unwrap();
        }
        fs::write(small.join("0.dcm"), b"").unwrap();
        fs::write(big.join("notes.txt"), b"").unwrap();

        let series = VolumeLoader::find_dicom_series(root.path(), 5);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].directory, big);
        assert_eq!(series[0].files.len(), 5);
    }

    #[test]
    fn loads_written_series_with_geometry() {
        let dir = tempdir().unwrap();
        let original = write_series(dir.path());

        let volume = VolumeLoader::load_from_directory(dir.path(), SortBy::ImagePositionPatient)
            .unwrap();
        assert_eq!(volume.dim(), (4, 3, 5));
        assert_eq!(volume.data, original.data);
        assert_eq!(volume.origin, [-50.0, 12.0, 100.0]);
        assert!((volume.spacing.0 - 0.5).abs() < 1e-6);
        assert!((volume.spacing.1 - 0.8).abs() < 1e-6);
        assert!((volume.spacing.2 - 2.5).abs() < 1e-6);
        assert_eq!(volume.pixel_type, PixelType::I16);
    }

    #[test]
    fn reference_series_keeps_slice_identifiers() {
        let dir = tempdir().unwrap();
        write_series(dir.path());
        let series = VolumeLoader::load_reference_series(dir.path()).unwrap();
        assert_eq!(series.slices.len(), 4);
        assert!(series.slices.iter().all(|s| s.sop_instance_uid.starts_with("2.25.")));
        assert!(series.series_instance_uid().is_some());
    }

    #[test]
    fn empty_directory_has_no_images() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            VolumeLoader::load_from_directory(dir.path(), SortBy::InstanceNumber),
            Err(Error::NoValidImages)
        ));
    }
}
