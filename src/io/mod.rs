//! Readers and writers for the volumetric formats handled by the converters.

pub mod dicom;
pub mod dicom_series;
pub mod nifti;
pub mod nrrd;

use std::path::Path;

use crate::enums::PixelType;
use crate::error::{Error, Result};
use crate::volume::Volume;

pub use self::dicom_series::{DicomSeriesOptions, DicomSeriesWriter};
pub use self::nifti::{read_nifti, write_nifti};
pub use self::nrrd::{read_nrrd, write_nrrd};

/// Volumetric file formats recognised by extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeFormat {
    Nifti,
    Nrrd,
}

impl VolumeFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(VolumeFormat::Nifti)
        } else if name.ends_with(".nrrd") {
            Some(VolumeFormat::Nrrd)
        } else {
            None
        }
    }

    /// File extension used when writing, without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            VolumeFormat::Nifti => "nii.gz",
            VolumeFormat::Nrrd => "nrrd",
        }
    }

    pub fn matches(self, path: &Path) -> bool {
        Self::from_path(path) == Some(self)
    }
}

pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    match VolumeFormat::from_path(path) {
        Some(VolumeFormat::Nifti) => read_nifti(path),
        Some(VolumeFormat::Nrrd) => read_nrrd(path),
        None => Err(Error::UnsupportedFormat(path.display().to_string())),
    }
}

pub fn write_volume(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match VolumeFormat::from_path(path) {
        Some(VolumeFormat::Nifti) => write_nifti(volume, path),
        Some(VolumeFormat::Nrrd) => write_nrrd(volume, path),
        None => Err(Error::UnsupportedFormat(path.display().to_string())),
    }
}

/// Little-endian samples of `values` stored as `pixel_type`. Integer types
/// are rounded and saturated.
pub(crate) fn encode_le<'a>(
    values: impl Iterator<Item = &'a f32>,
    pixel_type: PixelType,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    for &v in values {
        match pixel_type {
            PixelType::U8 => bytes.push(v.round() as u8),
            PixelType::I8 => bytes.extend_from_slice(&(v.round() as i8).to_le_bytes()),
            PixelType::U16 => bytes.extend_from_slice(&(v.round() as u16).to_le_bytes()),
            PixelType::I16 => bytes.extend_from_slice(&(v.round() as i16).to_le_bytes()),
            PixelType::U32 => bytes.extend_from_slice(&(v.round() as u32).to_le_bytes()),
            PixelType::I32 => bytes.extend_from_slice(&(v.round() as i32).to_le_bytes()),
            PixelType::F32 => bytes.extend_from_slice(&v.to_le_bytes()),
            PixelType::F64 => bytes.extend_from_slice(&(v as f64).to_le_bytes()),
        }
    }
    bytes
}

/// Inverse of [`encode_le`] for either byte order.
pub(crate) fn decode_samples(
    bytes: &[u8],
    pixel_type: PixelType,
    little_endian: bool,
) -> Vec<f32> {
    macro_rules! decode {
        ($t:ty) => {
            bytes
                .chunks_exact(std::mem::size_of::<$t>())
                .map(|chunk| {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(chunk);
                    if little_endian {
                        <$t>::from_le_bytes(raw) as f32
                    } else {
                        <$t>::from_be_bytes(raw) as f32
                    }
                })
                .collect()
        };
    }
    match pixel_type {
        PixelType::U8 => bytes.iter().map(|&b| b as f32).collect(),
        PixelType::I8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
        PixelType::U16 => decode!(u16),
        PixelType::I16 => decode!(i16),
        PixelType::U32 => decode!(u32),
        PixelType::I32 => decode!(i32),
        PixelType::F32 => decode!(f32),
        PixelType::F64 => decode!(f64),
    }
}

/// File name up to its first dot: `case_01.nii.gz` -> `case_01`.
pub fn case_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.split('.').next().unwrap_or(name).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn formats_by_extension() {
        assert_eq!(
            VolumeFormat::from_path(&PathBuf::from("a/ct.nii.gz")),
            Some(VolumeFormat::Nifti)
        );
        assert_eq!(
            VolumeFormat::from_path(&PathBuf::from("CT.NII")),
            Some(VolumeFormat::Nifti)
        );
        assert_eq!(
            VolumeFormat::from_path(&PathBuf::from("seg.nrrd")),
            Some(VolumeFormat::Nrrd)
        );
        assert_eq!(VolumeFormat::from_path(&PathBuf::from("slice.dcm")), None);
    }

    #[test]
    fn case_name_stops_at_first_dot() {
        assert_eq!(case_name(&PathBuf::from("/data/case_01.nii.gz")), "case_01");
        assert_eq!(case_name(&PathBuf::from("scan.nrrd")), "scan");
    }

    #[test]
    fn samples_survive_encoding() {
        let values = [-3.4f32, 0.0, 120.6, 70000.0];
        let bytes = encode_le(values.iter(), PixelType::I16);
        assert_eq!(
            decode_samples(&bytes, PixelType::I16, true),
            vec![-3.0, 0.0, 121.0, 32767.0]
        );
    }
}
