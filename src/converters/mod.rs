//! One-input, one-output format converters.

pub mod dicom_series;
pub mod nifti_to_dicom_rt;
pub mod nifti_to_dicom_seg;
pub mod nifti_to_png;
pub mod nifti_to_stl;
mod reference;
pub mod volume_format;
pub mod volume_to_dicom;

pub use self::dicom_series::{DicomToNiftiConverter, DicomToNrrdConverter};
pub use self::nifti_to_dicom_rt::NiftiToDicomRt;
pub use self::nifti_to_dicom_seg::{NiftiToDicomSeg, SegDimensions, SegMetadata, SegmentDescription};
pub use self::nifti_to_png::NiftiToPngConverter;
pub use self::nifti_to_stl::{MeshMode, NiftiToStlConverter, SmoothingOptions, StlOptions};
pub use self::volume_format::{NiftiToNrrdConverter, NrrdToNiftiConverter};
pub use self::volume_to_dicom::{NiftiToDicomConverter, NrrdToDicomConverter};

pub const NIFTI_EXTENSIONS: &[&str] = &[".nii.gz", ".nii"];
pub const NRRD_EXTENSIONS: &[&str] = &[".nrrd"];
