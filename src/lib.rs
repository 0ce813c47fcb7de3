//! # medtk
//!
//! Converters, preprocessing steps and dataset organizers for medical images,
//! built on the dicom-rs ecosystem.
//!
//! Every operation is a loader, a per-item transform and a writer:
//!  - DICOM series, NIfTI and NRRD volumes are read into a [`Volume`], a
//!    `[z, y, x]` voxel grid carrying spacing, origin and direction in
//!    patient (LPS) space
//!  - converters write the volume in another format (NIfTI, NRRD, DICOM
//!    series, PNG slices, STL surfaces, DICOM SEG, RT Structure Sets)
//!  - preprocessing windows CT and MR intensities and anonymizes DICOM
//!    headers
//!  - dataset organizers split, merge and lay out converted files for
//!    training
//!
//! Batch operations are best-effort: every file is converted on its own and
//! a failing file is logged and recorded in the returned [`BatchReport`]
//! while the batch continues.
//!
//! # Examples
//!
//! ## Converting a directory of NIfTI files to NRRD
//!
//! ```no_run
//! # use medtk::batch::Converter;
//! # use medtk::converters::NiftiToNrrdConverter;
//! # use std::path::Path;
//! let report = NiftiToNrrdConverter
//!     .convert(Path::new("volumes"), Path::new("nrrd"))
//!     .expect("should have converted the directory");
//! println!("{} written, {} failed", report.converted.len(), report.failed.len());
//! ```
//!
//! ## Rendering the middle sagittal slice of a DICOM series
//!
//! ```no_run
//! # use medtk::{VolumeLoader, Orientation, Interpolation, SortBy};
//! let volume = VolumeLoader::load_from_directory("dicom", SortBy::ImagePositionPatient)
//!     .expect("should have loaded files from directory");
//! let image = volume
//!     .get_image_from_axis(
//!         volume.dim().2 / 2,
//!         Orientation::Sagittal,
//!         Interpolation::Bilinear,
//!         None,
//!     )
//!     .expect("should have returned image at center of volume");
//! image.save("result.png").expect("should have saved the slice");
//! ```

pub mod batch;
pub mod cli;
pub mod config;
pub mod contours;
pub mod converters;
pub mod datasets;
pub mod enums;
pub mod error;
mod interpolator;
pub mod io;
pub mod logger;
pub mod mesh;
pub mod preprocessing;
pub mod volume;
pub mod volume_loader;

pub use batch::{BatchReport, Converter};
pub use enums::{ImageKind, Interpolation, Orientation, PixelType, SortBy};
pub use error::{Error, Result};
pub use volume::Volume;
pub use volume_loader::VolumeLoader;
