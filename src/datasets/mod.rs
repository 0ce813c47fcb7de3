//! Organizers that turn converted data into training datasets, and the
//! catalog of downloadable public datasets.

pub mod catalog;
pub mod mask_polygons;
pub mod monai;
pub mod nifti_merger;
pub mod splitter;
pub mod yolo_yaml;

pub use self::catalog::{CATALOG, DatasetEntry};
pub use self::mask_polygons::{PngToTxtConverterMc, PngToTxtConverterMl};
pub use self::monai::{DatasetJson, MonaiDatasetOrganizer};
pub use self::nifti_merger::MultiClassNiftiMerger;
pub use self::splitter::{DataSplitter, SplitOptions, check_consistency};
pub use self::yolo_yaml::YoloDatasetYaml;
