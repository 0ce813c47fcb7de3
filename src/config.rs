//! Defaults for the command line tools, optionally read from a TOML file.
//!
//! Every section may be left out; missing sections and keys fall back to the
//! defaults of the corresponding options type. Flags given on the command
//! line override what the file says.
//!
//! ```toml
//! [window]
//! center = 50
//! width = 350
//!
//! [stl]
//! mode = "per-label"
//! target_reduction = 0.3
//!
//! [split]
//! train_size = 0.75
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::converters::dicom_series::DEFAULT_MIN_IMAGES_PER_SERIES;
use crate::converters::nifti_to_dicom_seg::SegMetadata;
use crate::converters::{NiftiToPngConverter, StlOptions};
use crate::datasets::SplitOptions;
use crate::error::Result;
use crate::io::DicomSeriesOptions;
use crate::preprocessing::Window;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CT window used by `ct-window`.
    pub window: Window,
    pub mri: MriConfig,
    pub series: SeriesConfig,
    pub png: NiftiToPngConverter,
    pub stl: StlOptions,
    /// Attributes of series written by `nrrd2dicom` and `nifti2dicom`.
    pub dicom: DicomSeriesOptions,
    pub split: SplitOptions,
    pub seg: SegMetadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MriConfig {
    /// Half width of the window in standard deviations.
    pub coef: f64,
}

impl Default for MriConfig {
    fn default() -> Self {
        Self { coef: 4.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    pub min_images_per_series: usize,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            min_images_per_series: DEFAULT_MIN_IMAGES_PER_SERIES,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }

    /// The file at `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converters::MeshMode;
    use crate::enums::ImageKind;
    use crate::error::Error;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.window, Window::default());
        assert_eq!(config.mri.coef, 4.0);
        assert_eq!(config.series.min_images_per_series, DEFAULT_MIN_IMAGES_PER_SERIES);
        assert_eq!(config.png.min_v, -200.0);
        assert_eq!(config.png.kind, ImageKind::Volume);
        assert_eq!(config.stl, StlOptions::merged());
        assert_eq!(config.dicom.modality, "CT");
        assert_eq!(config.split.random_state, 42);
        assert_eq!(config.seg.algorithm_name, "test");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 350.0

            [stl]
            mode = "per-label"
            target_reduction = 0.3

            [split]
            train_size = 0.75

            [dicom]
            modality = "MR"
            "#,
        )
        .unwrap();
        assert_eq!(config.window, Window::new(40.0, 350.0));
        assert_eq!(config.stl.mode, MeshMode::PerLabel);
        assert_eq!(config.stl.target_reduction, Some(0.3));
        assert_eq!(config.split.train_size, 0.75);
        assert_eq!(config.split.random_state, 42);
        assert_eq!(config.dicom.modality, "MR");
        assert_eq!(config.dicom.patient_name, "Anonymous");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medtk.toml");
        fs::write(&path, "[window]\ncenter = \"wide\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::Config(_))));
        assert!(matches!(Config::load(None), Ok(_)));
    }
}
