use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array3, Zip};
use tracing::{info, warn};

use crate::batch::{BatchReport, list_inputs};
use crate::enums::PixelType;
use crate::error::{Error, Result};
use crate::io::{read_nifti, write_nifti};

/// Merges one binary NIfTI mask per class into a single label map.
#[derive(Clone, Debug)]
pub struct MultiClassNiftiMerger {
    pub volume_path: PathBuf,
    pub class_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// Copy the volume next to the merged segmentation.
    pub move_volumes: bool,
}

impl MultiClassNiftiMerger {
    pub fn new(
        volume_path: impl Into<PathBuf>,
        class_paths: Vec<PathBuf>,
        output_dir: impl Into<PathBuf>,
        move_volumes: bool,
    ) -> Self {
        Self {
            volume_path: volume_path.into(),
            class_paths,
            output_dir: output_dir.into(),
            move_volumes,
        }
    }

    fn check_files(&self) -> Result<()> {
        std::iter::once(&self.volume_path)
            .chain(&self.class_paths)
            .find(|path| !path.exists())
            .map_or(Ok(()), |missing| Err(Error::NotFound(missing.clone())))
    }

    /// Write `segmentations/<volume name, "volume" → "combined">`. Class `i`
    /// (1-based, in `class_paths` order) is written where its mask is
    /// positive; later classes overwrite earlier ones.
    pub fn combine_classes(&self) -> Result<PathBuf> {
        self.check_files()?;
        let Some(first_path) = self.class_paths.first() else {
            return Err(Error::InvalidArgument("no class masks given".to_string()));
        };

        let segmentations_dir = self.output_dir.join("segmentations");
        fs::create_dir_all(&segmentations_dir)?;

        let first = read_nifti(first_path)?;
        let mut combined = Array3::<f32>::zeros(first.data.raw_dim());
        for (idx, path) in self.class_paths.iter().enumerate() {
            let class = if idx == 0 { first.clone() } else { read_nifti(path)? };
            if class.dim() != first.dim() {
                return Err(Error::ShapeMismatch {
                    expected: first.dim(),
                    found: class.dim(),
                });
            }
            let label = (idx + 1) as f32;
            Zip::from(&mut combined).and(&class.data).for_each(|out, &v| {
                if v > 0.0 {
                    *out = label;
                }
            });
        }

        let file_name = self
            .volume_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument(self.volume_path.display().to_string()))?
            .replace("volume", "combined");
        let combined_path = segmentations_dir.join(file_name);
        write_nifti(&first.with_data(combined, PixelType::I16), &combined_path)?;

        if self.move_volumes {
            let volumes_dir = self.output_dir.join("volumes");
            fs::create_dir_all(&volumes_dir)?;
            if let Some(name) = self.volume_path.file_name() {
                fs::copy(&self.volume_path, volumes_dir.join(name))?;
            }
        }
        info!(path = %combined_path.display(), classes = self.class_paths.len(), "combined NIfTI saved");
        Ok(combined_path)
    }

    /// Merge every volume of `volume_dir`. The class masks of a volume are
    /// the files of each class directory whose name starts with the
    /// volume's name up to its first dot.
    pub fn process_directories(
        volume_dir: &Path,
        class_dirs: &[PathBuf],
        output_dir: &Path,
        ext: &str,
        move_volumes: bool,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        for volume in list_inputs(volume_dir, &[ext])? {
            let Some(prefix) = volume
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('.').next())
                .map(str::to_string)
            else {
                continue;
            };
            let mut class_paths = Vec::new();
            for dir in class_dirs {
                class_paths.extend(list_inputs(dir, &[ext])?.into_iter().filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
                }));
            }
            if class_paths.is_empty() {
                warn!(volume = %volume.display(), "no class masks found");
                continue;
            }
            let merger = MultiClassNiftiMerger::new(&volume, class_paths, output_dir, move_volumes);
            match merger.combine_classes() {
                Ok(path) => report.record_success(path),
                Err(err) => report.record_failure(&volume, err),
            }
        }
        Ok(report)
    }
}
