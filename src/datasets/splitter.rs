use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

const SPLITS: [&str; 2] = ["train", "valid"];

/// Splits paired image and label folders into
/// `train|valid/images|labels`.
#[derive(Clone, Debug)]
pub struct DataSplitter {
    pub images_dir: PathBuf,
    pub labels_dir: PathBuf,
    pub output_dir: PathBuf,
    pub options: SplitOptions,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct SplitOptions {
    /// Fraction of files that go to `train`.
    pub train_size: f64,
    pub random_state: u64,
    /// Remove both input folders once copied.
    pub delete_input: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            train_size: 0.8,
            random_state: 42,
            delete_input: false,
        }
    }
}

/// Files that went to each side of a split.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<PathBuf>,
    pub valid: Vec<PathBuf>,
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

impl DataSplitter {
    pub fn new(
        images_dir: impl Into<PathBuf>,
        labels_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        options: SplitOptions,
    ) -> Self {
        Self {
            images_dir: images_dir.into(),
            labels_dir: labels_dir.into(),
            output_dir: output_dir.into(),
            options,
        }
    }

    /// Shuffle with the seeded generator and cut. The validation side gets
    /// `ceil(n * (1 - train_size))` files.
    fn split(&self, mut files: Vec<PathBuf>) -> Split {
        let mut rng = StdRng::seed_from_u64(self.options.random_state);
        files.shuffle(&mut rng);
        let valid = ((files.len() as f64) * (1.0 - self.options.train_size)).ceil() as usize;
        let train = files.len().saturating_sub(valid);
        let valid = files.split_off(train);
        Split { train: files, valid }
    }

    fn copy_all(files: &[PathBuf], target: &Path) -> Result<()> {
        fs::create_dir_all(target)?;
        for file in files {
            if let Some(name) = file.file_name() {
                fs::copy(file, target.join(name))?;
            }
        }
        Ok(())
    }

    /// Split images and labels with the same permutation and copy them.
    /// Returns the image and label splits.
    pub fn run(&self) -> Result<(Split, Split)> {
        if !(0.0..=1.0).contains(&self.options.train_size) {
            return Err(Error::InvalidArgument(format!(
                "train size {} is outside [0, 1]",
                self.options.train_size
            )));
        }
        let images = sorted_files(&self.images_dir)?;
        let labels = sorted_files(&self.labels_dir)?;
        if images.len() != labels.len() {
            warn!(images = images.len(), labels = labels.len(), "image and label counts differ");
        }

        let images = self.split(images);
        let labels = self.split(labels);
        for (side, image_files, label_files) in [
            ("train", &images.train, &labels.train),
            ("valid", &images.valid, &labels.valid),
        ] {
            let images_dir = self.output_dir.join(side).join("images");
            let labels_dir = self.output_dir.join(side).join("labels");
            info!(dir = %images_dir.display(), files = image_files.len(), "copying images");
            Self::copy_all(image_files, &images_dir)?;
            info!(dir = %labels_dir.display(), files = label_files.len(), "copying labels");
            Self::copy_all(label_files, &labels_dir)?;
        }

        if self.options.delete_input {
            info!("deleting input directories");
            fs::remove_dir_all(&self.images_dir)?;
            fs::remove_dir_all(&self.labels_dir)?;
        }
        Ok((images, labels))
    }
}

/// Stems that appear on only one side (images or labels) of a split under
/// `output_dir`, prefixed with the split name. Empty when consistent.
pub fn check_consistency(output_dir: &Path) -> Result<Vec<String>> {
    let mut mismatches = Vec::new();
    for side in SPLITS {
        let stems = |kind: &str| -> Result<BTreeSet<String>> {
            Ok(sorted_files(&output_dir.join(side).join(kind))?
                .iter()
                .map(|p| file_stem(p))
                .collect())
        };
        let images = stems("images")?;
        let labels = stems("labels")?;
        for stem in images.symmetric_difference(&labels) {
            mismatches.push(format!("{side}/{stem}"));
        }
    }
    if !mismatches.is_empty() {
        warn!(count = mismatches.len(), "images and labels do not match");
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(dir: &Path, count: usize) -> (PathBuf, PathBuf) {
        let images = dir.join("images");
        let labels = dir.join("labels");
        fs::create_dir_all(&images).unwrap();
        fs::create_dir_all(&labels).unwrap();
        for i in 0..count {
            fs::write(images.join(format!("case_{i:02}.png")), b"img").unwrap();
            fs::write(labels.join(format!("case_{i:02}.txt")), b"0 0.1 0.1").unwrap();
        }
        (images, labels)
    }

    #[test]
    fn pairs_stay_together() {
        let dir = tempdir().unwrap();
        let (images, labels) = populate(dir.path(), 10);
        let output = dir.path().join("split");
        let splitter = DataSplitter::new(&images, &labels, &output, SplitOptions::default());
        let (image_split, label_split) = splitter.run().unwrap();

        assert_eq!(image_split.train.len(), 8);
        assert_eq!(image_split.valid.len(), 2);
        let stems = |files: &[PathBuf]| files.iter().map(|p| file_stem(p)).collect::<Vec<_>>();
        assert_eq!(stems(&image_split.valid), stems(&label_split.valid));
        assert!(check_consistency(&output).unwrap().is_empty());
        assert!(images.exists());
    }

    #[test]
    fn same_seed_same_split() {
        let dir = tempdir().unwrap();
        let (images, labels) = populate(dir.path(), 7);
        let options = SplitOptions {
            train_size: 0.5,
            ..Default::default()
        };
        let a = DataSplitter::new(&images, &labels, dir.path().join("a"), options).run().unwrap();
        let b = DataSplitter::new(&images, &labels, dir.path().join("b"), options).run().unwrap();
        assert_eq!(a.0.valid, b.0.valid);
        assert_eq!(a.0.valid.len(), 4);
    }

    #[test]
    fn deletes_inputs_when_asked() {
        let dir = tempdir().unwrap();
        let (images, labels) = populate(dir.path(), 3);
        let options = SplitOptions {
            delete_input: true,
            ..Default::default()
        };
        DataSplitter::new(&images, &labels, dir.path().join("out"), options).run().unwrap();
        assert!(!images.exists());
        assert!(!labels.exists());
    }

    #[test]
    fn detects_orphan_labels() {
        let dir = tempdir().unwrap();
        let (images, labels) = populate(dir.path(), 5);
        let output = dir.path().join("out");
        DataSplitter::new(&images, &labels, &output, SplitOptions::default()).run().unwrap();
        fs::write(output.join("train/labels/stray.txt"), b"").unwrap();
        assert_eq!(check_consistency(&output).unwrap(), vec!["train/stray".to_string()]);
    }
}
