use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use tracing::info;

use crate::batch::list_inputs;
use crate::error::{Error, Result};

type Pair = (PathBuf, PathBuf);

const DIRECTORIES: [&str; 5] = ["imagesTr", "imagesTs", "imagesVal", "labelsTr", "labelsVal"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetPair {
    pub image: String,
    pub label: String,
}

/// Content of MONAI's `dataset.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetJson {
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub licence: String,
    pub training: Vec<DatasetPair>,
    pub validation: Vec<DatasetPair>,
    pub test: Vec<String>,
}

/// Moves volumes and segmentations into the MONAI folder layout and writes
/// the matching `dataset.json`.
#[derive(Clone, Debug)]
pub struct MonaiDatasetOrganizer {
    pub base_dir: PathBuf,
    pub output_file: String,
    /// Label index (as a string) to name.
    pub labels: BTreeMap<String, String>,
    pub seed: u64,
}

fn default_labels() -> BTreeMap<String, String> {
    [("0", "background"), ("1", "spleen"), ("2", "rkidney")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn move_file(file: &Path, destination: &Path) -> Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(file.display().to_string()))?;
    let target = destination.join(name);
    if fs::rename(file, &target).is_err() {
        // rename fails across file systems
        fs::copy(file, &target)?;
        fs::remove_file(file)?;
    }
    Ok(())
}

impl MonaiDatasetOrganizer {
    pub fn new(base_dir: impl Into<PathBuf>, labels: Option<BTreeMap<String, String>>) -> Self {
        Self {
            base_dir: base_dir.into(),
            output_file: "dataset.json".to_string(),
            labels: labels.unwrap_or_else(default_labels),
            seed: 42,
        }
    }

    pub fn create_directories(&self) -> Result<()> {
        for dir in DIRECTORIES {
            fs::create_dir_all(self.base_dir.join(dir))?;
        }
        Ok(())
    }

    /// Pair volumes with segmentations in order and move `val_split` of the
    /// pairs (rounded down) to validation after a seeded shuffle.
    fn split(&self, pairs: Vec<Pair>, val_split: Option<f64>) -> (Vec<Pair>, Vec<Pair>) {
        let Some(fraction) = val_split else {
            return (pairs, Vec::new());
        };
        let mut pairs = pairs;
        pairs.shuffle(&mut StdRng::seed_from_u64(self.seed));
        let split_idx = ((pairs.len() as f64) * fraction) as usize;
        let train = pairs.split_off(split_idx.min(pairs.len()));
        (train, pairs)
    }

    pub fn organize_dataset(
        &self,
        train_volumes: &[PathBuf],
        test_volumes: &[PathBuf],
        train_segmentations: &[PathBuf],
        val_split: Option<f64>,
    ) -> Result<()> {
        if train_volumes.len() != train_segmentations.len() {
            return Err(Error::InvalidArgument(format!(
                "{} training volumes but {} segmentations",
                train_volumes.len(),
                train_segmentations.len()
            )));
        }
        let pairs = train_volumes
            .iter()
            .cloned()
            .zip(train_segmentations.iter().cloned())
            .collect();
        let (train, validation) = self.split(pairs, val_split);

        for (targets, pairs) in [(("imagesTr", "labelsTr"), &train), (("imagesVal", "labelsVal"), &validation)] {
            for (volume, segmentation) in pairs {
                move_file(volume, &self.base_dir.join(targets.0))?;
                move_file(segmentation, &self.base_dir.join(targets.1))?;
            }
        }
        for volume in test_volumes {
            move_file(volume, &self.base_dir.join("imagesTs"))?;
        }
        info!(train = train.len(), validation = validation.len(), test = test_volumes.len(), "organized dataset");
        Ok(())
    }

    fn relative(&self, dir: &str) -> Result<Vec<String>> {
        Ok(list_inputs(&self.base_dir.join(dir), &[".nii.gz"])?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .map(|name| format!("{dir}/{name}"))
            .collect())
    }

    /// Describe the current folder content. Images and labels are paired in
    /// sorted order.
    pub fn dataset_json(&self) -> Result<DatasetJson> {
        let pair = |images: Vec<String>, labels: Vec<String>| -> Vec<DatasetPair> {
            images
                .into_iter()
                .zip(labels)
                .map(|(image, label)| DatasetPair { image, label })
                .collect()
        };
        Ok(DatasetJson {
            description: "Medical Image Dataset".to_string(),
            labels: self.labels.clone(),
            licence: "cc-by-sa-4.0".to_string(),
            training: pair(self.relative("imagesTr")?, self.relative("labelsTr")?),
            validation: pair(self.relative("imagesVal")?, self.relative("labelsVal")?),
            test: self.relative("imagesTs")?,
        })
    }

    pub fn generate_dataset_json(&self) -> Result<PathBuf> {
        let json = self.dataset_json()?;
        let mut buffer = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
        json.serialize(&mut serializer)?;
        let path = self.base_dir.join(&self.output_file);
        fs::write(&path, buffer)?;
        info!(path = %path.display(), "wrote dataset description");
        Ok(path)
    }

    pub fn prepare_dataset(
        &self,
        train_volumes: &[PathBuf],
        test_volumes: &[PathBuf],
        train_segmentations: &[PathBuf],
        val_split: Option<f64>,
    ) -> Result<PathBuf> {
        self.create_directories()?;
        self.organize_dataset(train_volumes, test_volumes, train_segmentations, val_split)?;
        self.generate_dataset_json()
    }
}
