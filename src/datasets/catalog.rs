//! Public datasets that can be downloaded ready to train on.

use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Archives smaller than this are treated as failed downloads.
const MIN_ARCHIVE_SIZE: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Segmentation,
    Detection,
}

/// A downloadable dataset and its subgroups (subsets of cases).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatasetEntry {
    /// Identifier used on the command line.
    pub name: &'static str,
    /// Archive and folder prefix, e.g. `spleen` for `spleenall.zip`.
    pub file_prefix: &'static str,
    pub task: Task,
    pub description: &'static str,
    pub cases: usize,
    pub source: &'static str,
    /// Subgroup name and file id.
    pub subgroups: &'static [(&'static str, &'static str)],
}

const DECATHLON: &str = "http://medicaldecathlon.com/";
const TOTAL_SEGMENTATOR: &str = "https://zenodo.org/records/10047292";

pub static CATALOG: &[DatasetEntry] = &[
    DatasetEntry {
        name: "spleen",
        file_prefix: "spleen",
        task: Task::Segmentation,
        description: "Spleen CT volumes from the Medical Segmentation Decathlon.",
        cases: 41,
        source: DECATHLON,
        subgroups: &[("all", "1wdtW2nGSwINyIeo9Fz-XR8qmgAcptxQd")],
    },
    DatasetEntry {
        name: "hippocampus",
        file_prefix: "hippocampus",
        task: Task::Segmentation,
        description: "Hippocampus volumes from the Medical Segmentation Decathlon.",
        cases: 260,
        source: DECATHLON,
        subgroups: &[
            ("100", "1ptHJt0N4D01Jc7k3mrlzL_YIlY-GQijA"),
            ("all", "1MGUJuXOHKWJoOXv22FNunTVX0HfsVxQN"),
        ],
    },
    DatasetEntry {
        name: "colon",
        file_prefix: "colon",
        task: Task::Segmentation,
        description: "Colon cancer CT volumes from the Medical Segmentation Decathlon.",
        cases: 126,
        source: DECATHLON,
        subgroups: &[
            ("100", "1w1q-1L37ybWCy0sSU3EJLuLp0KFcGK6M"),
            ("all", "1C8aQ5GrBWP9lVwfqDntmbd-rusbU_OOz"),
        ],
    },
    DatasetEntry {
        name: "clavicula-left",
        file_prefix: "clavicula_left",
        task: Task::Segmentation,
        description: "Left clavicle CT volumes from the TotalSegmentator dataset.",
        cases: 1225,
        source: TOTAL_SEGMENTATOR,
        subgroups: &[
            ("100", "1QH6LqUqmUhyCtmEkELdmbJrgt3UWW4jx"),
            ("200", "1R88IqrV6Ji5e43dbY6Kzm-cIMLqqRavS"),
            ("400", "1dAD3254kX1u6IdU9msCx4dj2qEGTgJrd"),
            ("all", "1kkRuXmfA2SLzoLVZF67DEw5ZDsCUC7tA"),
        ],
    },
    DatasetEntry {
        name: "sternum",
        file_prefix: "sternum",
        task: Task::Segmentation,
        description: "Sternum CT volumes from the TotalSegmentator dataset.",
        cases: 1225,
        source: TOTAL_SEGMENTATOR,
        subgroups: &[
            ("100", "13kOMK3OLe9hdLFLZ-2PvUfK2v40URoRD"),
            ("200", "1RWDhONHOiqTruQy96ADsO2lWQ-QuAJj3"),
            ("400", "1S_oLp2DhHX7x0J1aYnrGR6Vn4dZAkZCZ"),
            ("all", "1tusEJmrnW_BEkwBiRCXbnRqEFtT5ScdK"),
        ],
    },
    DatasetEntry {
        name: "thyroid-gland",
        file_prefix: "thyroid_gland",
        task: Task::Segmentation,
        description: "Thyroid gland CT volumes from the TotalSegmentator dataset.",
        cases: 1225,
        source: TOTAL_SEGMENTATOR,
        subgroups: &[
            ("100", "1HCIbxXq83hEvQl6tC4QD8jRAQ3mP9BkR"),
            ("200", "106x-xK8L9_2Cs2sn6Rt5UBffWv5KRZ5a"),
            ("400", "1JNy1crJwnSFzcoq1VhFRA8pzfVd8zE6k"),
            ("all", "1n1TM8lSnNLPguzpRfjSD1hOXuEMUwgT5"),
        ],
    },
    DatasetEntry {
        name: "vertebrae-l5",
        file_prefix: "vertebrae_l5",
        task: Task::Segmentation,
        description: "L5 vertebra CT volumes from the TotalSegmentator dataset.",
        cases: 1225,
        source: TOTAL_SEGMENTATOR,
        subgroups: &[
            ("100", "1YRnAcZVAUit6mktzfCG1W29Ea6Mg9jKW"),
            ("200", "16icqak625k7JdayigzHYKMyRytWr77XX"),
            ("400", "1PRZgq_0F51f4JTB6UWzbh94UByLzgKBZ"),
            ("all", "1VcJ_3U5vp74exq85YZlRLpCpv4Ldo0TJ"),
        ],
    },
    DatasetEntry {
        name: "panoramic-mandible",
        file_prefix: "pan_mandible",
        task: Task::Segmentation,
        description: "Panoramic dental X-rays of 116 patients with manually segmented mandibles (2D).",
        cases: 116,
        source: "https://data.mendeley.com/datasets/hxt48yk462/2",
        subgroups: &[("all", "12G07KVxcHic_TsSG2FAQHw9hMs29_Iyy")],
    },
    DatasetEntry {
        name: "kidney-stone",
        file_prefix: "kidney_stone",
        task: Task::Detection,
        description: "2D images with kidney stone bounding boxes.",
        cases: 1300,
        source: "https://universe.roboflow.com/selam-h8tid/kidney-stone-detection-fwubk/dataset/1",
        subgroups: &[("all", "1bSOeebGa92qc42CiIqUcfZjOWC2rdlrE")],
    },
];

pub fn find(name: &str) -> Option<&'static DatasetEntry> {
    CATALOG.iter().find(|entry| entry.name.eq_ignore_ascii_case(name))
}

impl DatasetEntry {
    pub fn info(&self) -> String {
        let subgroups: Vec<&str> = self.subgroups.iter().map(|(name, _)| *name).collect();
        let mut text = String::new();
        let _ = writeln!(text, "{} ({:?})", self.name, self.task);
        let _ = writeln!(text, "{}", self.description);
        let _ = writeln!(text, "Total cases: {}", self.cases);
        let _ = writeln!(text, "Subgroups: {}", subgroups.join(", "));
        let _ = write!(text, "Source: {}", self.source);
        text
    }

    pub fn download_url(&self, subgroup: &str) -> Result<String> {
        let (_, id) = self
            .subgroups
            .iter()
            .find(|(name, _)| *name == subgroup)
            .ok_or_else(|| Error::InvalidArgument(format!("no subgroup {subgroup} for {}", self.name)))?;
        Ok(format!("https://drive.google.com/uc?export=download&id={id}&confirm=t"))
    }

    /// Download `subgroup` into `dest` and unpack it. The archive is removed
    /// afterwards, whether unpacking succeeded or not.
    pub async fn download(&self, subgroup: &str, dest: &Path) -> Result<PathBuf> {
        let url = self.download_url(subgroup)?;
        tokio::fs::create_dir_all(dest).await?;
        let archive = dest.join(format!("{}{}.zip", self.file_prefix, subgroup));

        let result = match fetch(&url, &archive).await {
            Ok(()) => extract_archive(&archive, dest),
            Err(err) => Err(err),
        };
        if archive.exists() {
            if let Err(err) = tokio::fs::remove_file(&archive).await {
                warn!(path = %archive.display(), "could not delete archive: {err}");
            }
        }
        result?;
        info!(dataset = self.name, subgroup, dest = %dest.display(), "downloaded and extracted");
        Ok(dest.to_path_buf())
    }
}

async fn fetch(url: &str, target: &Path) -> Result<()> {
    info!(url, "downloading");
    let response = reqwest::get(url).await?.error_for_status()?;
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Unpack `archive` into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let size = std::fs::metadata(archive)?.len();
    if size < MIN_ARCHIVE_SIZE {
        return Err(Error::Download(format!(
            "downloaded file is only {size} bytes, expected an archive"
        )));
    }
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    zip.extract(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<_> = CATALOG.iter().map(|e| e.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
        assert!(CATALOG.iter().all(|e| e.subgroups.iter().any(|(s, _)| *s == "all")));
    }

    #[test]
    fn urls_use_drive_download_form() {
        let spleen = find("Spleen").unwrap();
        assert_eq!(
            spleen.download_url("all").unwrap(),
            "https://drive.google.com/uc?export=download&id=1wdtW2nGSwINyIeo9Fz-XR8qmgAcptxQd&confirm=t"
        );
        assert!(spleen.info().contains("Total cases: 41"));
    }

    #[tokio::test]
    async fn unknown_subgroup_is_rejected_before_download() {
        let dir = tempdir().unwrap();
        let result = find("spleen").unwrap().download("100", dir.path()).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn small_archives_are_rejected() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("tiny.zip");
        std::fs::write(&archive, b"<html>quota exceeded</html>").unwrap();
        assert!(matches!(extract_archive(&archive, dir.path()), Err(Error::Download(_))));
    }

    #[test]
    fn extracts_archive_content() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("data.zip");
        let mut writer = ZipWriter::new(File::create(&archive).unwrap());
        writer
            .start_file(
                "spleen/imagesTr/case.txt",
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(&vec![b'x'; 4096]).unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();
        assert!(dest.join("spleen/imagesTr/case.txt").exists());
    }
}
