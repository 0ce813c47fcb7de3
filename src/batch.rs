//! Best-effort batch processing shared by the converters.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};
use web_time::Instant;

use crate::error::{Error, Result};

/// Outcome of a batch: what was written and what failed, with the reason.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub converted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, output: PathBuf) {
        self.converted.push(output);
    }

    pub fn record_failure(&mut self, input: &Path, reason: impl Display) {
        error!(input = %input.display(), "{reason}");
        self.failed.push((input.to_path_buf(), reason.to_string()));
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.converted.extend(other.converted);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.converted.is_empty() && self.failed.is_empty()
    }

    pub fn log_summary(&self, operation: &str, started: Instant) {
        info!(
            operation,
            converted = self.converted.len(),
            failed = self.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
    }
}

/// A per-file converter. `convert` accepts a single file or a directory whose
/// matching files are converted one by one; a failing file is logged and the
/// batch continues.
pub trait Converter {
    /// Name used in log output.
    fn name(&self) -> &'static str;

    /// Accepted file name suffixes, e.g. `".nii.gz"`.
    fn extensions(&self) -> &[&'static str];

    /// Convert one input file, returning the files written.
    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>>;

    fn convert(&self, input: &Path, output_dir: &Path) -> Result<BatchReport> {
        run_batch(self, input, output_dir)
    }
}

/// Convert every file `converter` accepts under `input` into `output_dir`.
pub fn run_batch<C: Converter + ?Sized>(
    converter: &C,
    input: &Path,
    output_dir: &Path,
) -> Result<BatchReport> {
    let started = Instant::now();
    if !input.exists() {
        error!(input = %input.display(), "input path does not exist");
        return Ok(BatchReport::new());
    }
    let inputs = list_inputs(input, converter.extensions())?;
    if inputs.is_empty() {
        warn!(input = %input.display(), "no matching files found");
    }
    fs::create_dir_all(output_dir)?;

    let mut report = BatchReport::new();
    for file in inputs {
        match converter.convert_file(&file, output_dir) {
            Ok(outputs) => {
                info!(input = %file.display(), outputs = outputs.len(), "converted");
                outputs.into_iter().for_each(|output| report.record_success(output));
            }
            Err(err) => report.record_failure(&file, err),
        }
    }
    report.log_summary(converter.name(), started);
    Ok(report)
}

/// Whether the file name of `path` ends with one of `extensions`
/// (case-insensitive).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| name.ends_with(&ext.to_ascii_lowercase()))
}

/// A single file as-is, or the sorted matching files of a directory
/// (non-recursive).
pub fn list_inputs(path: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && has_extension(p, extensions))
        .collect();
    files.sort();
    Ok(files)
}

/// `dir/<base>.<ext>`, or `dir/<base>_<n>.<ext>` with the smallest `n` that
/// does not exist yet.
pub fn unique_output(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{base}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{base}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Copier;

    impl Converter for Copier {
        fn name(&self) -> &'static str {
            "copy"
        }

        fn extensions(&self) -> &[&'static str] {
            &[".txt"]
        }

        fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
            let text = fs::read_to_string(input)?;
            if text == "bad" {
                return Err(Error::InvalidArgument("bad content".to_string()));
            }
            let output = output_dir.join(input.file_name().unwrap_or_default());
            fs::write(&output, text)?;
            Ok(vec![output])
        }
    }

    #[test]
    fn failing_item_does_not_stop_batch() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        fs::write(input.path().join("a.txt"), "ok").unwrap();
        fs::write(input.path().join("b.txt"), "bad").unwrap();
        fs::write(input.path().join("c.TXT"), "ok").unwrap();
        fs::write(input.path().join("d.csv"), "ignored").unwrap();

        let report = Copier.convert(input.path(), output.path()).unwrap();
        assert_eq!(report.converted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("b.txt"));
    }

    #[test]
    fn missing_input_gives_empty_report() {
        let output = tempdir().unwrap();
        let report = Copier
            .convert(&output.path().join("missing"), output.path())
            .unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn listing_missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        let result = list_inputs(&dir.path().join("missing"), &[".txt"]);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn unique_output_appends_counter() {
        let dir = tempdir().unwrap();
        let first = unique_output(dir.path(), "series", "nii.gz");
        assert!(first.ends_with("series.nii.gz"));
        fs::write(&first, b"").unwrap();
        let second = unique_output(dir.path(), "series", "nii.gz");
        assert!(second.ends_with("series_1.nii.gz"));
    }

    #[test]
    fn extensions_match_compound_suffixes() {
        assert!(has_extension(Path::new("a/ct.NII.GZ"), &[".nii.gz"]));
        assert!(!has_extension(Path::new("a/ct.gz"), &[".nii.gz"]));
    }
}
