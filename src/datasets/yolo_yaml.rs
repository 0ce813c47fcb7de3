use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// The `dataset.yaml` consumed by YOLO training.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YoloDatasetYaml {
    pub train: String,
    pub val: String,
    pub nc: usize,
    pub names: Vec<String>,
}

impl YoloDatasetYaml {
    /// # Errors
    ///
    /// `InvalidArgument` when `nc` differs from the number of names.
    pub fn new(train: impl Into<String>, val: impl Into<String>, nc: usize, names: Vec<String>) -> Result<Self> {
        if nc != names.len() {
            return Err(Error::InvalidArgument(format!(
                "the number of classes (nc={nc}) must equal the number of class names ({})",
                names.len()
            )));
        }
        Ok(Self {
            train: train.into(),
            val: val.into(),
            nc,
            names,
        })
    }

    pub fn render(&self) -> String {
        let names = self
            .names
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = String::new();
        let _ = writeln!(out, "train: {}", self.train);
        let _ = writeln!(out, "val: {}", self.val);
        out.push('\n');
        let _ = writeln!(out, "nc: {}", self.nc);
        let _ = writeln!(out, "names: [{names}]");
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_yolo_layout() {
        let yaml = YoloDatasetYaml::new("data/train", "data/valid", 2, vec!["kidney".into(), "stone".into()]).unwrap();
        assert_eq!(
            yaml.render(),
            "train: data/train\nval: data/valid\n\nnc: 2\nnames: [\"kidney\", \"stone\"]\n"
        );
    }

    #[test]
    fn class_count_must_match() {
        assert!(YoloDatasetYaml::new("a", "b", 3, vec!["x".into()]).is_err());
    }
}
