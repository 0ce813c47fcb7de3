use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::batch::Converter;
use crate::converters::NIFTI_EXTENSIONS;
use crate::error::Result;
use crate::io::{case_name, read_nifti};
use crate::mesh::TriangleMesh;
use crate::volume::Volume;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MeshMode {
    /// Every non-zero voxel in one `<case>.stl`
    Merged,
    /// One `<case>_<label>.stl` per label
    PerLabel,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmoothingOptions {
    pub iterations: usize,
    pub pass_band: f32,
}

impl Default for SmoothingOptions {
    fn default() -> Self {
        Self {
            iterations: 150,
            pass_band: 0.05,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StlOptions {
    pub mode: MeshMode,
    pub smoothing: Option<SmoothingOptions>,
    /// Fraction of triangles to remove, 0..1.
    pub target_reduction: Option<f32>,
    /// Block-average the labels by this factor before meshing.
    pub downsample: Option<usize>,
}

impl Default for StlOptions {
    fn default() -> Self {
        Self::merged()
    }
}

impl StlOptions {
    /// All classes as one surface, heavily smoothed.
    pub fn merged() -> Self {
        Self {
            mode: MeshMode::Merged,
            smoothing: Some(SmoothingOptions::default()),
            target_reduction: None,
            downsample: None,
        }
    }

    /// One surface per label, lightly smoothed and halved in size.
    pub fn per_label() -> Self {
        Self {
            mode: MeshMode::PerLabel,
            smoothing: Some(SmoothingOptions {
                iterations: 50,
                ..SmoothingOptions::default()
            }),
            target_reduction: Some(0.5),
            downsample: None,
        }
    }

    /// Per label on a grid downsampled by two: small files, coarse meshes.
    pub fn fast() -> Self {
        Self {
            mode: MeshMode::PerLabel,
            smoothing: Some(SmoothingOptions::default()),
            target_reduction: None,
            downsample: Some(2),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NiftiToStlConverter {
    pub options: StlOptions,
}

impl NiftiToStlConverter {
    pub fn new(options: StlOptions) -> Self {
        Self { options }
    }

    fn mesh_mask(&self, mask: &Volume) -> Result<Option<TriangleMesh>> {
        let mask = match self.options.downsample {
            Some(factor) if factor > 1 => mask.downsample_mean(factor),
            _ => mask.clone(),
        };
        // averaged blocks count as inside from half coverage on
        let binary = mask.threshold_mask(0.5);
        let Some(mut mesh) = TriangleMesh::extract_isosurface(&binary, &mask)? else {
            return Ok(None);
        };
        if let Some(smoothing) = self.options.smoothing {
            mesh.smooth(smoothing.iterations, smoothing.pass_band);
        }
        if let Some(reduction) = self.options.target_reduction {
            mesh.decimate(reduction);
        }
        Ok(Some(mesh))
    }
}

impl Converter for NiftiToStlConverter {
    fn name(&self) -> &'static str {
        "nifti to stl"
    }

    fn extensions(&self) -> &[&'static str] {
        NIFTI_EXTENSIONS
    }

    fn convert_file(&self, input: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let labels = read_nifti(input)?;
        let case = case_name(input);

        let masks: Vec<(PathBuf, Volume)> = match self.options.mode {
            MeshMode::Merged => {
                let mask = labels.data.mapv(|v| if v >= 1.0 { 1.0 } else { 0.0 });
                vec![(output_dir.join(format!("{case}.stl")), labels.with_data(mask, labels.pixel_type))]
            }
            MeshMode::PerLabel => labels
                .unique_labels()
                .into_iter()
                .map(|label| {
                    let mask = labels.label_mask(label).mapv(f32::from);
                    (
                        output_dir.join(format!("{case}_{label}.stl")),
                        labels.with_data(mask, labels.pixel_type),
                    )
                })
                .collect(),
        };

        let mut written = Vec::new();
        for (path, mask) in masks {
            match self.mesh_mask(&mask)? {
                Some(mesh) => {
                    mesh.write_stl(&path)?;
                    debug!(path = %path.display(), triangles = mesh.triangle_count(), "wrote mesh");
                    written.push(path);
                }
                None => warn!(path = %path.display(), "no surface found, skipping"),
            }
        }
        Ok(written)
    }
}
