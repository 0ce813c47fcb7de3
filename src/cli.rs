//! Command line front end of the `medtk` binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use web_time::Instant;

use crate::batch::{BatchReport, Converter, has_extension, list_inputs};
use crate::config::Config;
use crate::converters::nifti_to_dicom_seg::SegmentDescription;
use crate::converters::{
    DicomToNiftiConverter, DicomToNrrdConverter, MeshMode, NIFTI_EXTENSIONS, NiftiToDicomConverter,
    NiftiToDicomRt, NiftiToDicomSeg, NiftiToNrrdConverter, NiftiToStlConverter,
    NrrdToDicomConverter, NrrdToNiftiConverter, SmoothingOptions, StlOptions,
};
use crate::datasets::{
    CATALOG, DataSplitter, MonaiDatasetOrganizer, MultiClassNiftiMerger, PngToTxtConverterMc,
    PngToTxtConverterMl, YoloDatasetYaml, catalog, check_consistency,
};
use crate::enums::{Interpolation, Orientation, SortBy};
use crate::io::read_volume;
use crate::preprocessing::{
    DicomAnonymizer, DicomCtWindowing, DicomMriWindowing, NiftiCtWindowing, NiftiMriWindowing, Window,
};
use crate::volume::DisplayWindow;
use crate::volume_loader::VolumeLoader;

#[derive(Debug, Parser)]
#[command(
    name = "medtk",
    version,
    about = "Convert, preprocess and organize medical images for deep learning"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file with default options
    #[arg(long, global = true, env = "MEDTK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true, env = "MEDTK_LOG_JSON")]
    pub log_json: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct InputOutput {
    /// Input file or directory
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct ToDicomArgs {
    #[command(flatten)]
    pub io: InputOutput,

    #[arg(long)]
    pub modality: Option<String>,

    #[arg(long)]
    pub series_description: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MaskLayout {
    /// One mask per image, classes as gray values
    #[default]
    MultiClass,
    /// One folder per image with one binary mask per class
    MultiLabel,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert every DICOM series below a directory to NIfTI
    Dicom2nifti {
        #[command(flatten)]
        io: InputOutput,
        /// Directories with fewer .dcm files are ignored
        #[arg(long)]
        min_images: Option<usize>,
    },
    /// Convert every DICOM series below a directory to NRRD
    Dicom2nrrd {
        #[command(flatten)]
        io: InputOutput,
        #[arg(long)]
        min_images: Option<usize>,
        /// Output file name instead of the series directory name
        #[arg(long)]
        name: Option<String>,
    },
    Nifti2nrrd(InputOutput),
    Nrrd2nifti(InputOutput),
    Nrrd2dicom(ToDicomArgs),
    Nifti2dicom(ToDicomArgs),
    /// Write axial slices of NIfTI volumes and segmentations as PNG
    Nifti2png {
        /// Directory (or file) of intensity volumes
        #[arg(long, required_unless_present = "segmentations")]
        volumes: Option<PathBuf>,
        /// Directory (or file) of label maps
        #[arg(long)]
        segmentations: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        min: Option<f32>,
        #[arg(long, allow_negative_numbers = true)]
        max: Option<f32>,
    },
    /// Build STL surfaces from NIfTI label maps
    Nifti2stl {
        #[command(flatten)]
        io: InputOutput,
        #[arg(long, value_enum)]
        mode: Option<MeshMode>,
        /// Per label on a grid downsampled by two
        #[arg(long, conflicts_with = "mode")]
        fast: bool,
        /// Smoothing iterations, 0 disables smoothing
        #[arg(long)]
        iterations: Option<usize>,
        /// Fraction of triangles to remove
        #[arg(long)]
        reduction: Option<f32>,
    },
    /// Store a NIfTI mask as a DICOM Segmentation of a reference series
    Nifti2seg {
        /// Reference DICOM series directory
        #[arg(long)]
        dicom: PathBuf,
        #[arg(long)]
        nifti: PathBuf,
        /// Output .dcm file
        #[arg(short, long)]
        output: PathBuf,
        /// One segment per `LABEL=NAME`; without any, all foreground is one segment
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(i32, String)>,
        /// Name of the merged segment
        #[arg(long, conflicts_with = "labels")]
        name: Option<String>,
    },
    /// Store a NIfTI mask as an RT Structure Set of a reference series
    Nifti2rt {
        #[arg(long)]
        nifti: PathBuf,
        #[arg(long)]
        dicom: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// One ROI per `LABEL=NAME`
        #[arg(long = "label", value_parser = parse_label, required = true)]
        labels: Vec<(i32, String)>,
    },
    /// Clip CT intensities to a window and rescale them to 0-255
    CtWindow {
        /// DICOM directories, or a single NIfTI file
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<PathBuf>,
        /// Output directory, or output file for NIfTI input
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        center: Option<f64>,
        #[arg(long)]
        width: Option<f64>,
    },
    /// Window MR intensities to mean ± coef standard deviations
    MriWindow {
        /// DICOM directory or NIfTI file
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        coef: Option<f64>,
    },
    /// Replace identifying attributes of a DICOM directory
    Anonymize {
        #[arg(short, long, required_unless_present = "list_fields")]
        input: Option<PathBuf>,
        #[arg(short, long, required_unless_present = "list_fields")]
        output: Option<PathBuf>,
        /// Attribute to replace, repeatable
        #[arg(long = "field", required_unless_present = "list_fields")]
        fields: Vec<String>,
        /// Print the attributes that can be anonymized
        #[arg(long)]
        list_fields: bool,
    },
    /// Split paired image and label folders into train and valid
    Split {
        #[arg(long)]
        images: PathBuf,
        #[arg(long)]
        labels: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        train_size: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Remove the input folders after copying
        #[arg(long)]
        delete_input: bool,
    },
    /// Combine per-class binary masks into one label map per volume
    Merge {
        /// Directory of volumes
        #[arg(long)]
        volumes: PathBuf,
        /// One directory per class, in label order
        #[arg(long = "classes", num_args = 1.., required = true)]
        class_dirs: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = ".nii.gz")]
        ext: String,
        /// Also copy the volumes to `<output>/volumes`
        #[arg(long)]
        move_volumes: bool,
    },
    /// Arrange volumes and labels in the MONAI layout and write dataset.json
    Monai {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        train_volumes: PathBuf,
        #[arg(long)]
        train_labels: PathBuf,
        #[arg(long)]
        test_volumes: Option<PathBuf>,
        /// Fraction of training pairs moved to validation
        #[arg(long)]
        val_split: Option<f64>,
        /// Label names as `LABEL=NAME`
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(i32, String)>,
    },
    /// Write a YOLO dataset.yaml
    YoloYaml {
        #[arg(long)]
        train: String,
        #[arg(long)]
        val: String,
        /// Comma separated class names
        #[arg(long, value_delimiter = ',', required = true)]
        names: Vec<String>,
        /// Number of classes, defaults to the number of names
        #[arg(long)]
        nc: Option<usize>,
        #[arg(short, long, default_value = "dataset.yaml")]
        output: PathBuf,
    },
    /// Convert PNG masks into YOLO polygon labels
    Mask2txt {
        #[command(flatten)]
        io: InputOutput,
        #[arg(long, value_enum, default_value_t)]
        layout: MaskLayout,
        #[arg(long)]
        epsilon: Option<f64>,
    },
    /// Render one orthogonal slice of a volume to PNG
    Preview {
        /// NIfTI or NRRD file, or DICOM directory
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "axial")]
        orientation: Orientation,
        /// Slice index, defaults to the middle slice
        #[arg(long)]
        index: Option<usize>,
        #[arg(long, allow_negative_numbers = true, requires = "width")]
        center: Option<f32>,
        #[arg(long, requires = "center")]
        width: Option<f32>,
        /// Interpolate coronal and sagittal slices to isotropic aspect
        #[arg(long)]
        interpolate: bool,
    },
    /// Browse and download public datasets
    Datasets {
        #[command(subcommand)]
        command: DatasetsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DatasetsCommand {
    List,
    Info {
        name: String,
    },
    Download {
        name: String,
        #[arg(long, default_value = "all")]
        subgroup: String,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

/// `LABEL=NAME`, e.g. `1=liver`.
fn parse_label(value: &str) -> Result<(i32, String), String> {
    let (label, name) = value
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=NAME, got `{value}`"))?;
    let label = label
        .trim()
        .parse()
        .map_err(|_| format!("invalid label `{label}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name for label {label}"));
    }
    Ok((label, name.to_string()))
}

fn ensure_exists(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        bail!("input path does not exist: {}", path.display());
    }
    Ok(())
}

fn finish(operation: &str, report: &BatchReport, started: Instant) {
    report.log_summary(operation, started);
    println!(
        "{operation}: {} written, {} failed",
        report.converted.len(),
        report.failed.len()
    );
    for (input, reason) in &report.failed {
        eprintln!("  {}: {reason}", input.display());
    }
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = Config::load(self.config.as_deref()).context("could not read configuration")?;
        self.command.run(&config).await
    }
}

impl Command {
    pub async fn run(self, config: &Config) -> anyhow::Result<()> {
        let started = Instant::now();
        match self {
            Command::Dicom2nifti { io, min_images } => {
                ensure_exists(&io.input)?;
                let min_images = min_images.unwrap_or(config.series.min_images_per_series);
                let report = DicomToNiftiConverter::new(min_images).convert(&io.input, &io.output)?;
                finish("dicom2nifti", &report, started);
            }
            Command::Dicom2nrrd {
                io,
                min_images,
                name,
            } => {
                ensure_exists(&io.input)?;
                let min_images = min_images.unwrap_or(config.series.min_images_per_series);
                let report = DicomToNrrdConverter::new(min_images, name).convert(&io.input, &io.output)?;
                finish("dicom2nrrd", &report, started);
            }
            Command::Nifti2nrrd(io) => {
                ensure_exists(&io.input)?;
                finish("nifti2nrrd", &NiftiToNrrdConverter.convert(&io.input, &io.output)?, started);
            }
            Command::Nrrd2nifti(io) => {
                ensure_exists(&io.input)?;
                finish("nrrd2nifti", &NrrdToNiftiConverter.convert(&io.input, &io.output)?, started);
            }
            Command::Nrrd2dicom(args) => {
                ensure_exists(&args.io.input)?;
                let converter = NrrdToDicomConverter::new(dicom_options(config, &args));
                finish("nrrd2dicom", &converter.convert(&args.io.input, &args.io.output)?, started);
            }
            Command::Nifti2dicom(args) => {
                ensure_exists(&args.io.input)?;
                let converter = NiftiToDicomConverter::new(dicom_options(config, &args));
                finish("nifti2dicom", &converter.convert(&args.io.input, &args.io.output)?, started);
            }
            Command::Nifti2png {
                volumes,
                segmentations,
                output,
                min,
                max,
            } => {
                for path in volumes.iter().chain(&segmentations) {
                    ensure_exists(path)?;
                }
                let mut converter = config.png.clone();
                converter.min_v = min.unwrap_or(converter.min_v);
                converter.max_v = max.unwrap_or(converter.max_v);
                if converter.min_v >= converter.max_v {
                    bail!("--min must be lower than --max");
                }
                let report = converter.run(volumes.as_deref(), segmentations.as_deref(), &output)?;
                finish("nifti2png", &report, started);
            }
            Command::Nifti2stl {
                io,
                mode,
                fast,
                iterations,
                reduction,
            } => {
                ensure_exists(&io.input)?;
                let options = stl_options(config, mode, fast, iterations, reduction)?;
                let report = NiftiToStlConverter::new(options).convert(&io.input, &io.output)?;
                finish("nifti2stl", &report, started);
            }
            Command::Nifti2seg {
                dicom,
                nifti,
                output,
                labels,
                name,
            } => {
                ensure_exists(&dicom)?;
                ensure_exists(&nifti)?;
                let mut converter = NiftiToDicomSeg::new(&dicom, &nifti)?.with_metadata(config.seg.clone());
                if !labels.is_empty() {
                    converter = converter.with_segments(
                        labels
                            .into_iter()
                            .map(|(label, name)| SegmentDescription::new(Some(label), name))
                            .collect(),
                    );
                } else if let Some(name) = name {
                    converter = converter.with_segments(vec![SegmentDescription::new(None, name)]);
                }
                let dims = converter.dimensions();
                info!(reference = ?dims.reference, mask = ?dims.mask, "segmentation inputs");
                let path = converter.save_segmentation(&output)?;
                println!("nifti2seg: wrote {}", path.display());
            }
            Command::Nifti2rt {
                nifti,
                dicom,
                output,
                labels,
            } => {
                ensure_exists(&dicom)?;
                ensure_exists(&nifti)?;
                let classes: BTreeMap<i32, String> = labels.into_iter().collect();
                let path = NiftiToDicomRt::new(&nifti, &dicom, classes)?.convert(&output)?;
                println!("nifti2rt: wrote {}", path.display());
            }
            Command::CtWindow {
                input,
                output,
                center,
                width,
            } => {
                input.iter().try_for_each(|path| ensure_exists(path))?;
                let window = Window::new(
                    center.unwrap_or(config.window.center),
                    width.unwrap_or(config.window.width),
                );
                match input.as_slice() {
                    [file] if file.is_file() && has_extension(file, NIFTI_EXTENSIONS) => {
                        let path = NiftiCtWindowing::new(window).convert(file, &output)?;
                        println!("ct-window: wrote {}", path.display());
                    }
                    inputs => {
                        let windowing = DicomCtWindowing::new(window);
                        let report = match inputs {
                            [dir] => windowing.process_directory(dir, &output)?,
                            dirs => windowing.process_directories(dirs, &output)?,
                        };
                        finish("ct-window", &report, started);
                    }
                }
            }
            Command::MriWindow {
                input,
                output,
                coef,
            } => {
                ensure_exists(&input)?;
                let coef = coef.unwrap_or(config.mri.coef);
                if input.is_file() && has_extension(&input, NIFTI_EXTENSIONS) {
                    let path = NiftiMriWindowing::new(coef).convert(&input, &output)?;
                    println!("mri-window: wrote {}", path.display());
                } else {
                    let report = DicomMriWindowing::new(coef).window_series(&input, &output)?;
                    finish("mri-window", &report, started);
                }
            }
            Command::Anonymize {
                input,
                output,
                fields,
                list_fields,
            } => {
                if list_fields {
                    for field in DicomAnonymizer::list_fields() {
                        println!("{field}");
                    }
                    return Ok(());
                }
                let (Some(input), Some(output)) = (input, output) else {
                    bail!("--input and --output are required");
                };
                ensure_exists(&input)?;
                let mut anonymizer = DicomAnonymizer::new(fields.as_slice())?;
                finish("anonymize", &anonymizer.anonymize_directory(&input, &output)?, started);
            }
            Command::Split {
                images,
                labels,
                output,
                train_size,
                seed,
                delete_input,
            } => {
                ensure_exists(&images)?;
                ensure_exists(&labels)?;
                let mut options = config.split;
                options.train_size = train_size.unwrap_or(options.train_size);
                options.random_state = seed.unwrap_or(options.random_state);
                options.delete_input |= delete_input;
                let (images, _) = DataSplitter::new(images, labels, &output, options).run()?;
                println!("split: {} train, {} valid", images.train.len(), images.valid.len());
                for mismatch in check_consistency(&output)? {
                    warn!(file = mismatch.as_str(), "image without matching label");
                }
            }
            Command::Merge {
                volumes,
                class_dirs,
                output,
                ext,
                move_volumes,
            } => {
                ensure_exists(&volumes)?;
                class_dirs.iter().try_for_each(|dir| ensure_exists(dir))?;
                let report =
                    MultiClassNiftiMerger::process_directories(&volumes, &class_dirs, &output, &ext, move_volumes)?;
                finish("merge", &report, started);
            }
            Command::Monai {
                base,
                train_volumes,
                train_labels,
                test_volumes,
                val_split,
                labels,
            } => {
                ensure_exists(&train_volumes)?;
                ensure_exists(&train_labels)?;
                let volumes = list_inputs(&train_volumes, NIFTI_EXTENSIONS)?;
                let segmentations = list_inputs(&train_labels, NIFTI_EXTENSIONS)?;
                let tests = match &test_volumes {
                    Some(dir) => list_inputs(dir, NIFTI_EXTENSIONS)?,
                    None => Vec::new(),
                };
                let labels = (!labels.is_empty()).then(|| {
                    labels
                        .into_iter()
                        .map(|(label, name)| (label.to_string(), name))
                        .collect()
                });
                let path = MonaiDatasetOrganizer::new(&base, labels).prepare_dataset(
                    &volumes,
                    &tests,
                    &segmentations,
                    val_split,
                )?;
                println!("monai: wrote {}", path.display());
            }
            Command::YoloYaml {
                train,
                val,
                names,
                nc,
                output,
            } => {
                let nc = nc.unwrap_or(names.len());
                YoloDatasetYaml::new(train, val, nc, names)?.save(&output)?;
                println!("yolo-yaml: wrote {}", output.display());
            }
            Command::Mask2txt { io, layout, epsilon } => {
                ensure_exists(&io.input)?;
                let report = match layout {
                    MaskLayout::MultiClass => {
                        let converter = epsilon.map_or_else(PngToTxtConverterMc::default, PngToTxtConverterMc::new);
                        converter.run(&io.input, &io.output)?
                    }
                    MaskLayout::MultiLabel => {
                        let converter = epsilon.map_or_else(PngToTxtConverterMl::default, PngToTxtConverterMl::new);
                        converter.run(&io.input, &io.output)?
                    }
                };
                finish("mask2txt", &report, started);
            }
            Command::Preview {
                input,
                output,
                orientation,
                index,
                center,
                width,
                interpolate,
            } => {
                ensure_exists(&input)?;
                let volume = if input.is_dir() {
                    VolumeLoader::load_from_directory(&input, SortBy::ImagePositionPatient)?
                } else {
                    read_volume(&input)?
                };
                let (depth, height, width_px) = volume.dim();
                let index = index.unwrap_or(match orientation {
                    Orientation::Axial => depth / 2,
                    Orientation::Coronal => height / 2,
                    Orientation::Sagittal => width_px / 2,
                });
                let window = center.zip(width).map(|(c, w)| DisplayWindow::from_center_width(c, w));
                let interpolation = if interpolate {
                    Interpolation::Bilinear
                } else {
                    Interpolation::None
                };
                let image = volume
                    .get_image_from_axis(index, orientation, interpolation, window)
                    .with_context(|| format!("slice {index} is outside the volume ({depth}, {height}, {width_px})"))?;
                image.save(&output)?;
                println!("preview: wrote {}", output.display());
            }
            Command::Datasets { command } => command.run().await?,
        }
        Ok(())
    }
}

impl DatasetsCommand {
    pub async fn run(self) -> anyhow::Result<()> {
        match self {
            DatasetsCommand::List => {
                for entry in CATALOG {
                    println!("{:<20} {:?}, {} cases", entry.name, entry.task, entry.cases);
                }
            }
            DatasetsCommand::Info { name } => {
                let entry = catalog::find(&name).with_context(|| format!("unknown dataset `{name}`"))?;
                println!("{}", entry.info());
            }
            DatasetsCommand::Download {
                name,
                subgroup,
                output,
            } => {
                let entry = catalog::find(&name).with_context(|| format!("unknown dataset `{name}`"))?;
                let dest = entry.download(&subgroup, &output).await?;
                println!("datasets: {} ({subgroup}) extracted to {}", entry.name, dest.display());
            }
        }
        Ok(())
    }
}

fn dicom_options(config: &Config, args: &ToDicomArgs) -> crate::io::DicomSeriesOptions {
    let mut options = config.dicom.clone();
    if let Some(modality) = &args.modality {
        options.modality = modality.clone();
    }
    if let Some(description) = &args.series_description {
        options.series_description = description.clone();
    }
    options
}

fn stl_options(
    config: &Config,
    mode: Option<MeshMode>,
    fast: bool,
    iterations: Option<usize>,
    reduction: Option<f32>,
) -> anyhow::Result<StlOptions> {
    let mut options = match (fast, mode) {
        (true, _) => StlOptions::fast(),
        (false, Some(MeshMode::Merged)) => StlOptions::merged(),
        (false, Some(MeshMode::PerLabel)) => StlOptions::per_label(),
        (false, None) => config.stl.clone(),
    };
    match iterations {
        Some(0) => options.smoothing = None,
        Some(iterations) => {
            let base = options.smoothing.unwrap_or_default();
            options.smoothing = Some(SmoothingOptions { iterations, ..base });
        }
        None => {}
    }
    if let Some(reduction) = reduction {
        if !(0.0..1.0).contains(&reduction) {
            bail!("--reduction must be in [0, 1)");
        }
        options.target_reduction = Some(reduction);
    }
    Ok(options)
}
