//! YOLO segmentation labels (`<class> x1 y1 x2 y2 ...`, normalised) from
//! PNG masks.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use image::ImageBuffer;
use imageproc::point::Point;
use tracing::{info, warn};

use crate::batch::{BatchReport, list_inputs};
use crate::contours::find_polygons;
use crate::error::{Error, Result};
use crate::volume::GrayImage;

/// Contours with fewer points are ignored.
const MIN_CONTOUR_POINTS: usize = 5;

fn polygon_line(class_index: usize, polygon: &[Point<i32>], width: u32, height: u32) -> String {
    let mut line = class_index.to_string();
    for point in polygon {
        let _ = write!(
            line,
            " {:.6} {:.6}",
            point.x as f64 / width as f64,
            point.y as f64 / height as f64
        );
    }
    line
}

fn binary_polygons(mask: &GrayImage, class_index: usize, epsilon_coeff: f64) -> Vec<String> {
    find_polygons(mask, epsilon_coeff, MIN_CONTOUR_POINTS)
        .iter()
        .map(|polygon| polygon_line(class_index, polygon, mask.width(), mask.height()))
        .collect()
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

fn read_gray(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)?.to_luma8())
}

/// One mask per image holding every class as a distinct gray value.
#[derive(Clone, Debug)]
pub struct PngToTxtConverterMc {
    pub epsilon_coeff: f64,
    pub extensions: Vec<String>,
}

impl Default for PngToTxtConverterMc {
    fn default() -> Self {
        Self {
            epsilon_coeff: 0.001,
            extensions: vec![".png".to_string(), ".jpg".to_string()],
        }
    }
}

impl PngToTxtConverterMc {
    pub fn new(epsilon_coeff: f64) -> Self {
        Self {
            epsilon_coeff,
            ..Self::default()
        }
    }

    /// Polygon lines of `mask`. The class index of a gray value is its rank
    /// among the non-zero values present in the mask.
    pub fn mask_to_polygons(&self, mask: &GrayImage) -> Vec<String> {
        let mut present = [false; 256];
        for pixel in mask.pixels() {
            present[pixel.0[0] as usize] = true;
        }
        let values = (1..=255u8).filter(|&v| present[v as usize]);

        let mut lines = Vec::new();
        for (class_index, value) in values.enumerate() {
            let binary: GrayImage = ImageBuffer::from_fn(mask.width(), mask.height(), |x, y| {
                image::Luma([if mask.get_pixel(x, y).0[0] == value { 255 } else { 0 }])
            });
            lines.extend(binary_polygons(&binary, class_index, self.epsilon_coeff));
        }
        lines
    }

    /// Convert every mask of `input_dir` into `output_dir/<stem>.txt`.
    pub fn run(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        fs::create_dir_all(output_dir)?;
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        let mut report = BatchReport::new();
        for input in list_inputs(input_dir, &extensions)? {
            let result = (|| -> Result<PathBuf> {
                let lines = self.mask_to_polygons(&read_gray(&input)?);
                let stem = input
                    .file_stem()
                    .ok_or_else(|| Error::InvalidArgument(input.display().to_string()))?;
                let output = output_dir.join(format!("{}.txt", stem.to_string_lossy()));
                write_lines(&output, &lines)?;
                Ok(output)
            })();
            match result {
                Ok(output) => report.record_success(output),
                Err(err) => report.record_failure(&input, err),
            }
        }
        info!(converted = report.converted.len(), "mask polygons written");
        Ok(report)
    }
}

/// One sub-folder per image holding one binary PNG mask per class.
#[derive(Clone, Debug)]
pub struct PngToTxtConverterMl {
    pub epsilon_coeff: f64,
}

impl Default for PngToTxtConverterMl {
    fn default() -> Self {
        Self { epsilon_coeff: 0.01 }
    }
}

impl PngToTxtConverterMl {
    pub fn new(epsilon_coeff: f64) -> Self {
        Self { epsilon_coeff }
    }

    /// Convert each sub-folder of `input_dir` into `output_dir/<folder>.txt`.
    /// Masks are classes 0 and 1 in name order; folders without one or two
    /// masks are skipped.
    pub fn run(&self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        if !input_dir.is_dir() {
            return Err(Error::NotFound(input_dir.to_path_buf()));
        }
        fs::create_dir_all(output_dir)?;
        let mut folders: Vec<PathBuf> = fs::read_dir(input_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        folders.sort();

        let mut report = BatchReport::new();
        for folder in folders {
            let masks = list_inputs(&folder, &[".png"])?;
            if masks.is_empty() || masks.len() > 2 {
                warn!(folder = %folder.display(), masks = masks.len(), "expected one or two masks, skipping");
                continue;
            }
            let result = (|| -> Result<PathBuf> {
                let mut lines = Vec::new();
                for (class_index, mask) in masks.iter().enumerate() {
                    lines.extend(binary_polygons(&read_gray(mask)?, class_index, self.epsilon_coeff));
                }
                let name = folder
                    .file_name()
                    .ok_or_else(|| Error::InvalidArgument(folder.display().to_string()))?;
                let output = output_dir.join(format!("{}.txt", name.to_string_lossy()));
                write_lines(&output, &lines)?;
                Ok(output)
            })();
            match result {
                Ok(output) => report.record_success(output),
                Err(err) => report.record_failure(&folder, err),
            }
        }
        Ok(report)
    }
}
