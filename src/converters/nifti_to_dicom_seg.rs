use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::{tags, uids};
use ndarray::{Array3, Axis};
use serde::Deserialize;
use tracing::info;

use crate::converters::reference::resample_onto;
use crate::error::{Error, Result};
use crate::io::dicom::{
    Code, PATIENT_STUDY_TAGS, copy_elements, new_uid,
    now_date_time, put_bytes, put_ds, put_is, put_sequence, put_str, put_tags, put_ul, put_us,
    write_object,
};
use crate::io::read_nifti;
use crate::volume::Volume;
use crate::volume_loader::{ReferenceSeries, VolumeLoader};

/// Name of the merged segment when none is given.
pub const DEFAULT_SEGMENT_LABEL: &str = "liver";

/// One segment of the output. `label` selects the voxels of the mask that
/// belong to it; `None` takes every non-zero voxel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentDescription {
    pub label: Option<i32>,
    pub name: String,
    pub category: Code,
    pub property_type: Code,
}

impl SegmentDescription {
    pub fn new(label: Option<i32>, name: impl Into<String>) -> Self {
        Self {
            label,
            name: name.into(),
            category: Code::new("85756007", "SCT", "Tissue"),
            property_type: Code::new("181769001", "SCT", "Connective tissue"),
        }
    }
}

/// Equipment and algorithm attributes recorded in the segmentation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SegMetadata {
    pub algorithm_name: String,
    pub algorithm_version: String,
    pub manufacturer: String,
    pub model_name: String,
    pub software_version: String,
    pub device_serial: String,
}

impl Default for SegMetadata {
    fn default() -> Self {
        Self {
            algorithm_name: "test".to_string(),
            algorithm_version: "v1.0".to_string(),
            manufacturer: "Manufacturer".to_string(),
            model_name: "Model".to_string(),
            software_version: "v1".to_string(),
            device_serial: "Device XYZ".to_string(),
        }
    }
}

/// Sizes of the two inputs, `(slices, rows, columns)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegDimensions {
    pub reference: (usize, usize, usize),
    pub mask: (usize, usize, usize),
}

/// Builds a binary DICOM Segmentation from a NIfTI label mask drawn on a
/// reference DICOM series.
pub struct NiftiToDicomSeg {
    reference: ReferenceSeries,
    mask: Volume,
    pub segments: Vec<SegmentDescription>,
    pub metadata: SegMetadata,
}

struct Frame {
    segment_number: u16,
    slice: usize,
    pixels: Vec<bool>,
}

impl NiftiToDicomSeg {
    pub fn new(dicom_dir: impl AsRef<Path>, nifti_file: impl AsRef<Path>) -> Result<Self> {
        let reference = VolumeLoader::load_reference_series(dicom_dir)?;
        let mask = read_nifti(nifti_file)?;
        Ok(Self {
            reference,
            mask,
            segments: vec![SegmentDescription::new(None, DEFAULT_SEGMENT_LABEL)],
            metadata: SegMetadata::default(),
        })
    }

    pub fn with_segments(mut self, segments: Vec<SegmentDescription>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_metadata(mut self, metadata: SegMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn dimensions(&self) -> SegDimensions {
        SegDimensions {
            reference: self.reference.volume.dim(),
            mask: self.mask.dim(),
        }
    }

    /// The mask on the reference grid.
    pub fn align_mask(&self) -> Result<Array3<f32>> {
        resample_onto(&self.mask, &self.reference.volume)
    }

    fn frames(&self, aligned: &Array3<f32>) -> Vec<Frame> {
        let mut frames = Vec::new();
        for (number, segment) in self.segments.iter().enumerate() {
            for (slice, plane) in aligned.axis_iter(Axis(0)).enumerate() {
                let pixels: Vec<bool> = plane
                    .iter()
                    .map(|&v| match segment.label {
                        Some(label) => v.round() as i32 == label,
                        None => v.round() as i32 != 0,
                    })
                    .collect();
                if pixels.iter().any(|&p| p) {
                    frames.push(Frame {
                        segment_number: number as u16 + 1,
                        slice,
                        pixels,
                    });
                }
            }
        }
        frames
    }

    /// Build the segmentation data set. Returns it with its SOP Instance UID.
    pub fn create_segmentation(&self) -> Result<(InMemDicomObject, String)> {
        if self.segments.is_empty() {
            return Err(Error::InvalidArgument("no segments selected".to_string()));
        }
        let aligned = self.align_mask()?;
        let frames = self.frames(&aligned);
        if frames.is_empty() {
            return Err(Error::InvalidArgument(
                "segmentation is empty on the reference grid".to_string(),
            ));
        }

        let volume = &self.reference.volume;
        let (_, rows, columns) = volume.dim();
        let sop_instance_uid = new_uid();
        let (date, time) = now_date_time();
        let meta = &self.metadata;

        let mut obj = InMemDicomObject::new_empty();
        copy_elements(&self.reference.header, &mut obj, &PATIENT_STUDY_TAGS);
        put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::SEGMENTATION_STORAGE);
        put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str());
        put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, new_uid());
        put_is(&mut obj, tags::SERIES_NUMBER, 2);
        put_is(&mut obj, tags::INSTANCE_NUMBER, 1);
        put_str(&mut obj, tags::MODALITY, VR::CS, "SEG");
        put_str(&mut obj, tags::MANUFACTURER, VR::LO, meta.manufacturer.as_str());
        put_str(&mut obj, tags::MANUFACTURER_MODEL_NAME, VR::LO, meta.model_name.as_str());
        put_str(&mut obj, tags::SOFTWARE_VERSIONS, VR::LO, meta.software_version.as_str());
        put_str(&mut obj, tags::DEVICE_SERIAL_NUMBER, VR::LO, meta.device_serial.as_str());
        put_str(&mut obj, tags::SERIES_DATE, VR::DA, date.as_str());
        put_str(&mut obj, tags::SERIES_TIME, VR::TM, time.as_str());
        put_str(&mut obj, tags::CONTENT_DATE, VR::DA, date.as_str());
        put_str(&mut obj, tags::CONTENT_TIME, VR::TM, time.as_str());
        obj.put(DataElement::new(
            tags::IMAGE_TYPE,
            VR::CS,
            PrimitiveValue::Strs(vec!["DERIVED".to_string(), "PRIMARY".to_string()].into()),
        ));
        put_str(&mut obj, tags::CONTENT_LABEL, VR::CS, "SEGMENTATION");
        put_str(&mut obj, tags::CONTENT_DESCRIPTION, VR::LO, "");
        put_str(&mut obj, tags::CONTENT_CREATOR_NAME, VR::PN, "");
        put_str(&mut obj, tags::SEGMENTATION_TYPE, VR::CS, "BINARY");

        put_us(&mut obj, tags::ROWS, rows as u16);
        put_us(&mut obj, tags::COLUMNS, columns as u16);
        put_us(&mut obj, tags::SAMPLES_PER_PIXEL, 1);
        put_str(&mut obj, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
        put_us(&mut obj, tags::BITS_ALLOCATED, 1);
        put_us(&mut obj, tags::BITS_STORED, 1);
        put_us(&mut obj, tags::HIGH_BIT, 0);
        put_us(&mut obj, tags::PIXEL_REPRESENTATION, 0);
        put_str(&mut obj, tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00");
        put_is(&mut obj, tags::NUMBER_OF_FRAMES, frames.len() as i64);

        self.put_referenced_series(&mut obj);
        self.put_segments(&mut obj);
        self.put_shared_groups(&mut obj);

        let dimension_uid = new_uid();
        let mut organization = InMemDicomObject::new_empty();
        put_str(&mut organization, tags::DIMENSION_ORGANIZATION_UID, VR::UI, dimension_uid.as_str());
        put_sequence(&mut obj, tags::DIMENSION_ORGANIZATION_SEQUENCE, vec![organization]);
        let index = |pointer, group| {
            let mut item = InMemDicomObject::new_empty();
            put_str(&mut item, tags::DIMENSION_ORGANIZATION_UID, VR::UI, dimension_uid.as_str());
            put_tags(&mut item, tags::DIMENSION_INDEX_POINTER, &[pointer]);
            put_tags(&mut item, tags::FUNCTIONAL_GROUP_POINTER, &[group]);
            item
        };
        put_sequence(
            &mut obj,
            tags::DIMENSION_INDEX_SEQUENCE,
            vec![
                index(tags::REFERENCED_SEGMENT_NUMBER, tags::SEGMENT_IDENTIFICATION_SEQUENCE),
                index(tags::IMAGE_POSITION_PATIENT, tags::PLANE_POSITION_SEQUENCE),
            ],
        );

        let per_frame = frames.iter().map(|frame| self.frame_item(frame)).collect();
        put_sequence(&mut obj, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, per_frame);

        let bits: Vec<bool> = frames.iter().flat_map(|f| f.pixels.iter().copied()).collect();
        put_bytes(&mut obj, tags::PIXEL_DATA, VR::OB, pack_bits(&bits));

        Ok((obj, sop_instance_uid))
    }

    fn put_referenced_series(&self, obj: &mut InMemDicomObject) {
        let instances = self
            .reference
            .slices
            .iter()
            .map(|slice| {
                let mut item = InMemDicomObject::new_empty();
                put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, slice.sop_class_uid.as_str());
                put_str(
                    &mut item,
                    tags::REFERENCED_SOP_INSTANCE_UID,
                    VR::UI,
                    slice.sop_instance_uid.as_str(),
                );
                item
            })
            .collect();
        let mut series = InMemDicomObject::new_empty();
        put_str(
            &mut series,
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            self.reference.series_instance_uid().unwrap_or_default(),
        );
        put_sequence(&mut series, tags::REFERENCED_INSTANCE_SEQUENCE, instances);
        put_sequence(obj, tags::REFERENCED_SERIES_SEQUENCE, vec![series]);
    }

    fn put_segments(&self, obj: &mut InMemDicomObject) {
        let items = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, segment)| {
                let mut item = InMemDicomObject::new_empty();
                put_us(&mut item, tags::SEGMENT_NUMBER, i as u16 + 1);
                put_str(&mut item, tags::SEGMENT_LABEL, VR::LO, segment.name.as_str());
                put_str(&mut item, tags::SEGMENT_ALGORITHM_TYPE, VR::CS, "AUTOMATIC");
                put_str(
                    &mut item,
                    tags::SEGMENT_ALGORITHM_NAME,
                    VR::LO,
                    format!("{} {}", self.metadata.algorithm_name, self.metadata.algorithm_version),
                );
                put_sequence(
                    &mut item,
                    tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE,
                    vec![segment.category.to_item()],
                );
                put_sequence(
                    &mut item,
                    tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE,
                    vec![segment.property_type.to_item()],
                );
                put_str(&mut item, tags::TRACKING_UID, VR::UI, new_uid());
                item
            })
            .collect();
        put_sequence(obj, tags::SEGMENT_SEQUENCE, items);
    }

    fn put_shared_groups(&self, obj: &mut InMemDicomObject) {
        let volume = &self.reference.volume;
        let (sx, sy, sz) = volume.spacing;
        let d = volume.direction;

        let mut measures = InMemDicomObject::new_empty();
        put_ds(&mut measures, tags::PIXEL_SPACING, &[sy as f64, sx as f64]);
        put_ds(&mut measures, tags::SLICE_THICKNESS, &[sz as f64]);
        put_ds(&mut measures, tags::SPACING_BETWEEN_SLICES, &[sz as f64]);

        let mut orientation = InMemDicomObject::new_empty();
        put_ds(
            &mut orientation,
            tags::IMAGE_ORIENTATION_PATIENT,
            &[d[0][0], d[1][0], d[2][0], d[0][1], d[1][1], d[2][1]],
        );

        let mut shared = InMemDicomObject::new_empty();
        put_sequence(&mut shared, tags::PIXEL_MEASURES_SEQUENCE, vec![measures]);
        put_sequence(&mut shared, tags::PLANE_ORIENTATION_SEQUENCE, vec![orientation]);
        put_sequence(obj, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, vec![shared]);
    }

    fn frame_item(&self, frame: &Frame) -> InMemDicomObject {
        let source = &self.reference.slices[frame.slice];

        let mut source_image = InMemDicomObject::new_empty();
        put_str(&mut source_image, tags::REFERENCED_SOP_CLASS_UID, VR::UI, source.sop_class_uid.as_str());
        put_str(
            &mut source_image,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            source.sop_instance_uid.as_str(),
        );
        put_sequence(
            &mut source_image,
            tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE,
            vec![Code::new("121322", "DCM", "Source image for image processing operation").to_item()],
        );

        let mut derivation = InMemDicomObject::new_empty();
        put_sequence(&mut derivation, tags::SOURCE_IMAGE_SEQUENCE, vec![source_image]);
        put_sequence(
            &mut derivation,
            tags::DERIVATION_CODE_SEQUENCE,
            vec![Code::new("113076", "DCM", "Segmentation").to_item()],
        );

        let mut content = InMemDicomObject::new_empty();
        put_ul(
            &mut content,
            tags::DIMENSION_INDEX_VALUES,
            &[frame.segment_number as u32, frame.slice as u32 + 1],
        );

        let mut position = InMemDicomObject::new_empty();
        let ipp = self
            .reference
            .volume
            .index_to_physical([0.0, 0.0, frame.slice as f64]);
        put_ds(&mut position, tags::IMAGE_POSITION_PATIENT, &ipp);

        let mut identification = InMemDicomObject::new_empty();
        put_us(&mut identification, tags::REFERENCED_SEGMENT_NUMBER, frame.segment_number);

        let mut item = InMemDicomObject::new_empty();
        put_sequence(&mut item, tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation]);
        put_sequence(&mut item, tags::FRAME_CONTENT_SEQUENCE, vec![content]);
        put_sequence(&mut item, tags::PLANE_POSITION_SEQUENCE, vec![position]);
        put_sequence(&mut item, tags::SEGMENT_IDENTIFICATION_SEQUENCE, vec![identification]);
        item
    }

    /// Build and write the segmentation to `output_file`.
    pub fn save_segmentation(&self, output_file: impl AsRef<Path>) -> Result<PathBuf> {
        let output_file = output_file.as_ref();
        if let Some(parent) = output_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (obj, sop_instance_uid) = self.create_segmentation()?;
        write_object(obj, uids::SEGMENTATION_STORAGE, &sop_instance_uid, output_file)?;
        info!(path = %output_file.display(), "saved DICOM segmentation");
        Ok(output_file.to_path_buf())
    }
}

/// Pack booleans eight to a byte, first pixel in the least significant bit.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | (u8::from(bit) << i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dicom::{read_int, read_string};
    use crate::io::{DicomSeriesOptions, DicomSeriesWriter, write_nifti};
    use dicom::object::open_file;
    use ndarray::s;
    use tempfile::tempdir;

    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let series_dir = dir.join("series");
        let geometry = Volume::new(Array3::zeros((4, 6, 6)), (1.0, 1.0, 2.0)).with_geometry(
            [-3.0, -3.0, 10.0],
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        );
        DicomSeriesWriter::new(DicomSeriesOptions::default())
            .write(&geometry, &series_dir)
            .unwrap();

        let mut labels = Array3::<f32>::zeros((4, 6, 6));
        labels.slice_mut(s![1..3, 2..4, 2..4]).fill(1.0);
        labels[[3, 0, 0]] = 2.0;
        let mask_path = dir.join("mask.nii.gz");
        write_nifti(&geometry.with_data(labels, crate::enums::PixelType::U8), &mask_path).unwrap();
        (series_dir, mask_path)
    }

    #[test]
    fn packs_least_significant_bit_first() {
        let bits = [true, false, false, false, false, false, false, true, true];
        assert_eq!(pack_bits(&bits), vec![0b1000_0001, 0b0000_0001]);
    }

    #[test]
    fn reports_dimensions() {
        let dir = tempdir().unwrap();
        let (series, mask) = fixture(dir.path());
        let seg = NiftiToDicomSeg::new(&series, &mask).unwrap();
        let dims = seg.dimensions();
        assert_eq!(dims.reference, (4, 6, 6));
        assert_eq!(dims.mask, (4, 6, 6));
    }

    #[test]
    fn merged_segment_omits_empty_frames() {
        let dir = tempdir().unwrap();
        let (series, mask) = fixture(dir.path());
        let output = dir.path().join("out/seg.dcm");
        NiftiToDicomSeg::new(&series, &mask)
            .unwrap()
            .save_segmentation(&output)
            .unwrap();

        let obj = open_file(&output).unwrap();
        // slices 1, 2 and 3 carry foreground
        assert_eq!(read_int(&obj, tags::NUMBER_OF_FRAMES), Some(3));
        assert_eq!(read_int(&obj, tags::ROWS), Some(6));
    }

    #[test]
    fn one_segment_per_label() {
        let dir = tempdir().unwrap();
        let (series, mask) = fixture(dir.path());
        let seg = NiftiToDicomSeg::new(&series, &mask).unwrap().with_segments(vec![
            SegmentDescription::new(Some(1), "organ"),
            SegmentDescription::new(Some(2), "lesion"),
        ]);
        let (obj, _) = seg.create_segmentation().unwrap();
        assert_eq!(read_int(&obj, tags::NUMBER_OF_FRAMES), Some(3));
    }

    #[test]
    fn empty_selection_is_rejected() {
        let dir = tempdir().unwrap();
        let (series, mask) = fixture(dir.path());
        let seg = NiftiToDicomSeg::new(&series, &mask)
            .unwrap()
            .with_segments(vec![SegmentDescription::new(Some(7), "absent")]);
        assert!(matches!(seg.create_segmentation(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn default_segment_is_connective_tissue() {
        let dir = tempdir().unwrap();
        let (series, mask) = fixture(dir.path());
        let (obj, _) = NiftiToDicomSeg::new(&series, &mask)
            .unwrap()
            .create_segmentation()
            .unwrap();
        let segments = obj.element(tags::SEGMENT_SEQUENCE).unwrap().items().unwrap();
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert_eq!(read_string(segment, tags::SEGMENT_LABEL).as_deref(), Some("liver"));
        let property = segment
            .element(tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(read_string(&property[0], tags::CODE_VALUE).as_deref(), Some("181769001"));
        let category = segment
            .element(tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        assert_eq!(read_string(&category[0], tags::CODE_MEANING).as_deref(), Some("Tissue"));
    }
}
