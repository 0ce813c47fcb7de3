use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::{tags, uids};
use ndarray::{Array3, Axis};
use tracing::{debug, info, warn};

use crate::contours::{find_all_borders, mask_to_image};
use crate::converters::reference::resample_onto;
use crate::error::{Error, Result};
use crate::io::dicom::{
    PATIENT_STUDY_TAGS, copy_elements, new_uid, now_date_time, put_ds, put_is, put_sequence,
    put_str, read_string, write_object,
};
use crate::io::read_nifti;
use crate::volume::Volume;
use crate::volume_loader::{ReferenceSeries, VolumeLoader};

const PALETTE: [[u8; 3]; 8] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [0, 255, 255],
    [255, 0, 255],
    [255, 128, 0],
    [128, 0, 255],
];

/// Converts a NIfTI label mask into an RT Structure Set referencing a DICOM
/// series. Each entry of `selected_classes` becomes one ROI.
pub struct NiftiToDicomRt {
    reference: ReferenceSeries,
    mask: Volume,
    pub selected_classes: BTreeMap<i32, String>,
}

struct Roi {
    number: i64,
    name: String,
    /// `(slice, points in patient coordinates)`
    contours: Vec<(usize, Vec<[f64; 3]>)>,
}

impl NiftiToDicomRt {
    pub fn new(
        nifti_file: impl AsRef<Path>,
        dicom_dir: impl AsRef<Path>,
        selected_classes: BTreeMap<i32, String>,
    ) -> Result<Self> {
        let mask = read_nifti(nifti_file)?;
        let reference = VolumeLoader::load_reference_series(dicom_dir)?;
        debug!(mask = ?mask.dim(), reference = ?reference.volume.dim(), "loaded RT inputs");
        Ok(Self {
            reference,
            mask,
            selected_classes,
        })
    }

    fn rois(&self, aligned: &Array3<f32>) -> Vec<Roi> {
        let volume = &self.reference.volume;
        let mut rois = Vec::new();
        for (label, name) in &self.selected_classes {
            let binary = aligned.mapv(|v| u8::from(v.round() as i32 == *label));
            if !binary.iter().any(|&v| v != 0) {
                warn!(label, name = name.as_str(), "label is empty, skipping ROI");
                continue;
            }
            let mut contours = Vec::new();
            for (z, plane) in binary.axis_iter(Axis(0)).enumerate() {
                if !plane.iter().any(|&v| v != 0) {
                    continue;
                }
                for border in find_all_borders(&mask_to_image(plane), 0.0, 1) {
                    let points = border
                        .points
                        .iter()
                        .map(|p| volume.index_to_physical([p.x as f64, p.y as f64, z as f64]))
                        .collect();
                    contours.push((z, points));
                }
            }
            rois.push(Roi {
                number: rois.len() as i64 + 1,
                name: name.clone(),
                contours,
            });
        }
        rois
    }

    fn contour_image(&self, slice: usize) -> InMemDicomObject {
        let source = &self.reference.slices[slice];
        let mut item = InMemDicomObject::new_empty();
        put_str(&mut item, tags::REFERENCED_SOP_CLASS_UID, VR::UI, source.sop_class_uid.as_str());
        put_str(&mut item, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, source.sop_instance_uid.as_str());
        item
    }

    /// Build the structure set. Returns it with its SOP Instance UID.
    pub fn create_structure_set(&self) -> Result<(InMemDicomObject, String)> {
        let aligned = resample_onto(&self.mask, &self.reference.volume)?;
        let rois = self.rois(&aligned);
        if rois.is_empty() {
            return Err(Error::InvalidArgument(
                "none of the selected classes is present in the mask".to_string(),
            ));
        }

        let frame_of_reference = self.reference.frame_of_reference_uid().unwrap_or_else(new_uid);
        let sop_instance_uid = new_uid();
        let (date, time) = now_date_time();

        let mut obj = InMemDicomObject::new_empty();
        copy_elements(&self.reference.header, &mut obj, &PATIENT_STUDY_TAGS);
        put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::RT_STRUCTURE_SET_STORAGE);
        put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str());
        put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, new_uid());
        put_str(&mut obj, tags::MODALITY, VR::CS, "RTSTRUCT");
        put_is(&mut obj, tags::SERIES_NUMBER, 1);
        put_is(&mut obj, tags::INSTANCE_NUMBER, 1);
        put_str(&mut obj, tags::MANUFACTURER, VR::LO, "medtk");
        put_str(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, "RT structure set");
        put_str(&mut obj, tags::STRUCTURE_SET_LABEL, VR::SH, "RTstruct");
        put_str(&mut obj, tags::STRUCTURE_SET_NAME, VR::LO, "RTstruct");
        put_str(&mut obj, tags::STRUCTURE_SET_DATE, VR::DA, date.as_str());
        put_str(&mut obj, tags::STRUCTURE_SET_TIME, VR::TM, time.as_str());

        // frame of reference -> study -> series -> images
        let images = (0..self.reference.slices.len())
            .map(|slice| self.contour_image(slice))
            .collect();
        let mut series = InMemDicomObject::new_empty();
        put_str(
            &mut series,
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            self.reference.series_instance_uid().unwrap_or_default(),
        );
        put_sequence(&mut series, tags::CONTOUR_IMAGE_SEQUENCE, images);
        // retired, still the class RT readers expect here
        #[allow(deprecated)]
        let study_class = uids::DETACHED_STUDY_MANAGEMENT;
        let mut study = InMemDicomObject::new_empty();
        put_str(&mut study, tags::REFERENCED_SOP_CLASS_UID, VR::UI, study_class);
        put_str(
            &mut study,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            read_string(&self.reference.header, tags::STUDY_INSTANCE_UID)
                .unwrap_or_default(),
        );
        put_sequence(&mut study, tags::RT_REFERENCED_SERIES_SEQUENCE, vec![series]);
        let mut frame = InMemDicomObject::new_empty();
        put_str(&mut frame, tags::FRAME_OF_REFERENCE_UID, VR::UI, frame_of_reference.as_str());
        put_sequence(&mut frame, tags::RT_REFERENCED_STUDY_SEQUENCE, vec![study]);
        put_sequence(&mut obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, vec![frame]);

        let mut structure_rois = Vec::new();
        let mut roi_contours = Vec::new();
        let mut observations = Vec::new();
        for (i, roi) in rois.iter().enumerate() {
            let mut item = InMemDicomObject::new_empty();
            put_is(&mut item, tags::ROI_NUMBER, roi.number);
            put_str(&mut item, tags::REFERENCED_FRAME_OF_REFERENCE_UID, VR::UI, frame_of_reference.as_str());
            put_str(&mut item, tags::ROI_NAME, VR::LO, roi.name.as_str());
            put_str(&mut item, tags::ROI_GENERATION_ALGORITHM, VR::CS, "AUTOMATIC");
            structure_rois.push(item);

            let contours = roi
                .contours
                .iter()
                .enumerate()
                .map(|(n, (slice, points))| {
                    let mut contour = InMemDicomObject::new_empty();
                    put_sequence(&mut contour, tags::CONTOUR_IMAGE_SEQUENCE, vec![self.contour_image(*slice)]);
                    put_str(&mut contour, tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, geometric_type(points.len()));
                    put_is(&mut contour, tags::NUMBER_OF_CONTOUR_POINTS, points.len() as i64);
                    put_is(&mut contour, tags::CONTOUR_NUMBER, n as i64 + 1);
                    let data: Vec<f64> = points.iter().flatten().copied().collect();
                    put_ds(&mut contour, tags::CONTOUR_DATA, &data);
                    contour
                })
                .collect();
            let color = PALETTE[i % PALETTE.len()];
            let mut item = InMemDicomObject::new_empty();
            item.put(DataElement::new(
                tags::ROI_DISPLAY_COLOR,
                VR::IS,
                PrimitiveValue::Strs(color.iter().map(|c| c.to_string()).collect()),
            ));
            put_sequence(&mut item, tags::CONTOUR_SEQUENCE, contours);
            put_is(&mut item, tags::REFERENCED_ROI_NUMBER, roi.number);
            roi_contours.push(item);

            let mut item = InMemDicomObject::new_empty();
            put_is(&mut item, tags::OBSERVATION_NUMBER, roi.number);
            put_is(&mut item, tags::REFERENCED_ROI_NUMBER, roi.number);
            put_str(&mut item, tags::RTROI_INTERPRETED_TYPE, VR::CS, "ORGAN");
            put_str(&mut item, tags::ROI_INTERPRETER, VR::PN, "");
            observations.push(item);
        }
        put_sequence(&mut obj, tags::STRUCTURE_SET_ROI_SEQUENCE, structure_rois);
        put_sequence(&mut obj, tags::ROI_CONTOUR_SEQUENCE, roi_contours);
        put_sequence(&mut obj, tags::RTROI_OBSERVATIONS_SEQUENCE, observations);

        Ok((obj, sop_instance_uid))
    }

    /// Build and write the structure set to `output_file`.
    pub fn convert(&self, output_file: impl AsRef<Path>) -> Result<PathBuf> {
        let output_file = output_file.as_ref();
        if let Some(parent) = output_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (obj, sop_instance_uid) = self.create_structure_set()?;
        write_object(obj, uids::RT_STRUCTURE_SET_STORAGE, &sop_instance_uid, output_file)?;
        info!(path = %output_file.display(), "saved RT structure set");
        Ok(output_file.to_path_buf())
    }
}

/// Borders of one- and two-voxel regions cannot enclose an area.
fn geometric_type(points: usize) -> &'static str {
    match points {
        1 => "POINT",
        2 => "OPEN_PLANAR",
        _ => "CLOSED_PLANAR",
    }
}
