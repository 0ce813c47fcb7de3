use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::{tags, uids};
use ndarray::s;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::io::dicom::{
    new_uid, now_date_time, put_ds, put_i16_image, put_is, put_str, write_object,
};
use crate::volume::{Volume, dot};

/// Attributes applied to every slice of a written series.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DicomSeriesOptions {
    pub modality: String,
    pub series_description: String,
    pub patient_name: String,
    pub patient_id: String,
    pub series_number: i64,
    /// Study to attach the series to; a new one is created when absent.
    pub study_instance_uid: Option<String>,
}

impl Default for DicomSeriesOptions {
    fn default() -> Self {
        Self {
            modality: "CT".to_string(),
            series_description: "Converted volume".to_string(),
            patient_name: "Anonymous".to_string(),
            patient_id: "000000".to_string(),
            series_number: 1,
            study_instance_uid: None,
        }
    }
}

/// Writes a [`Volume`] as a series of single-frame CT images, one per axial
/// slice, with signed 16-bit pixels.
pub struct DicomSeriesWriter {
    options: DicomSeriesOptions,
}

impl DicomSeriesWriter {
    pub fn new(options: DicomSeriesOptions) -> Self {
        Self { options }
    }

    /// Write every axial slice to `out_dir/slice####.dcm` and return the
    /// written paths in slice order.
    pub fn write(&self, volume: &Volume, out_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let out_dir = out_dir.as_ref();
        let (sx, sy, sz) = volume.spacing;
        if !(sx > 0.0 && sy > 0.0 && sz > 0.0) {
            return Err(Error::MissingSpacing);
        }
        fs::create_dir_all(out_dir)?;

        let depth = volume.dim().0;
        let study_uid = self
            .options
            .study_instance_uid
            .clone()
            .unwrap_or_else(new_uid);
        let series_uid = new_uid();
        let frame_of_reference_uid = new_uid();
        let (date, time) = now_date_time();

        let d = volume.direction;
        let orientation = [d[0][0], d[1][0], d[2][0], d[0][1], d[1][1], d[2][1]];
        let normal = [d[0][2], d[1][2], d[2][2]];

        let mut written = Vec::with_capacity(depth);
        for k in 0..depth {
            let mut obj = InMemDicomObject::new_empty();
            let sop_instance_uid = new_uid();

            put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
            put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid.as_str());
            put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study_uid.as_str());
            put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, series_uid.as_str());
            put_str(
                &mut obj,
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                frame_of_reference_uid.as_str(),
            );
            put_str(&mut obj, tags::PATIENT_NAME, VR::PN, self.options.patient_name.as_str());
            put_str(&mut obj, tags::PATIENT_ID, VR::LO, self.options.patient_id.as_str());

            put_str(&mut obj, tags::STUDY_DATE, VR::DA, date.as_str());
            put_str(&mut obj, tags::STUDY_TIME, VR::TM, time.as_str());
            put_str(&mut obj, tags::SERIES_DATE, VR::DA, date.as_str());
            put_str(&mut obj, tags::SERIES_TIME, VR::TM, time.as_str());
            put_str(&mut obj, tags::CONTENT_DATE, VR::DA, date.as_str());
            put_str(&mut obj, tags::CONTENT_TIME, VR::TM, time.as_str());
            put_str(&mut obj, tags::INSTANCE_CREATION_DATE, VR::DA, date.as_str());
            put_str(&mut obj, tags::INSTANCE_CREATION_TIME, VR::TM, time.as_str());

            obj.put(DataElement::new(
                tags::IMAGE_TYPE,
                VR::CS,
                PrimitiveValue::Strs(vec!["DERIVED".to_string(), "SECONDARY".to_string()].into()),
            ));
            put_str(&mut obj, tags::MODALITY, VR::CS, self.options.modality.as_str());
            put_str(
                &mut obj,
                tags::SERIES_DESCRIPTION,
                VR::LO,
                self.options.series_description.as_str(),
            );
            put_is(&mut obj, tags::SERIES_NUMBER, self.options.series_number);
            put_is(&mut obj, tags::INSTANCE_NUMBER, k as i64);

            let position = volume.index_to_physical([0.0, 0.0, k as f64]);
            put_ds(&mut obj, tags::IMAGE_POSITION_PATIENT, &position);
            put_ds(&mut obj, tags::IMAGE_ORIENTATION_PATIENT, &orientation);
            put_ds(&mut obj, tags::SLICE_LOCATION, &[dot(position, normal)]);
            // row spacing first
            put_ds(&mut obj, tags::PIXEL_SPACING, &[sy as f64, sx as f64]);
            put_ds(&mut obj, tags::SLICE_THICKNESS, &[sz as f64]);
            put_ds(&mut obj, tags::SPACING_BETWEEN_SLICES, &[sz as f64]);

            put_ds(&mut obj, tags::RESCALE_INTERCEPT, &[0.0]);
            put_ds(&mut obj, tags::RESCALE_SLOPE, &[1.0]);
            put_i16_image(&mut obj, volume.data.slice(s![k, .., ..]));

            let path = out_dir.join(format!("slice{k:04}.dcm"));
            write_object(obj, uids::CT_IMAGE_STORAGE, &sop_instance_uid, &path)?;
            debug!(path = %path.display(), "wrote slice");
            written.push(path);
        }
        info!(dir = %out_dir.display(), slices = depth, "wrote DICOM series");
        Ok(written)
    }
}
