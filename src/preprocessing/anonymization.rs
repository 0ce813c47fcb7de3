use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::open_file;
use dicom_dictionary_std::tags;
use tracing::info;

use crate::batch::{BatchReport, list_inputs};
use crate::error::{Error, Result};
use crate::io::dicom::{new_uid, read_string, write_object};

/// Attributes that can be anonymized, by keyword.
pub const ANONYMIZATION_FIELDS: [(&str, Tag); 9] = [
    ("PatientName", tags::PATIENT_NAME),
    ("PatientID", tags::PATIENT_ID),
    ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    ("PatientSex", tags::PATIENT_SEX),
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("StudyID", tags::STUDY_ID),
    ("InstitutionName", tags::INSTITUTION_NAME),
    ("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME),
];

const REPLACEMENT: &str = "Anonymized";

/// Replaces selected identifying attributes of every DICOM file in a
/// directory. Replaced UIDs are mapped consistently, so files of one series
/// still share a series after anonymization.
#[derive(Debug)]
pub struct DicomAnonymizer {
    fields: Vec<(&'static str, Tag)>,
    uid_map: HashMap<String, String>,
}

impl DicomAnonymizer {
    /// Keywords accepted by [`DicomAnonymizer::new`].
    pub fn list_fields() -> Vec<&'static str> {
        ANONYMIZATION_FIELDS.iter().map(|(name, _)| *name).collect()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for a keyword outside
    /// [`ANONYMIZATION_FIELDS`].
    pub fn new<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        let fields = fields
            .iter()
            .map(|field| {
                let field = field.as_ref().trim();
                ANONYMIZATION_FIELDS
                    .iter()
                    .find(|(name, _)| *name == field)
                    .copied()
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown anonymization field {field:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fields,
            uid_map: HashMap::new(),
        })
    }

    fn replacement(&mut self, vr: VR, current: Option<String>) -> PrimitiveValue {
        match vr {
            VR::UI => {
                let current = current.unwrap_or_default();
                let uid = self.uid_map.entry(current).or_insert_with(new_uid).clone();
                PrimitiveValue::from(uid)
            }
            VR::DA | VR::CS => PrimitiveValue::Empty,
            _ => PrimitiveValue::from(REPLACEMENT),
        }
    }

    fn anonymize_file(&mut self, input: &Path, output_dir: &Path) -> Result<PathBuf> {
        let mut obj = open_file(input)?.into_inner();
        for (_, tag) in self.fields.clone() {
            let Ok(element) = obj.element(tag) else {
                continue;
            };
            let vr = element.vr();
            let value = self.replacement(vr, read_string(&obj, tag));
            obj.put(DataElement::new(tag, vr, value));
        }
        let sop_class = read_string(&obj, tags::SOP_CLASS_UID).unwrap_or_default();
        let sop_instance = read_string(&obj, tags::SOP_INSTANCE_UID).unwrap_or_else(new_uid);
        let name = input
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(input.display().to_string()))?;
        let output = output_dir.join(name);
        write_object(obj, &sop_class, &sop_instance, &output)?;
        Ok(output)
    }

    /// Anonymize every `.dcm` file of `input_dir` into `output_dir`, keeping
    /// file names. Files that fail are logged and skipped.
    pub fn anonymize_directory(&mut self, input_dir: &Path, output_dir: &Path) -> Result<BatchReport> {
        if !input_dir.exists() {
            return Err(Error::NotFound(input_dir.to_path_buf()));
        }
        fs::create_dir_all(output_dir)?;
        let mut report = BatchReport::new();
        for input in list_inputs(input_dir, &[".dcm"])? {
            match self.anonymize_file(&input, output_dir) {
                Ok(output) => report.record_success(output),
                Err(err) => report.record_failure(&input, err),
            }
        }
        info!(
            dir = %input_dir.display(),
            files = report.converted.len(),
            fields = ?self.fields.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "anonymization complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DicomSeriesOptions, DicomSeriesWriter};
    use crate::volume::Volume;
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            DicomAnonymizer::new(&["PatientName", "Shoe size"]),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(DicomAnonymizer::list_fields().len(), 9);
    }

    #[test]
    fn replaces_selected_fields_only() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        let options = DicomSeriesOptions {
            patient_name: "Doe^Jane".to_string(),
            patient_id: "12345".to_string(),
            ..Default::default()
        };
        DicomSeriesWriter::new(options)
            .write(&Volume::new(Array3::zeros((2, 2, 2)), (1.0, 1.0, 1.0)), &input)
            .unwrap();

        let original = open_file(input.join("slice0000.dcm")).unwrap();
        let series_uid = read_string(&original, tags::SERIES_INSTANCE_UID).unwrap();

        let mut anonymizer = DicomAnonymizer::new(&["PatientName", "SeriesInstanceUID"]).unwrap();
        let report = anonymizer.anonymize_directory(&input, &output).unwrap();
        assert_eq!(report.converted.len(), 2);

        let first = open_file(output.join("slice0000.dcm")).unwrap();
        let second = open_file(output.join("slice0001.dcm")).unwrap();
        assert_eq!(read_string(&first, tags::PATIENT_NAME).as_deref(), Some("Anonymized"));
        assert_eq!(read_string(&first, tags::PATIENT_ID).as_deref(), Some("12345"));

        let new_series = read_string(&first, tags::SERIES_INSTANCE_UID).unwrap();
        assert_ne!(new_series, series_uid);
        assert_eq!(read_string(&second, tags::SERIES_INSTANCE_UID), Some(new_series));
    }
}
