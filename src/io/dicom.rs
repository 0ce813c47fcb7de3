//! Small helpers for building and reading DICOM data sets with dicom-rs.

use std::path::Path;

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use ndarray::ArrayView2;
use uuid::Uuid;

use crate::error::Result;

/// Attributes shared by every object derived from a patient's study.
pub(crate) const PATIENT_STUDY_TAGS: [Tag; 11] = [
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::FRAME_OF_REFERENCE_UID,
];

/// A globally unique UID under the `2.25` (UUID-derived) root.
pub fn new_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Current local date (`YYYYMMDD`) and time (`HHMMSS`).
pub fn now_date_time() -> (String, String) {
    let now = chrono::Local::now();
    (
        now.format("%Y%m%d").to_string(),
        now.format("%H%M%S").to_string(),
    )
}

/// Decimal String representation, at most 16 characters.
pub fn format_ds(value: f64) -> String {
    let plain = format!("{value}");
    if plain.len() <= 16 {
        return plain;
    }
    for precision in (0..=14).rev() {
        let text = format!("{value:.precision$}");
        let text = if text.contains('.') {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            text
        };
        if text.len() <= 16 {
            return text;
        }
    }
    format!("{value:.6e}")
}

pub(crate) fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: impl Into<String>) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value.into())));
}

/// Multi-valued Decimal String (`a\b\c`).
pub(crate) fn put_ds(obj: &mut InMemDicomObject, tag: Tag, values: &[f64]) {
    let text: Vec<String> = values.iter().map(|&v| format_ds(v)).collect();
    obj.put(DataElement::new(tag, VR::DS, PrimitiveValue::Strs(text.into())));
}

pub(crate) fn put_is(obj: &mut InMemDicomObject, tag: Tag, value: i64) {
    put_str(obj, tag, VR::IS, value.to_string());
}

pub(crate) fn put_us(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
}

pub(crate) fn put_ul(obj: &mut InMemDicomObject, tag: Tag, values: &[u32]) {
    obj.put(DataElement::new(
        tag,
        VR::UL,
        PrimitiveValue::U32(values.to_vec().into()),
    ));
}

pub(crate) fn put_tags(obj: &mut InMemDicomObject, tag: Tag, values: &[Tag]) {
    obj.put(DataElement::new(
        tag,
        VR::AT,
        PrimitiveValue::Tags(values.to_vec().into()),
    ));
}

pub(crate) fn put_bytes(obj: &mut InMemDicomObject, tag: Tag, vr: VR, mut bytes: Vec<u8>) {
    // even value length
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(bytes)));
}

/// Replace the image pixel module of `obj` with signed 16-bit samples of
/// `image` (rounded and saturated).
pub(crate) fn put_i16_image(obj: &mut InMemDicomObject, image: ArrayView2<'_, f32>) {
    let (rows, columns) = image.dim();
    put_us(obj, tags::ROWS, rows as u16);
    put_us(obj, tags::COLUMNS, columns as u16);
    put_us(obj, tags::SAMPLES_PER_PIXEL, 1);
    put_str(obj, tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2");
    put_us(obj, tags::BITS_ALLOCATED, 16);
    put_us(obj, tags::BITS_STORED, 16);
    put_us(obj, tags::HIGH_BIT, 15);
    put_us(obj, tags::PIXEL_REPRESENTATION, 1);
    let bytes = image
        .iter()
        .flat_map(|&v| (v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16).to_le_bytes())
        .collect();
    put_bytes(obj, tags::PIXEL_DATA, VR::OW, bytes);
}

pub(crate) fn put_sequence(obj: &mut InMemDicomObject, tag: Tag, items: Vec<InMemDicomObject>) {
    obj.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
}

/// Copy the attributes in `tags` that are present in `source`.
pub(crate) fn copy_elements(source: &InMemDicomObject, target: &mut InMemDicomObject, tags: &[Tag]) {
    for &tag in tags {
        if let Ok(element) = source.element(tag) {
            target.put(element.clone());
        }
    }
}

pub(crate) fn read_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!value.is_empty()).then(|| value.to_string())
}

pub(crate) fn read_f64s(obj: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

pub(crate) fn read_f64(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

pub(crate) fn read_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element(tag).ok()?.to_int::<i64>().ok()
}

/// Coded concept (code value, scheme, meaning) stored as a one-item
/// sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Code {
    pub value: String,
    pub scheme: String,
    pub meaning: String,
}

impl Code {
    pub fn new(value: &str, scheme: &str, meaning: &str) -> Self {
        Self {
            value: value.to_string(),
            scheme: scheme.to_string(),
            meaning: meaning.to_string(),
        }
    }

    pub(crate) fn to_item(&self) -> InMemDicomObject {
        let mut item = InMemDicomObject::new_empty();
        put_str(&mut item, tags::CODE_VALUE, VR::SH, self.value.as_str());
        put_str(&mut item, tags::CODING_SCHEME_DESIGNATOR, VR::SH, self.scheme.as_str());
        put_str(&mut item, tags::CODE_MEANING, VR::LO, self.meaning.as_str());
        item
    }
}

/// Wrap `obj` in a file meta group (explicit VR little endian) and write it.
pub fn write_object(
    obj: InMemDicomObject,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    path: impl AsRef<Path>,
) -> Result<()> {
    let file = obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(sop_instance_uid),
    )?;
    file.write_to_file(path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_strings_fit_sixteen_characters() {
        assert_eq!(format_ds(0.5), "0.5");
        assert_eq!(format_ds(-120.0), "-120");
        let long = format_ds(1.0 / 3.0);
        assert!(long.len() <= 16, "{long}");
        assert!(long.starts_with("0.3333"));
        assert!(format_ds(-123456.789012345678).len() <= 16);
    }

    #[test]
    fn uids_are_unique_and_short() {
        let a = new_uid();
        let b = new_uid();
        assert_ne!(a, b);
        assert!(a.starts_with("2.25."));
        assert!(a.len() <= 64);
    }

    #[test]
    fn elements_round_trip_through_helpers() {
        let mut obj = InMemDicomObject::new_empty();
        put_ds(&mut obj, tags::PIXEL_SPACING, &[0.75, 0.8]);
        put_is(&mut obj, tags::INSTANCE_NUMBER, 12);
        put_str(&mut obj, tags::PATIENT_NAME, VR::PN, "Doe^John");
        assert_eq!(read_f64s(&obj, tags::PIXEL_SPACING), Some(vec![0.75, 0.8]));
        assert_eq!(read_int(&obj, tags::INSTANCE_NUMBER), Some(12));
        assert_eq!(read_string(&obj, tags::PATIENT_NAME).as_deref(), Some("Doe^John"));
        assert_eq!(read_string(&obj, tags::STUDY_ID), None);
    }

    #[test]
    fn code_items_use_standard_code_attributes() {
        let item = Code::new("85756007", "SCT", "Tissue").to_item();
        assert_eq!(read_string(&item, Tag(0x0008, 0x0100)).as_deref(), Some("85756007"));
        assert_eq!(read_string(&item, Tag(0x0008, 0x0102)).as_deref(), Some("SCT"));
        assert_eq!(read_string(&item, Tag(0x0008, 0x0104)).as_deref(), Some("Tissue"));
    }
}
