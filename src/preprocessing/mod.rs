//! Intensity windowing and anonymization applied before training or sharing.

pub mod anonymization;
pub mod windowing;

pub use self::anonymization::{ANONYMIZATION_FIELDS, DicomAnonymizer};
pub use self::windowing::{
    DicomCtWindowing, DicomMriWindowing, NiftiCtWindowing, NiftiMriWindowing, Window,
};
