use std::fs;
use std::path::Path;

use medtk::batch::Converter;
use medtk::converters::{
    DicomToNiftiConverter, NiftiToDicomConverter, NiftiToNrrdConverter, NiftiToPngConverter,
    NrrdToNiftiConverter,
};
use medtk::datasets::{DataSplitter, MultiClassNiftiMerger, SplitOptions, check_consistency};
use medtk::io::{read_nifti, read_nrrd, write_nifti};
use medtk::preprocessing::{DicomCtWindowing, Window};
use medtk::{PixelType, SortBy, Volume, VolumeLoader};
use ndarray::Array3;
use tempfile::tempdir;

const IDENTITY: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn phantom() -> Volume {
    let data = Array3::from_shape_fn((6, 8, 8), |(z, y, x)| (z * 64 + y * 8 + x) as f32 - 100.0);
    Volume::new(data, (0.5, 0.5, 2.0)).with_geometry([-10.0, 20.0, 5.0], IDENTITY)
}

fn assert_close(a: [f64; 3], b: [f64; 3]) {
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-3, "{a:?} != {b:?}");
    }
}

#[test]
fn nifti_nrrd_nifti_keeps_voxels_and_geometry() {
    let dir = tempdir().unwrap();
    let nifti_dir = dir.path().join("nifti");
    fs::create_dir_all(&nifti_dir).unwrap();
    write_nifti(&phantom(), nifti_dir.join("case_01.nii.gz")).unwrap();

    let nrrd_dir = dir.path().join("nrrd");
    let report = NiftiToNrrdConverter.convert(&nifti_dir, &nrrd_dir).unwrap();
    assert_eq!(report.converted, vec![nrrd_dir.join("case_01.nrrd")]);
    let nrrd = read_nrrd(nrrd_dir.join("case_01.nrrd")).unwrap();
    assert_eq!(nrrd.data, phantom().data);

    let back_dir = dir.path().join("back");
    NrrdToNiftiConverter.convert(&nrrd_dir, &back_dir).unwrap();
    let back = read_nifti(back_dir.join("case_01.nii.gz")).unwrap();
    assert_eq!(back.data, phantom().data);
    assert_eq!(back.spacing, (0.5, 0.5, 2.0));
    assert_close(back.origin, [-10.0, 20.0, 5.0]);
}

#[test]
fn nifti_to_dicom_and_back() {
    let dir = tempdir().unwrap();
    let nifti = dir.path().join("scan.nii.gz");
    write_nifti(&phantom().with_pixel_type(PixelType::I16), &nifti).unwrap();

    let series_root = dir.path().join("dicom");
    let report = NiftiToDicomConverter::default().convert(&nifti, &series_root.join("scan")).unwrap();
    assert_eq!(report.converted.len(), 6);
    assert!(report.failed.is_empty());

    let out = dir.path().join("nifti");
    let report = DicomToNiftiConverter::default().convert(&series_root, &out).unwrap();
    assert_eq!(report.converted, vec![out.join("scan.nii.gz")]);

    let back = read_nifti(out.join("scan.nii.gz")).unwrap();
    assert_eq!(back.dim(), (6, 8, 8));
    assert_eq!(back.data, phantom().data);
    assert!((back.spacing.2 - 2.0).abs() < 1e-4);
    assert_close(back.origin, [-10.0, 20.0, 5.0]);
}

#[test]
fn ct_windowing_of_a_converted_series_stays_in_window() {
    let dir = tempdir().unwrap();
    let nifti = dir.path().join("ct.nii.gz");
    write_nifti(&phantom().with_pixel_type(PixelType::I16), &nifti).unwrap();
    let series = dir.path().join("series");
    NiftiToDicomConverter::default().convert(&nifti, &series).unwrap();

    let windowed = dir.path().join("windowed");
    let report = DicomCtWindowing::new(Window::new(40.0, 400.0))
        .process_directory(&series, &windowed)
        .unwrap();
    assert_eq!(report.converted.len(), 6);
    assert!(windowed.join("slice_0000.dcm").exists());

    let volume = VolumeLoader::load_from_directory(&windowed, SortBy::ImagePositionPatient).unwrap();
    let (min, max) = volume.min_max();
    assert!(min >= -160.5, "min {min}");
    assert!(max <= 240.5, "max {max}");
}

fn write_mask(path: &Path, value: impl Fn(usize, usize, usize) -> f32) {
    let data = Array3::from_shape_fn((2, 4, 4), |(z, y, x)| value(z, y, x));
    write_nifti(&Volume::new(data, (1.0, 1.0, 1.0)), path).unwrap();
}

#[test]
fn merged_classes_feed_png_export_and_split() {
    let dir = tempdir().unwrap();
    let volumes = dir.path().join("volumes");
    let liver = dir.path().join("liver");
    let spleen = dir.path().join("spleen");
    for folder in [&volumes, &liver, &spleen] {
        fs::create_dir_all(folder).unwrap();
    }
    for case in ["case_a", "case_b", "case_c", "case_d", "case_e"] {
        write_mask(&volumes.join(format!("{case}_volume.nii.gz")), |z, y, x| (z + y + x) as f32);
        write_mask(&liver.join(format!("{case}_volume.liver.nii.gz")), |_, y, _| f32::from(y < 2));
        write_mask(&spleen.join(format!("{case}_volume.spleen.nii.gz")), |_, _, x| f32::from(x == 3));
    }

    let merged = dir.path().join("merged");
    let report = MultiClassNiftiMerger::process_directories(
        &volumes,
        &[liver.clone(), spleen.clone()],
        &merged,
        ".nii.gz",
        true,
    )
    .unwrap();
    assert_eq!(report.converted.len(), 5);
    let labels = read_nifti(merged.join("segmentations/case_a_combined.nii.gz")).unwrap();
    assert_eq!(labels.data[[0, 0, 0]], 1.0);
    assert_eq!(labels.data[[0, 0, 3]], 2.0);
    assert_eq!(labels.data[[1, 3, 0]], 0.0);

    let png = dir.path().join("png");
    let report = NiftiToPngConverter::default()
        .run(
            Some(merged.join("volumes").as_path()),
            Some(merged.join("segmentations").as_path()),
            &png,
        )
        .unwrap();
    // two slices per case, for images and labels
    assert_eq!(report.converted.len(), 20);

    let split = dir.path().join("split");
    let (images, labels) = DataSplitter::new(png.join("images"), png.join("labels"), &split, SplitOptions::default())
        .run()
        .unwrap();
    assert_eq!(images.train.len(), 8);
    assert_eq!(images.valid.len(), 2);
    assert_eq!(labels.valid.len(), 2);
}

#[test]
fn split_of_identically_named_pairs_is_consistent() {
    let dir = tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&labels).unwrap();
    for i in 0..7 {
        fs::write(images.join(format!("img_{i}.png")), b"i").unwrap();
        fs::write(labels.join(format!("img_{i}.txt")), b"l").unwrap();
    }
    let out = dir.path().join("out");
    DataSplitter::new(&images, &labels, &out, SplitOptions::default())
        .run()
        .unwrap();
    assert!(check_consistency(&out).unwrap().is_empty());
}
