//! NIfTI-1 reading and writing on top of the `nifti` crate.
//!
//! NIfTI stores its affine in RAS world coordinates while [`Volume`] works in
//! LPS, so the first two world axes flip sign on the way in and out.

use std::path::Path;

use ndarray::{Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions};
use tracing::debug;

use crate::enums::PixelType;
use crate::error::{Error, Result};
use crate::volume::Volume;

const XYZT_UNITS_MM: u8 = 2;

pub fn read_nifti(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    let data = object.into_volume().into_ndarray::<f32>()?;

    // nifti arrays are indexed [i, j, k, (t)]
    let data = match data.ndim() {
        2 => data.insert_axis(Axis(2)).into_dimensionality::<Ix3>()?,
        3 => data.into_dimensionality::<Ix3>()?,
        4 => data.index_axis_move(Axis(3), 0).into_dimensionality::<Ix3>()?,
        n => {
            return Err(Error::UnsupportedFormat(format!(
                "{}: {n}-dimensional NIfTI",
                path.display()
            )));
        }
    };
    let data = data.permuted_axes([2, 1, 0]).as_standard_layout().into_owned();

    let (spacing, origin, direction) = geometry_from_header(&header);
    debug!(path = %path.display(), dim = ?data.dim(), ?spacing, ?origin, "read NIfTI");

    Ok(Volume::new(data, spacing)
        .with_geometry(origin, direction)
        .with_pixel_type(pixel_type_of(&header)))
}

/// Write `volume` as NIfTI-1, gzip-compressed when the path ends in `.gz`.
pub fn write_nifti(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let header = header_for(volume);
    let options = WriterOptions::new(path).reference_header(&header);
    // back to [i, j, k]
    let data = volume.data.view().reversed_axes();

    macro_rules! write_as {
        ($t:ty) => {
            options.write_nifti(&data.mapv(|v| v.round() as $t))?
        };
    }
    match volume.pixel_type {
        PixelType::U8 => write_as!(u8),
        PixelType::I8 => write_as!(i8),
        PixelType::U16 => write_as!(u16),
        PixelType::I16 => write_as!(i16),
        PixelType::U32 => write_as!(u32),
        PixelType::I32 => write_as!(i32),
        PixelType::F32 => options.write_nifti(&data.to_owned())?,
        PixelType::F64 => options.write_nifti(&data.mapv(|v| v as f64))?,
    }
    debug!(path = %path.display(), pixel_type = ?volume.pixel_type, "wrote NIfTI");
    Ok(())
}

fn pixel_type_of(header: &NiftiHeader) -> PixelType {
    let scaled = header.scl_slope != 0.0 && (header.scl_slope != 1.0 || header.scl_inter != 0.0);
    if scaled {
        return PixelType::F32;
    }
    match header.data_type() {
        Ok(NiftiType::Uint8) => PixelType::U8,
        Ok(NiftiType::Int8) => PixelType::I8,
        Ok(NiftiType::Uint16) => PixelType::U16,
        Ok(NiftiType::Int16) => PixelType::I16,
        Ok(NiftiType::Uint32) => PixelType::U32,
        Ok(NiftiType::Int32) => PixelType::I32,
        Ok(NiftiType::Float64) => PixelType::F64,
        _ => PixelType::F32,
    }
}

type Geometry = ((f32, f32, f32), [f64; 3], [[f64; 3]; 3]);

fn geometry_from_header(header: &NiftiHeader) -> Geometry {
    let pixdim = |i: usize| {
        let v = header.pixdim[i].abs();
        if v > 0.0 { v } else { 1.0 }
    };
    let spacing = (pixdim(1), pixdim(2), pixdim(3));

    let (mut origin, mut direction) = if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut direction = [[0.0f64; 3]; 3];
        for col in 0..3 {
            let column = [
                rows[0][col] as f64,
                rows[1][col] as f64,
                rows[2][col] as f64,
            ];
            let norm = (column[0].powi(2) + column[1].powi(2) + column[2].powi(2)).sqrt();
            for row in 0..3 {
                direction[row][col] = if norm > 0.0 {
                    column[row] / norm
                } else {
                    f64::from(u8::from(row == col))
                };
            }
        }
        let origin = [rows[0][3] as f64, rows[1][3] as f64, rows[2][3] as f64];
        (origin, direction)
    } else if header.qform_code > 0 {
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let mut direction = quaternion_to_rotation(
            header.quatern_b as f64,
            header.quatern_c as f64,
            header.quatern_d as f64,
        );
        for row in direction.iter_mut() {
            row[2] *= qfac;
        }
        let origin = [
            header.quatern_x as f64,
            header.quatern_y as f64,
            header.quatern_z as f64,
        ];
        (origin, direction)
    } else {
        ([0.0; 3], [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    };

    // RAS -> LPS
    for row in 0..2 {
        origin[row] = -origin[row];
        for value in direction[row].iter_mut() {
            *value = -*value;
        }
    }
    (spacing, origin, direction)
}

fn header_for(volume: &Volume) -> NiftiHeader {
    let (sx, sy, sz) = volume.spacing;
    let spacing = [sx as f64, sy as f64, sz as f64];

    // LPS -> RAS
    let mut direction = volume.direction;
    let mut origin = volume.origin;
    for row in 0..2 {
        origin[row] = -origin[row];
        for value in direction[row].iter_mut() {
            *value = -*value;
        }
    }

    let srow = |row: usize| -> [f32; 4] {
        [
            (direction[row][0] * spacing[0]) as f32,
            (direction[row][1] * spacing[1]) as f32,
            (direction[row][2] * spacing[2]) as f32,
            origin[row] as f32,
        ]
    };
    let (b, c, d, qfac) = rotation_to_quaternion(direction);

    NiftiHeader {
        pixdim: [qfac as f32, sx, sy, sz, 1.0, 1.0, 1.0, 1.0],
        scl_slope: 1.0,
        scl_inter: 0.0,
        xyzt_units: XYZT_UNITS_MM,
        qform_code: 1,
        sform_code: 1,
        quatern_b: b as f32,
        quatern_c: c as f32,
        quatern_d: d as f32,
        quatern_x: origin[0] as f32,
        quatern_y: origin[1] as f32,
        quatern_z: origin[2] as f32,
        srow_x: srow(0),
        srow_y: srow(1),
        srow_z: srow(2),
        ..Default::default()
    }
}

fn quaternion_to_rotation(b: f64, c: f64, d: f64) -> [[f64; 3]; 3] {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - c * c - b * b,
        ],
    ]
}

/// Quaternion parameters `(b, c, d, qfac)` of an orthonormal direction
/// matrix. A left-handed matrix is stored with `qfac = -1` and its third
/// column negated.
fn rotation_to_quaternion(mut r: [[f64; 3]; 3]) -> (f64, f64, f64, f64) {
    let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
        - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
        + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
    let qfac = if det < 0.0 { -1.0 } else { 1.0 };
    if qfac < 0.0 {
        for row in r.iter_mut() {
            row[2] = -row[2];
        }
    }

    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    let (a, b, c, d);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r[2][1] - r[1][2]) / a;
        c = 0.25 * (r[0][2] - r[2][0]) / a;
        d = 0.25 * (r[1][0] - r[0][1]) / a;
    } else {
        let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
        let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
        let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r[0][1] + r[1][0]) / b;
            d = 0.25 * (r[0][2] + r[2][0]) / b;
            a = 0.25 * (r[2][1] - r[1][2]) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r[0][1] + r[1][0]) / c;
            d = 0.25 * (r[1][2] + r[2][1]) / c;
            a = 0.25 * (r[0][2] - r[2][0]) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r[0][2] + r[2][0]) / d;
            c = 0.25 * (r[1][2] + r[2][1]) / d;
            a = 0.25 * (r[1][0] - r[0][1]) / d;
        }
    }
    // keep a >= 0 so it can be recovered from b, c, d
    if a < 0.0 { (-b, -c, -d, qfac) } else { (b, c, d, qfac) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_matrix_eq(a: [[f64; 3]; 3], b: [[f64; 3]; 3]) {
        for row in 0..3 {
            for col in 0..3 {
                assert!(
                    (a[row][col] - b[row][col]).abs() < 1e-6,
                    "{a:?} != {b:?}"
                );
            }
        }
    }

    #[test]
    fn quaternion_round_trip_for_rotation() {
        // 90 degrees about z
        let r = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let (b, c, d, qfac) = rotation_to_quaternion(r);
        assert_eq!(qfac, 1.0);
        assert_matrix_eq(quaternion_to_rotation(b, c, d), r);
    }

    #[test]
    fn quaternion_of_left_handed_matrix_uses_qfac() {
        let r = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]];
        let (b, c, d, qfac) = rotation_to_quaternion(r);
        assert_eq!(qfac, -1.0);
        let mut back = quaternion_to_rotation(b, c, d);
        for row in back.iter_mut() {
            row[2] *= qfac;
        }
        assert_matrix_eq(back, r);
    }

    #[test]
    fn header_geometry_round_trip() {
        let data = ndarray::Array3::<f32>::zeros((3, 4, 5));
        let volume = Volume::new(data, (0.8, 0.9, 2.5)).with_geometry(
            [-120.0, 30.5, 7.0],
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        );
        let header = header_for(&volume);
        // LPS identity becomes a RAS affine with flipped x/y
        assert_eq!(header.srow_x, [-0.8, 0.0, 0.0, 120.0]);
        assert_eq!(header.srow_y, [0.0, -0.9, 0.0, -30.5]);

        let (spacing, origin, direction) = geometry_from_header(&header);
        assert_eq!(spacing, (0.8, 0.9, 2.5));
        assert_eq!(origin, [-120.0, 30.5, 7.0]);
        assert_matrix_eq(direction, volume.direction);
    }

    #[test]
    fn qform_geometry_without_sform() {
        let data = ndarray::Array3::<f32>::zeros((2, 2, 2));
        let direction = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let volume = Volume::new(data, (1.5, 1.5, 3.0)).with_geometry([-64.0, 12.5, -30.0], direction);
        let mut header = header_for(&volume);
        assert_eq!([header.quatern_x, header.quatern_y, header.quatern_z], [64.0, -12.5, -30.0]);
        header.sform_code = 0;

        let (spacing, origin, back) = geometry_from_header(&header);
        assert_eq!(spacing, (1.5, 1.5, 3.0));
        assert_eq!(origin, [-64.0, 12.5, -30.0]);
        assert_matrix_eq(back, direction);
    }
}
