//! Minimal NRRD (NRRD0004) codec covering the subset produced by common
//! medical imaging tools: attached data, raw/gzip/ascii encodings and
//! orthogonal or oblique space directions.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, Array4, Axis};
use tracing::debug;

use crate::enums::PixelType;
use crate::error::{Error, Result};
use crate::io::{decode_samples, encode_le};
use crate::volume::Volume;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Raw,
    Gzip,
    Ascii,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Space {
    Lps,
    Ras,
    Las,
}

#[derive(Debug)]
struct Header {
    pixel_type: PixelType,
    sizes: Vec<usize>,
    encoding: Encoding,
    little_endian: bool,
    space: Space,
    /// One entry per axis, `None` for non-spatial axes.
    directions: Option<Vec<Option<[f64; 3]>>>,
    origin: Option<[f64; 3]>,
    spacings: Option<Vec<f64>>,
}

pub fn read_nrrd(path: impl AsRef<Path>) -> Result<Volume> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let (header, body) = split_header(&bytes)?;
    let header = parse_header(header)?;

    let count = header
        .sizes
        .iter()
        .try_fold(1usize, |acc, &size| acc.checked_mul(size))
        .ok_or_else(|| Error::InvalidNrrd(format!("sizes {:?} overflow", header.sizes)))?;
    let samples = decode_body(body, &header, count)?;
    let volume = build_volume(&header, samples)?;
    debug!(path = %path.display(), dim = ?volume.dim(), spacing = ?volume.spacing, "read NRRD");
    Ok(volume)
}

/// Write `volume` as a gzip-encoded, little-endian NRRD in LPS space.
pub fn write_nrrd(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let (depth, height, width) = volume.dim();
    let spacing = [
        volume.spacing.0 as f64,
        volume.spacing.1 as f64,
        volume.spacing.2 as f64,
    ];
    let directions: Vec<String> = (0..3)
        .map(|axis| {
            format_vector([
                volume.direction[0][axis] * spacing[axis],
                volume.direction[1][axis] * spacing[axis],
                volume.direction[2][axis] * spacing[axis],
            ])
        })
        .collect();

    let mut text = String::from("NRRD0004\n");
    text.push_str("# Complete NRRD file format specification at:\n");
    text.push_str("# http://teem.sourceforge.net/nrrd/format.html\n");
    text.push_str(&format!("type: {}\n", type_name(volume.pixel_type)));
    text.push_str("dimension: 3\n");
    text.push_str("space: left-posterior-superior\n");
    text.push_str(&format!("sizes: {width} {height} {depth}\n"));
    text.push_str(&format!("space directions: {}\n", directions.join(" ")));
    text.push_str("kinds: domain domain domain\n");
    text.push_str("endian: little\n");
    text.push_str("encoding: gzip\n");
    text.push_str(&format!("space origin: {}\n\n", format_vector(volume.origin)));

    // standard layout of [z, y, x] is x-fastest, as NRRD expects
    let raw = encode_le(volume.data.iter(), volume.pixel_type);
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    let mut file = fs::File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.write_all(&compressed)?;
    debug!(path = %path.display(), "wrote NRRD");
    Ok(())
}

fn split_header(bytes: &[u8]) -> Result<(&str, &[u8])> {
    if !bytes.starts_with(b"NRRD000") {
        return Err(Error::InvalidNrrd("missing NRRD magic".to_string()));
    }
    let (end, skip) = bytes
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, 2))
        .or_else(|| {
            bytes
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|pos| (pos, 4))
        })
        .ok_or_else(|| Error::InvalidNrrd("header is not terminated".to_string()))?;
    let header = std::str::from_utf8(&bytes[..end])
        .map_err(|_| Error::InvalidNrrd("header is not valid text".to_string()))?;
    Ok((header, &bytes[end + skip..]))
}

fn parse_header(text: &str) -> Result<Header> {
    let mut fields = HashMap::new();
    for line in text.lines().skip(1) {
        let line = line.trim_end_matches('\r');
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        // key/value pairs (`key:=value`) carry no geometry
        if line.contains(":=") {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    if fields.contains_key("data file") || fields.contains_key("datafile") {
        return Err(Error::UnsupportedFormat(
            "NRRD with detached data file".to_string(),
        ));
    }

    let field = |key: &str| {
        fields
            .get(key)
            .ok_or_else(|| Error::InvalidNrrd(format!("missing field `{key}`")))
    };

    let pixel_type = parse_type(field("type")?)?;
    let dimension: usize = field("dimension")?
        .parse()
        .map_err(|_| Error::InvalidNrrd("bad dimension".to_string()))?;
    let sizes = field("sizes")?
        .split_whitespace()
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidNrrd("bad sizes".to_string()))?;
    if sizes.len() != dimension {
        return Err(Error::InvalidNrrd(format!(
            "{} sizes for dimension {dimension}",
            sizes.len()
        )));
    }
    if !(dimension == 3 || dimension == 4) {
        return Err(Error::UnsupportedFormat(format!(
            "{dimension}-dimensional NRRD"
        )));
    }

    let encoding = match field("encoding")?.to_ascii_lowercase().as_str() {
        "raw" => Encoding::Raw,
        "gzip" | "gz" => Encoding::Gzip,
        "ascii" | "text" | "txt" => Encoding::Ascii,
        other => return Err(Error::UnsupportedFormat(format!("NRRD encoding `{other}`"))),
    };
    let little_endian = fields
        .get("endian")
        .is_none_or(|endian| !endian.eq_ignore_ascii_case("big"));

    let space = match fields.get("space").map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "right-anterior-superior" || s == "ras" => Space::Ras,
        Some(s) if s == "left-anterior-superior" || s == "las" => Space::Las,
        _ => Space::Lps,
    };

    let directions = fields
        .get("space directions")
        .map(|value| parse_directions(value))
        .transpose()?;
    if let Some(directions) = &directions
        && directions.len() != dimension
    {
        return Err(Error::InvalidNrrd(
            "space directions do not match dimension".to_string(),
        ));
    }
    let origin = fields
        .get("space origin")
        .map(|value| parse_vector(value))
        .transpose()?;
    let spacings = fields.get("spacings").map(|value| {
        value
            .split_whitespace()
            .map(|s| s.parse::<f64>().unwrap_or(f64::NAN))
            .collect()
    });

    Ok(Header {
        pixel_type,
        sizes,
        encoding,
        little_endian,
        space,
        directions,
        origin,
        spacings,
    })
}

fn parse_type(name: &str) -> Result<PixelType> {
    let pixel_type = match name.to_ascii_lowercase().as_str() {
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => PixelType::U8,
        "signed char" | "int8" | "int8_t" => PixelType::I8,
        "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
            PixelType::I16
        }
        "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
            PixelType::U16
        }
        "int" | "signed int" | "int32" | "int32_t" => PixelType::I32,
        "uint" | "unsigned int" | "uint32" | "uint32_t" => PixelType::U32,
        "float" => PixelType::F32,
        "double" => PixelType::F64,
        other => return Err(Error::UnsupportedFormat(format!("NRRD type `{other}`"))),
    };
    Ok(pixel_type)
}

fn type_name(pixel_type: PixelType) -> &'static str {
    match pixel_type {
        PixelType::U8 => "uchar",
        PixelType::I8 => "signed char",
        PixelType::U16 => "ushort",
        PixelType::I16 => "short",
        PixelType::U32 => "uint",
        PixelType::I32 => "int",
        PixelType::F32 => "float",
        PixelType::F64 => "double",
    }
}

fn parse_vector(text: &str) -> Result<[f64; 3]> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::InvalidNrrd(format!("bad vector `{text}`")))?;
    let values = inner
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidNrrd(format!("bad vector `{text}`")))?;
    match values.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => Err(Error::InvalidNrrd(format!("expected 3 components in `{text}`"))),
    }
}

fn parse_directions(text: &str) -> Result<Vec<Option<[f64; 3]>>> {
    text.split_whitespace()
        .map(|token| {
            if token.eq_ignore_ascii_case("none") {
                Ok(None)
            } else {
                parse_vector(token).map(Some)
            }
        })
        .collect()
}

fn format_vector(v: [f64; 3]) -> String {
    format!("({},{},{})", v[0], v[1], v[2])
}

fn decode_body(body: &[u8], header: &Header, count: usize) -> Result<Vec<f32>> {
    let samples = match header.encoding {
        Encoding::Ascii => {
            let text = std::str::from_utf8(body)
                .map_err(|_| Error::InvalidNrrd("ascii data is not valid text".to_string()))?;
            text.split_whitespace()
                .take(count)
                .map(|v| v.parse::<f64>().map(|v| v as f32))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| Error::InvalidNrrd("bad ascii sample".to_string()))?
        }
        Encoding::Raw | Encoding::Gzip => {
            let expected = count
                .checked_mul(header.pixel_type.size_of())
                .ok_or_else(|| Error::InvalidNrrd(format!("{count} samples overflow")))?;
            let raw;
            let bytes = if header.encoding == Encoding::Gzip {
                // sized by what the stream holds, never by the header
                let mut buffer = Vec::new();
                GzDecoder::new(body)
                    .take((expected as u64).saturating_add(1))
                    .read_to_end(&mut buffer)?;
                raw = buffer;
                raw.as_slice()
            } else {
                body
            };
            if bytes.len() < expected {
                return Err(Error::InvalidNrrd(format!(
                    "expected {expected} bytes of data, found {}",
                    bytes.len()
                )));
            }
            decode_samples(&bytes[..expected], header.pixel_type, header.little_endian)
        }
    };
    if samples.len() != count {
        return Err(Error::InvalidNrrd(format!(
            "expected {count} samples, found {}",
            samples.len()
        )));
    }
    Ok(samples)
}

fn build_volume(header: &Header, samples: Vec<f32>) -> Result<Volume> {
    let sizes = &header.sizes;
    // index of the non-spatial axis of 4D data
    let extra_axis = if sizes.len() == 4 {
        let axis = header
            .directions
            .as_ref()
            .and_then(|dirs| dirs.iter().position(Option::is_none))
            .unwrap_or(0);
        if axis != 0 && axis != 3 {
            return Err(Error::UnsupportedFormat(
                "NRRD non-spatial axis must be first or last".to_string(),
            ));
        }
        Some(axis)
    } else {
        None
    };

    // NRRD sizes are fastest-first; ndarray shapes are slowest-first
    let data: Array3<f32> = match extra_axis {
        None => Array3::from_shape_vec((sizes[2], sizes[1], sizes[0]), samples)?,
        Some(0) => Array4::from_shape_vec((sizes[3], sizes[2], sizes[1], sizes[0]), samples)?
            .index_axis_move(Axis(3), 0),
        Some(_) => Array4::from_shape_vec((sizes[3], sizes[2], sizes[1], sizes[0]), samples)?
            .index_axis_move(Axis(0), 0),
    };

    let spatial: Vec<usize> = match extra_axis {
        Some(0) => vec![1, 2, 3],
        _ => vec![0, 1, 2],
    };

    let mut spacing = [1.0f64; 3];
    let mut direction = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    if let Some(directions) = &header.directions {
        for (col, &axis) in spatial.iter().enumerate() {
            let vector = directions[axis].ok_or_else(|| {
                Error::InvalidNrrd("spatial axis without a space direction".to_string())
            })?;
            let norm = (vector[0].powi(2) + vector[1].powi(2) + vector[2].powi(2)).sqrt();
            if norm > 0.0 {
                spacing[col] = norm;
                for row in 0..3 {
                    direction[row][col] = vector[row] / norm;
                }
            }
        }
    } else if let Some(spacings) = &header.spacings {
        for (col, &axis) in spatial.iter().enumerate() {
            if let Some(&value) = spacings.get(axis)
                && value.is_finite()
                && value > 0.0
            {
                spacing[col] = value;
            }
        }
    }

    let mut origin = header.origin.unwrap_or([0.0; 3]);
    let flipped_rows: &[usize] = match header.space {
        Space::Lps => &[],
        Space::Ras => &[0, 1],
        Space::Las => &[1],
    };
    for &row in flipped_rows {
        origin[row] = -origin[row];
        for value in direction[row].iter_mut() {
            *value = -*value;
        }
    }

    Ok(Volume::new(
        data,
        (spacing[0] as f32, spacing[1] as f32, spacing[2] as f32),
    )
    .with_geometry(origin, direction)
    .with_pixel_type(header.pixel_type))
}
