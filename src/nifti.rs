//! Minimal NIfTI-1 single-file (`n+1`) codec.
//!
//! Volumes are `(Z, Y, X)` arrays whose raw little-endian bytes are written
//! x-fastest, matching the on-disk voxel order. Geometry is converted between
//! the LPS frame used everywhere else in the crate and the RAS frame NIfTI
//! affines are defined in. Encoded output is always gzip-compressed; decoding
//! accepts both plain and gzipped input.

use crate::error::{PipelineError, Result};
use crate::volume::Geometry;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array3, ArrayView3};
use std::io::{Read, Write};
use std::path::Path;
use tracing::warn;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_UINT16: i16 = 512;

/// NIFTI_XFORM_SCANNER_ANAT
const XFORM_SCANNER: i16 = 1;
/// mm + sec
const UNITS_MM_SEC: u8 = 2 | 8;

// LPS <-> RAS differs only in the sign of the first two physical axes.
const RAS_SIGN: [f64; 3] = [-1.0, -1.0, 1.0];

/// Voxel types the writer can emit.
pub trait NiftiVoxel: Copy {
    const DATATYPE: i16;
    const BITPIX: i16;
    fn put_le(self, out: &mut Vec<u8>);
}

impl NiftiVoxel for u8 {
    const DATATYPE: i16 = DT_UINT8;
    const BITPIX: i16 = 8;
    fn put_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

impl NiftiVoxel for f32 {
    const DATATYPE: i16 = DT_FLOAT32;
    const BITPIX: i16 = 32;
    fn put_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

struct HeaderWriter {
    buf: Vec<u8>,
}

impl HeaderWriter {
    fn new() -> Self {
        Self {
            buf: vec![0u8; VOX_OFFSET],
        }
    }

    fn i16(&mut self, at: usize, v: i16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, at: usize, v: i32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, at: usize, v: f64) {
        self.buf[at..at + 4].copy_from_slice(&(v as f32).to_le_bytes());
    }

    fn text(&mut self, at: usize, max: usize, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(max - 1);
        self.buf[at..at + n].copy_from_slice(&bytes[..n]);
    }
}

/// Voxel-to-RAS affine rows (srow_x, srow_y, srow_z).
fn ras_affine(geometry: &Geometry) -> [[f64; 4]; 3] {
    let sp = xyz_spacing(geometry.spacing);
    let mut rows = [[0.0; 4]; 3];
    for r in 0..3 {
        for c in 0..3 {
            rows[r][c] = RAS_SIGN[r] * geometry.direction[r * 3 + c] * sp[c];
        }
        rows[r][3] = RAS_SIGN[r] * geometry.origin[r];
    }
    rows
}

fn xyz_spacing(zyx: [f64; 3]) -> [f64; 3] {
    [zyx[2], zyx[1], zyx[0]]
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Rotation matrix to quaternion (b, c, d) plus qfac.
fn rotation_to_quaternion(mut r: [[f64; 3]; 3]) -> ([f64; 3], f64) {
    let qfac = if det3(&r) > 0.0 {
        1.0
    } else {
        for row in r.iter_mut() {
            row[2] = -row[2];
        }
        -1.0
    };

    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    let (a, mut b, mut c, mut d);
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
        if a < 0.0 {
            b = -b;
            c = -c;
            d = -d;
        }
    }
    ([b, c, d], qfac)
}

fn quaternion_to_rotation(b: f64, c: f64, d: f64, qfac: f64) -> [[f64; 3]; 3] {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let q = if qfac < 0.0 { -1.0 } else { 1.0 };
    [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), q * 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, q * 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), q * (a * a + d * d - c * c - b * b)],
    ]
}

/// Encodes `volume` as a gzipped NIfTI-1 file.
pub fn encode<T: NiftiVoxel>(volume: ArrayView3<T>, geometry: &Geometry, description: &str) -> Result<Vec<u8>> {
    let (nz, ny, nx) = volume.dim();
    let sp = xyz_spacing(geometry.spacing);
    let affine = ras_affine(geometry);

    let mut rotation = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            rotation[r][c] = RAS_SIGN[r] * geometry.direction[r * 3 + c];
        }
    }
    let ([qb, qc, qd], qfac) = rotation_to_quaternion(rotation);

    let mut h = HeaderWriter::new();
    h.i32(0, HEADER_SIZE as i32);
    h.buf[38] = b'r';
    for (i, n) in [3usize, nx, ny, nz, 1, 1, 1, 1].into_iter().enumerate() {
        let n = i16::try_from(n).map_err(|_| {
            PipelineError::Codec(format!("dimension {} too large for NIfTI-1", n))
        })?;
        h.i16(40 + 2 * i, n);
    }
    h.i16(70, T::DATATYPE);
    h.i16(72, T::BITPIX);
    for (i, v) in [qfac, sp[0], sp[1], sp[2], 1.0, 1.0, 1.0, 1.0].into_iter().enumerate() {
        h.f32(76 + 4 * i, v);
    }
    h.f32(108, VOX_OFFSET as f64);
    h.f32(112, 1.0);
    h.buf[123] = UNITS_MM_SEC;
    h.text(148, 80, description);
    h.i16(252, XFORM_SCANNER);
    h.i16(254, XFORM_SCANNER);
    h.f32(256, qb);
    h.f32(260, qc);
    h.f32(264, qd);
    h.f32(268, affine[0][3]);
    h.f32(272, affine[1][3]);
    h.f32(276, affine[2][3]);
    for (r, row) in affine.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            h.f32(280 + 16 * r + 4 * c, v);
        }
    }
    h.buf[344..348].copy_from_slice(b"n+1\0");

    let mut raw = h.buf;
    raw.reserve(volume.len() * (T::BITPIX as usize / 8));
    // Logical (z, y, x) iteration order is x-fastest regardless of memory layout.
    for &v in volume.iter() {
        v.put_le(&mut raw);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

struct HeaderReader<'a> {
    buf: &'a [u8],
    little: bool,
}

impl HeaderReader<'_> {
    fn i16(&self, at: usize) -> i16 {
        let b = [self.buf[at], self.buf[at + 1]];
        if self.little {
            i16::from_le_bytes(b)
        } else {
            i16::from_be_bytes(b)
        }
    }

    fn i32(&self, at: usize) -> i32 {
        let b = [self.buf[at], self.buf[at + 1], self.buf[at + 2], self.buf[at + 3]];
        if self.little {
            i32::from_le_bytes(b)
        } else {
            i32::from_be_bytes(b)
        }
    }

    fn f32(&self, at: usize) -> f64 {
        f32::from_bits(self.i32(at) as u32) as f64
    }
}

fn geometry_from_header(h: &HeaderReader) -> Geometry {
    let pixdim: Vec<f64> = (0..8).map(|i| h.f32(76 + 4 * i)).collect();
    let pix_xyz = [pixdim[1], pixdim[2], pixdim[3]].map(|v| if v > 0.0 { v } else { 1.0 });

    let mut geometry = Geometry {
        spacing: [pix_xyz[2], pix_xyz[1], pix_xyz[0]],
        ..Geometry::default()
    };

    if h.i16(254) > 0 {
        let mut m = [[0.0; 4]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = h.f32(280 + 16 * r + 4 * c);
            }
        }
        let mut sp = [0.0; 3];
        for (c, s) in sp.iter_mut().enumerate() {
            *s = (0..3).map(|r| m[r][c] * m[r][c]).sum::<f64>().sqrt();
            if *s == 0.0 {
                *s = 1.0;
            }
        }
        for r in 0..3 {
            for c in 0..3 {
                geometry.direction[r * 3 + c] = RAS_SIGN[r] * m[r][c] / sp[c];
            }
            geometry.origin[r] = RAS_SIGN[r] * m[r][3];
        }
        geometry.spacing = [sp[2], sp[1], sp[0]];
    } else if h.i16(252) > 0 {
        let rotation = quaternion_to_rotation(h.f32(256), h.f32(260), h.f32(264), pixdim[0]);
        let offset = [h.f32(268), h.f32(272), h.f32(276)];
        for r in 0..3 {
            for c in 0..3 {
                geometry.direction[r * 3 + c] = RAS_SIGN[r] * rotation[r][c];
            }
            geometry.origin[r] = RAS_SIGN[r] * offset[r];
        }
    }
    geometry
}

/// Decodes a NIfTI-1 volume (plain or gzipped) into `f32` voxels.
pub fn decode(bytes: &[u8]) -> Result<(Array3<f32>, Geometry)> {
    let raw: Vec<u8>;
    let data = if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        raw = out;
        raw.as_slice()
    } else {
        bytes
    };

    if data.len() < HEADER_SIZE {
        return Err(PipelineError::Codec("NIfTI header truncated".into()));
    }
    let little = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) == HEADER_SIZE as i32;
    let big = i32::from_be_bytes([data[0], data[1], data[2], data[3]]) == HEADER_SIZE as i32;
    if !little && !big {
        return Err(PipelineError::Codec("not a NIfTI-1 header".into()));
    }
    let h = HeaderReader { buf: data, little };

    let ndim = h.i16(40);
    if !(3..=7).contains(&ndim) {
        return Err(PipelineError::Codec(format!("unsupported dimensionality {}", ndim)));
    }
    let dims: Vec<usize> = (1..=3).map(|i| h.i16(40 + 2 * i).max(1) as usize).collect();
    let (nx, ny, nz) = (dims[0], dims[1], dims[2]);
    if ndim > 3 && h.i16(48) > 1 {
        warn!("NIfTI volume has {} frames, reading the first", h.i16(48));
    }

    let datatype = h.i16(70);
    let width = match datatype {
        DT_UINT8 => 1,
        DT_INT16 | DT_UINT16 => 2,
        DT_INT32 | DT_FLOAT32 => 4,
        DT_FLOAT64 => 8,
        other => return Err(PipelineError::Codec(format!("unsupported NIfTI datatype {}", other))),
    };

    let offset = (h.f32(108) as usize).max(VOX_OFFSET);
    let count = nx * ny * nz;
    let end = offset + count * width;
    if data.len() < end {
        return Err(PipelineError::Codec(format!(
            "NIfTI data truncated: expected {} bytes, got {}",
            end,
            data.len()
        )));
    }

    let reader = HeaderReader { buf: data, little };
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + i * width;
        let v = match datatype {
            DT_UINT8 => data[at] as f64,
            DT_INT16 => reader.i16(at) as f64,
            DT_UINT16 => reader.i16(at) as u16 as f64,
            DT_INT32 => reader.i32(at) as f64,
            DT_FLOAT32 => reader.f32(at),
            _ => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&data[at..at + 8]);
                if little {
                    f64::from_le_bytes(b)
                } else {
                    f64::from_be_bytes(b)
                }
            }
        };
        values.push(v);
    }

    let slope = h.f32(112);
    let inter = h.f32(116);
    let scaled = slope != 0.0 && (slope != 1.0 || inter != 0.0);
    let values: Vec<f32> = values
        .into_iter()
        .map(|v| if scaled { (v * slope + inter) as f32 } else { v as f32 })
        .collect();

    let volume = Array3::from_shape_vec((nz, ny, nx), values)?;
    Ok((volume, geometry_from_header(&h)))
}

pub fn read_file(path: &Path) -> Result<(Array3<f32>, Geometry)> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

pub fn write_file<T: NiftiVoxel>(path: &Path, volume: ArrayView3<T>, geometry: &Geometry) -> Result<()> {
    let bytes = encode(volume, geometry, "")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}
