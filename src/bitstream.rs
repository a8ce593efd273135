//! BGBS bitstream codec: packed truth tables for a whole grid.
//!
//! Layout is little-endian throughout. A 24-byte header
//! (magic "BGBS", version, header size, grid dims, scan order, flags,
//! payload bit count, payload CRC-32, reserved) is followed by the payload:
//! for every cell in scan order, the four output tables in N,E,S,W order,
//! each 16 bits, packed LSB-first into bytes. Cells absent from the program
//! pack as zeros. Raw headerless payloads are also accepted when the caller
//! already knows the dims; they get the row-major order and no CRC check.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use thiserror::Error;

use crate::program::{Cell, Coord, Program};

pub const MAGIC: [u8; 4] = *b"BGBS";
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 24;

/// Cell visit order of the packed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    RowMajor = 0,
    ColMajor = 1,
    /// Row-major with every odd row reversed.
    Snake = 2,
}

impl ScanOrder {
    pub fn from_u8(v: u8) -> Option<ScanOrder> {
        match v {
            0 => Some(ScanOrder::RowMajor),
            1 => Some(ScanOrder::ColMajor),
            2 => Some(ScanOrder::Snake),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<ScanOrder> {
        match name {
            "row" | "row-major" => Some(ScanOrder::RowMajor),
            "col" | "col-major" => Some(ScanOrder::ColMajor),
            "snake" => Some(ScanOrder::Snake),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScanOrder::RowMajor => "row-major",
            ScanOrder::ColMajor => "col-major",
            ScanOrder::Snake => "snake",
        }
    }

    /// All grid coordinates in this order.
    pub fn coords(self, width: u16, height: u16) -> Vec<Coord> {
        let mut out = Vec::with_capacity(width as usize * height as usize);
        match self {
            ScanOrder::RowMajor => {
                for y in 0..height {
                    for x in 0..width {
                        out.push(Coord::new(x, y));
                    }
                }
            }
            ScanOrder::ColMajor => {
                for x in 0..width {
                    for y in 0..height {
                        out.push(Coord::new(x, y));
                    }
                }
            }
            ScanOrder::Snake => {
                for y in 0..height {
                    if y % 2 == 0 {
                        for x in 0..width {
                            out.push(Coord::new(x, y));
                        }
                    } else {
                        for x in (0..width).rev() {
                            out.push(Coord::new(x, y));
                        }
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum BitstreamError {
    #[error("bitstream shorter than the {HEADER_SIZE}-byte header ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported bitstream version {0}")]
    UnsupportedVersion(u16),
    #[error("bad header size {0}")]
    BadHeaderSize(u16),
    #[error("unknown scan order {0}")]
    UnknownOrder(u8),
    #[error("payload CRC mismatch: header {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },
    #[error("payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLength { expected: usize, actual: usize },
    #[error("bitstream is {bs_width}x{bs_height} but the program is {width}x{height}")]
    DimsMismatch {
        bs_width: u16,
        bs_height: u16,
        width: u16,
        height: u16,
    },
}

/// Parsed BGBS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub width: u16,
    pub height: u16,
    pub order: ScanOrder,
    pub flags: u8,
    pub payload_bits: u32,
    pub payload_crc32: u32,
}

impl Header {
    pub fn payload_bytes(&self) -> usize {
        (self.payload_bits as usize + 7) / 8
    }
}

/// What a successful apply did, for logging and protocol replies.
#[derive(Debug, Clone, Copy)]
pub struct ApplyInfo {
    pub headered: bool,
    pub cells_touched: usize,
    pub order: ScanOrder,
}

fn payload_len(width: u16, height: u16) -> usize {
    width as usize * height as usize * 8 // 4 outputs x 16 bits = 8 bytes/cell
}

/// Pack just the payload in the given scan order.
pub fn pack_payload(prog: &Program, order: ScanOrder) -> Vec<u8> {
    let mut out = vec![0u8; payload_len(prog.width, prog.height)];
    let mut bitpos = 0usize;
    for coord in order.coords(prog.width, prog.height) {
        let outputs = prog
            .cells
            .get(&coord)
            .map(|c| c.outputs)
            .unwrap_or([0; 4]);
        for table in outputs {
            for b in 0..16 {
                if (table >> b) & 1 == 1 {
                    out[bitpos >> 3] |= 1 << (bitpos & 7);
                }
                bitpos += 1;
            }
        }
    }
    out
}

/// Pack a complete headered bitstream.
pub fn pack(prog: &Program, order: ScanOrder, flags: u8) -> Vec<u8> {
    let payload = pack_payload(prog, order);
    let mut out = vec![0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&MAGIC);
    LittleEndian::write_u16(&mut out[4..6], VERSION);
    LittleEndian::write_u16(&mut out[6..8], HEADER_SIZE as u16);
    LittleEndian::write_u16(&mut out[8..10], prog.width);
    LittleEndian::write_u16(&mut out[10..12], prog.height);
    out[12] = order as u8;
    out[13] = flags;
    LittleEndian::write_u32(&mut out[14..18], (payload.len() * 8) as u32);
    LittleEndian::write_u32(&mut out[18..22], crc32fast::hash(&payload));
    // bytes 22..24 reserved, zero
    out.extend_from_slice(&payload);
    out
}

/// Parse and validate a BGBS header.
pub fn parse_header(data: &[u8]) -> Result<Header, BitstreamError> {
    if data.len() < HEADER_SIZE {
        return Err(BitstreamError::TooShort(data.len()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[0..4]);
    if magic != MAGIC {
        return Err(BitstreamError::BadMagic(magic));
    }
    let version = LittleEndian::read_u16(&data[4..6]);
    if version != VERSION {
        return Err(BitstreamError::UnsupportedVersion(version));
    }
    let header_size = LittleEndian::read_u16(&data[6..8]);
    if header_size as usize != HEADER_SIZE {
        return Err(BitstreamError::BadHeaderSize(header_size));
    }
    let order = ScanOrder::from_u8(data[12]).ok_or(BitstreamError::UnknownOrder(data[12]))?;
    Ok(Header {
        version,
        width: LittleEndian::read_u16(&data[8..10]),
        height: LittleEndian::read_u16(&data[10..12]),
        order,
        flags: data[13],
        payload_bits: LittleEndian::read_u32(&data[14..18]),
        payload_crc32: LittleEndian::read_u32(&data[18..22]),
    })
}

fn unpack_payload(
    payload: &[u8],
    width: u16,
    height: u16,
    order: ScanOrder,
) -> Result<BTreeMap<Coord, [u16; 4]>, BitstreamError> {
    let expected = payload_len(width, height);
    if payload.len() != expected {
        return Err(BitstreamError::PayloadLength {
            expected,
            actual: payload.len(),
        });
    }
    let mut map = BTreeMap::new();
    let mut bitpos = 0usize;
    for coord in order.coords(width, height) {
        let mut outputs = [0u16; 4];
        for table in &mut outputs {
            for b in 0..16 {
                if (payload[bitpos >> 3] >> (bitpos & 7)) & 1 == 1 {
                    *table |= 1 << b;
                }
                bitpos += 1;
            }
        }
        map.insert(coord, outputs);
    }
    Ok(map)
}

/// Decode a headered bitstream into per-cell tables.
pub fn unpack(data: &[u8]) -> Result<(Header, BTreeMap<Coord, [u16; 4]>), BitstreamError> {
    let hdr = parse_header(data)?;
    let payload = &data[HEADER_SIZE..];
    if payload.len() != hdr.payload_bytes() {
        return Err(BitstreamError::PayloadLength {
            expected: hdr.payload_bytes(),
            actual: payload.len(),
        });
    }
    let computed = crc32fast::hash(payload);
    if computed != hdr.payload_crc32 {
        return Err(BitstreamError::CrcMismatch {
            expected: hdr.payload_crc32,
            computed,
        });
    }
    let map = unpack_payload(payload, hdr.width, hdr.height, hdr.order)?;
    Ok((hdr, map))
}

/// Apply a bitstream (headered or raw payload) to a program: overwrite the
/// truth tables of every cell in the image; wiring and bindings stay.
/// A table for a coordinate with no cell creates a cell with default
/// (constant-zero) inputs only when the tables are nonzero.
pub fn apply(prog: &mut Program, data: &[u8]) -> Result<ApplyInfo, BitstreamError> {
    let (headered, order, tables) = if data.len() >= 4 && data[0..4] == MAGIC {
        let (hdr, map) = unpack(data)?;
        if hdr.width != prog.width || hdr.height != prog.height {
            return Err(BitstreamError::DimsMismatch {
                bs_width: hdr.width,
                bs_height: hdr.height,
                width: prog.width,
                height: prog.height,
            });
        }
        (true, hdr.order, map)
    } else {
        let map = unpack_payload(data, prog.width, prog.height, ScanOrder::RowMajor)?;
        (false, ScanOrder::RowMajor, map)
    };
    let mut touched = 0usize;
    for (coord, outputs) in tables {
        match prog.cells.get_mut(&coord) {
            Some(cell) => {
                if cell.outputs != outputs {
                    cell.outputs = outputs;
                    touched += 1;
                }
            }
            None if outputs != [0; 4] => {
                let mut cell = Cell::default();
                cell.outputs = outputs;
                prog.cells.insert(coord, cell);
                touched += 1;
            }
            None => {}
        }
    }
    debug!(
        "applied {} bitstream ({}, {} cells changed)",
        if headered { "headered" } else { "raw" },
        order.name(),
        touched
    );
    Ok(ApplyInfo {
        headered,
        cells_touched: touched,
        order,
    })
}
