//! BGCF control protocol: framing, payload codecs, TLV maps.
//!
//! Frames are little-endian: a 16-byte header (magic "BGCF", version, type,
//! flags, reserved, seq, payload length, CRC-32) followed by the payload.
//! The CRC covers bytes 4..12 of the header (version through length) plus
//! the payload. The decoder resynchronizes byte-by-byte on bad magic; a
//! frame failing CRC or carrying an unknown type is reported and dropped,
//! the byte stream (and the session) continue.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use thiserror::Error;

use crate::program::Dir;

pub const MAGIC: [u8; 4] = *b"BGCF";
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    LoadChunk = 0x02,
    Apply = 0x03,
    Step = 0x04,
    SetInputs = 0x05,
    GetOutputs = 0x06,
    Outputs = 0x07,
    Quit = 0x08,
    Shutdown = 0x09,
    Link = 0x0A,
    Unlink = 0x0B,
    LinkAck = 0x0C,
    Error = 0x7F,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<MsgType> {
        match v {
            0x01 => Some(MsgType::Hello),
            0x02 => Some(MsgType::LoadChunk),
            0x03 => Some(MsgType::Apply),
            0x04 => Some(MsgType::Step),
            0x05 => Some(MsgType::SetInputs),
            0x06 => Some(MsgType::GetOutputs),
            0x07 => Some(MsgType::Outputs),
            0x08 => Some(MsgType::Quit),
            0x09 => Some(MsgType::Shutdown),
            0x0A => Some(MsgType::Link),
            0x0B => Some(MsgType::Unlink),
            0x0C => Some(MsgType::LinkAck),
            0x7F => Some(MsgType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame CRC mismatch (type {mtype:#04x}, seq {seq})")]
    BadCrc { mtype: u8, seq: u16 },
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("truncated {0} payload")]
    Truncated(&'static str),
    #[error("malformed TLV map")]
    MalformedTlv,
}

/// One validated control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

/// Encode one frame.
pub fn pack_frame(msg_type: MsgType, payload: &[u8], seq: u16, flags: u8) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];
    out[0..4].copy_from_slice(&MAGIC);
    out[4] = VERSION;
    out[5] = msg_type as u8;
    out[6] = flags;
    out[7] = 0; // reserved
    LittleEndian::write_u16(&mut out[8..10], seq);
    LittleEndian::write_u16(&mut out[10..12], payload.len() as u16);
    let mut crc = crc32fast::Hasher::new();
    crc.update(&out[4..12]);
    crc.update(payload);
    LittleEndian::write_u32(&mut out[12..16], crc.finalize());
    out.extend_from_slice(payload);
    out
}

/// Incremental frame decoder with byte-level resynchronization.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame if one is buffered. `Err` means a complete frame
    /// was consumed but failed validation; callers log it and keep going.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        loop {
            if self.buf.len() < HEADER_SIZE {
                return None;
            }
            if self.buf[0..4] != MAGIC {
                // Resync one byte at a time.
                let skip = self.buf[1..]
                    .windows(4)
                    .position(|w| w == MAGIC)
                    .map(|p| p + 1)
                    .unwrap_or(self.buf.len().saturating_sub(3));
                trace!("resync: dropping {skip} bytes");
                self.buf.drain(..skip);
                continue;
            }
            let version = self.buf[4];
            let mtype = self.buf[5];
            let flags = self.buf[6];
            let seq = LittleEndian::read_u16(&self.buf[8..10]);
            let length = LittleEndian::read_u16(&self.buf[10..12]) as usize;
            let total = HEADER_SIZE + length;
            if self.buf.len() < total {
                return None;
            }
            let stored_crc = LittleEndian::read_u32(&self.buf[12..16]);
            let mut crc = crc32fast::Hasher::new();
            crc.update(&self.buf[4..12]);
            crc.update(&self.buf[HEADER_SIZE..total]);
            let computed = crc.finalize();
            let payload = self.buf[HEADER_SIZE..total].to_vec();
            self.buf.drain(..total);
            if computed != stored_crc {
                return Some(Err(ProtocolError::BadCrc { mtype, seq }));
            }
            if version != VERSION {
                return Some(Err(ProtocolError::BadVersion(version)));
            }
            let Some(msg_type) = MsgType::from_u8(mtype) else {
                return Some(Err(ProtocolError::UnknownType(mtype)));
            };
            return Some(Ok(Frame {
                msg_type,
                flags,
                seq,
                payload,
            }));
        }
    }
}

/// Encode a name->u64 TLV map: u16 entry count, then per entry a u8 name
/// length, the name bytes, and a u64 value.
pub fn encode_name_u64(map: &BTreeMap<String, u64>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8];
    LittleEndian::write_u16(&mut buf[0..2], map.len() as u16);
    out.extend_from_slice(&buf[0..2]);
    for (name, value) in map {
        let bytes = name.as_bytes();
        let n = bytes.len().min(255);
        out.push(n as u8);
        out.extend_from_slice(&bytes[..n]);
        LittleEndian::write_u64(&mut buf, *value);
        out.extend_from_slice(&buf);
    }
    out
}

pub fn decode_name_u64(data: &[u8]) -> Result<BTreeMap<String, u64>, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::MalformedTlv);
    }
    let count = LittleEndian::read_u16(&data[0..2]) as usize;
    let mut pos = 2usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let n = *data.get(pos).ok_or(ProtocolError::MalformedTlv)? as usize;
        pos += 1;
        if data.len() < pos + n + 8 {
            return Err(ProtocolError::MalformedTlv);
        }
        let name = std::str::from_utf8(&data[pos..pos + n])
            .map_err(|_| ProtocolError::MalformedTlv)?
            .to_string();
        pos += n;
        let value = LittleEndian::read_u64(&data[pos..pos + 8]);
        pos += 8;
        map.insert(name, value);
    }
    Ok(map)
}

fn get_str(data: &[u8], pos: &mut usize, what: &'static str) -> Result<String, ProtocolError> {
    let n = *data.get(*pos).ok_or(ProtocolError::Truncated(what))? as usize;
    *pos += 1;
    let end = *pos + n;
    if data.len() < end {
        return Err(ProtocolError::Truncated(what));
    }
    let s = std::str::from_utf8(&data[*pos..end])
        .map_err(|_| ProtocolError::Truncated(what))?
        .to_string();
    *pos = end;
    Ok(s)
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(255);
    out.push(n as u8);
    out.extend_from_slice(&bytes[..n]);
}

/// HELLO payload, sent both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub width: u16,
    pub height: u16,
    pub proto_version: u16,
    pub features: u32,
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 10];
        LittleEndian::write_u16(&mut out[0..2], self.width);
        LittleEndian::write_u16(&mut out[2..4], self.height);
        LittleEndian::write_u16(&mut out[4..6], self.proto_version);
        LittleEndian::write_u32(&mut out[6..10], self.features);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Hello, ProtocolError> {
        if data.len() < 10 {
            return Err(ProtocolError::Truncated("HELLO"));
        }
        Ok(Hello {
            width: LittleEndian::read_u16(&data[0..2]),
            height: LittleEndian::read_u16(&data[2..4]),
            proto_version: LittleEndian::read_u16(&data[4..6]),
            features: LittleEndian::read_u32(&data[6..10]),
        })
    }
}

/// LOAD_CHUNK payload: one piece of a bitstream upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadChunk {
    pub session_id: u16,
    pub total_bytes: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl LoadChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        LittleEndian::write_u16(&mut out[0..2], self.session_id);
        LittleEndian::write_u32(&mut out[2..6], self.total_bytes);
        LittleEndian::write_u32(&mut out[6..10], self.offset);
        LittleEndian::write_u16(&mut out[10..12], self.data.len() as u16);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(data: &[u8]) -> Result<LoadChunk, ProtocolError> {
        if data.len() < 12 {
            return Err(ProtocolError::Truncated("LOAD_CHUNK"));
        }
        let n = LittleEndian::read_u16(&data[10..12]) as usize;
        if data.len() < 12 + n {
            return Err(ProtocolError::Truncated("LOAD_CHUNK"));
        }
        Ok(LoadChunk {
            session_id: LittleEndian::read_u16(&data[0..2]),
            total_bytes: LittleEndian::read_u32(&data[2..6]),
            offset: LittleEndian::read_u32(&data[6..10]),
            data: data[12..12 + n].to_vec(),
        })
    }
}

/// STEP payload: advance the fabric by this many ticks (half-cycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub ticks: u32,
}

impl Step {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        LittleEndian::write_u32(&mut out, self.ticks);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Step, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::Truncated("STEP"));
        }
        Ok(Step {
            ticks: LittleEndian::read_u32(&data[0..4]),
        })
    }
}

/// ERROR payload: numeric code plus a short message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u16,
    pub message: String,
}

impl ErrorInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 2];
        LittleEndian::write_u16(&mut out, self.code);
        put_str(&mut out, &self.message);
        out
    }

    pub fn decode(data: &[u8]) -> Result<ErrorInfo, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::Truncated("ERROR"));
        }
        let code = LittleEndian::read_u16(&data[0..2]);
        let mut pos = 2;
        let message = get_str(data, &mut pos, "ERROR")?;
        Ok(ErrorInfo { code, message })
    }
}

/// LINK payload: attach one grid edge to a remote peer's edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub side: Dir,
    /// 0 means "the full edge", resolved by the server.
    pub lanes: u16,
    pub local_out: String,
    pub remote_in: String,
    pub host: String,
    pub port: u16,
}

impl Link {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 5];
        out[0] = self.side as u8;
        LittleEndian::write_u16(&mut out[1..3], self.lanes);
        LittleEndian::write_u16(&mut out[3..5], self.port);
        put_str(&mut out, &self.local_out);
        put_str(&mut out, &self.remote_in);
        put_str(&mut out, &self.host);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Link, ProtocolError> {
        if data.len() < 5 {
            return Err(ProtocolError::Truncated("LINK"));
        }
        let side = Dir::from_index(data[0]).ok_or(ProtocolError::Truncated("LINK"))?;
        let lanes = LittleEndian::read_u16(&data[1..3]);
        let port = LittleEndian::read_u16(&data[3..5]);
        let mut pos = 5;
        let local_out = get_str(data, &mut pos, "LINK")?;
        let remote_in = get_str(data, &mut pos, "LINK")?;
        let host = get_str(data, &mut pos, "LINK")?;
        Ok(Link {
            side,
            lanes,
            local_out,
            remote_in,
            host,
            port,
        })
    }
}

/// LINK_ACK payload: the lane count the server resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAck {
    pub lanes: u16,
}

impl LinkAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 2];
        LittleEndian::write_u16(&mut out, self.lanes);
        out
    }

    pub fn decode(data: &[u8]) -> Result<LinkAck, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::Truncated("LINK_ACK"));
        }
        Ok(LinkAck {
            lanes: LittleEndian::read_u16(&data[0..2]),
        })
    }
}

/// UNLINK payload: detach whatever is linked on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlink {
    pub side: Dir,
}

impl Unlink {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.side as u8]
    }

    pub fn decode(data: &[u8]) -> Result<Unlink, ProtocolError> {
        let side = data
            .first()
            .and_then(|v| Dir::from_index(*v))
            .ok_or(ProtocolError::Truncated("UNLINK"))?;
        Ok(Unlink { side })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let bytes = pack_frame(MsgType::Step, &Step { ticks: 7 }.encode(), 42, 0);
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        let mut dec = Decoder::new();
        dec.push(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.msg_type, MsgType::Step);
        assert_eq!(frame.seq, 42);
        assert_eq!(Step::decode(&frame.payload).unwrap().ticks, 7);
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn test_resync_on_garbage() {
        let mut dec = Decoder::new();
        dec.push(b"noise noise noise");
        dec.push(&pack_frame(MsgType::GetOutputs, &[], 1, 0));
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.msg_type, MsgType::GetOutputs);
    }

    #[test]
    fn test_split_delivery() {
        let bytes = pack_frame(MsgType::Hello, &[0u8; 10], 3, 0);
        let mut dec = Decoder::new();
        dec.push(&bytes[..9]);
        assert!(dec.next_frame().is_none());
        dec.push(&bytes[9..]);
        assert!(dec.next_frame().unwrap().is_ok());
    }

    #[test]
    fn test_bad_crc_drops_frame_only() {
        let mut bytes = pack_frame(MsgType::Step, &Step { ticks: 1 }.encode(), 5, 0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut dec = Decoder::new();
        dec.push(&bytes);
        dec.push(&pack_frame(MsgType::Quit, &[], 6, 0));
        assert_eq!(
            dec.next_frame().unwrap(),
            Err(ProtocolError::BadCrc { mtype: 0x04, seq: 5 })
        );
        // The stream recovers on the next frame.
        assert_eq!(dec.next_frame().unwrap().unwrap().msg_type, MsgType::Quit);
    }

    #[test]
    fn test_unknown_type_reported() {
        let mut bytes = pack_frame(MsgType::Quit, &[], 1, 0);
        bytes[5] = 0x66;
        // Fix up the CRC so only the type is at fault.
        let mut crc = crc32fast::Hasher::new();
        crc.update(&bytes[4..12]);
        let c = crc.finalize();
        LittleEndian::write_u32(&mut bytes[12..16], c);
        let mut dec = Decoder::new();
        dec.push(&bytes);
        assert_eq!(
            dec.next_frame().unwrap(),
            Err(ProtocolError::UnknownType(0x66))
        );
    }

    #[test]
    fn test_tlv_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 0xDEAD_BEEFu64);
        map.insert("longer_name".to_string(), u64::MAX);
        let enc = encode_name_u64(&map);
        assert_eq!(decode_name_u64(&enc).unwrap(), map);
    }

    #[test]
    fn test_tlv_truncated() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u64);
        let enc = encode_name_u64(&map);
        assert_eq!(
            decode_name_u64(&enc[..enc.len() - 2]),
            Err(ProtocolError::MalformedTlv)
        );
    }

    #[test]
    fn test_payload_codecs() {
        let h = Hello {
            width: 16,
            height: 8,
            proto_version: 1,
            features: 0,
        };
        assert_eq!(Hello::decode(&h.encode()).unwrap(), h);

        let c = LoadChunk {
            session_id: 2,
            total_bytes: 1000,
            offset: 512,
            data: vec![1, 2, 3],
        };
        assert_eq!(LoadChunk::decode(&c.encode()).unwrap(), c);

        let e = ErrorInfo {
            code: 3,
            message: "apply failed".to_string(),
        };
        assert_eq!(ErrorInfo::decode(&e.encode()).unwrap(), e);

        let l = Link {
            side: Dir::E,
            lanes: 0,
            local_out: "east".into(),
            remote_in: "west".into(),
            host: "127.0.0.1".into(),
            port: 9001,
        };
        assert_eq!(Link::decode(&l.encode()).unwrap(), l);
        assert_eq!(
            LinkAck::decode(&LinkAck { lanes: 8 }.encode()).unwrap().lanes,
            8
        );
        assert_eq!(Unlink::decode(&Unlink { side: Dir::W }.encode()).unwrap().side, Dir::W);
    }
}
