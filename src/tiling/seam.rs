//! Seam frames: the per-tick edge exchange between adjacent tiles.
//!
//! Each tick every linked tile sends its neighbor one frame: a 3-byte
//! header (epoch, phase bit), the edge lane bits packed LSB-first, and a
//! CRC-8 over header and payload. Only half of a seam's lanes are freshly
//! committed in any one phase, the halves interleave by checkerboard
//! parity; the receive buffer overlays each half as it arrives and knows
//! when both halves of an epoch have landed.

use super::barrier::BarrierFault;
use super::Phase;

/// CRC-8, polynomial 0x07, bit-serial.
pub fn crc8(data: &[u8]) -> u8 {
    let mut c: u16 = 0;
    for &b in data {
        c ^= b as u16;
        for _ in 0..8 {
            c = if c & 1 != 0 { (c >> 1) ^ (0x07 << 7) } else { c >> 1 };
        }
        c &= 0xFF;
    }
    c as u8
}

/// Pack one bit per lane, LSB-first.
pub fn pack_lanes(lanes: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; (lanes.len() + 7) / 8];
    for (i, &bit) in lanes.iter().enumerate() {
        if bit & 1 == 1 {
            out[i >> 3] |= 1 << (i & 7);
        }
    }
    out
}

pub fn unpack_lanes(data: &[u8], n: usize) -> Vec<u8> {
    (0..n)
        .map(|i| {
            data.get(i >> 3)
                .map(|b| (b >> (i & 7)) & 1)
                .unwrap_or(0)
        })
        .collect()
}

/// Seam frame header: epoch counter plus the phase that produced the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeHeader {
    pub epoch: u16,
    pub phase: Phase,
}

impl EdgeHeader {
    pub fn pack(&self) -> [u8; 3] {
        [
            (self.epoch & 0xFF) as u8,
            (self.epoch >> 8) as u8,
            self.phase.bit(),
        ]
    }

    pub fn unpack(data: &[u8]) -> Option<EdgeHeader> {
        if data.len() < 3 {
            return None;
        }
        Some(EdgeHeader {
            epoch: data[0] as u16 | (data[1] as u16) << 8,
            phase: Phase::from_bit(data[2]),
        })
    }
}

/// Encode one seam frame: header, packed lanes, CRC-8.
pub fn encode_frame(hdr: EdgeHeader, lanes: &[u8]) -> Vec<u8> {
    let mut out = hdr.pack().to_vec();
    out.extend_from_slice(&pack_lanes(lanes));
    out.push(crc8(&out));
    out
}

/// Decode and validate one seam frame carrying `n_lanes` lanes.
pub fn decode_frame(data: &[u8], n_lanes: usize) -> Result<(EdgeHeader, Vec<u8>), BarrierFault> {
    let want = 3 + (n_lanes + 7) / 8 + 1;
    if data.len() != want {
        return Err(BarrierFault::ShortFrame {
            got: data.len(),
            want,
        });
    }
    let body = &data[..data.len() - 1];
    if crc8(body) != data[data.len() - 1] {
        return Err(BarrierFault::ChecksumFailed);
    }
    // Header can be trusted only after the CRC passes.
    let hdr = EdgeHeader::unpack(body).ok_or(BarrierFault::ShortFrame { got: data.len(), want })?;
    Ok((hdr, unpack_lanes(&body[3..], n_lanes)))
}

/// Is lane `i` of an edge at grid coordinate `edge_coord` (the producing
/// cells' fixed row or column) freshly committed by `phase`? Lane i sits at
/// cell parity `(edge_coord + i) % 2`; phase A commits even parity.
pub fn lane_fresh(edge_coord: u16, lane: usize, phase: Phase) -> bool {
    let even = (edge_coord as usize + lane) % 2 == 0;
    match phase {
        Phase::A => even,
        Phase::B => !even,
    }
}

/// Receive side of one seam: overlays the half-lane updates as frames
/// arrive and tracks which (epoch, phase) halves have landed.
#[derive(Debug, Clone)]
pub struct SeamBuffer {
    /// Producing edge's fixed coordinate in the sender's grid.
    edge_coord: u16,
    lanes: Vec<u8>,
    /// Epoch whose A (index 0) / B (index 1) half was last stored.
    have: [Option<u16>; 2],
}

impl SeamBuffer {
    pub fn new(edge_coord: u16, n_lanes: usize) -> SeamBuffer {
        SeamBuffer {
            edge_coord,
            lanes: vec![0; n_lanes],
            have: [None, None],
        }
    }

    pub fn n_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Store the half of `lanes` that `hdr.phase` freshly committed. The
    /// caller validates the header against its barrier first.
    pub fn accept(&mut self, hdr: &EdgeHeader, lanes: &[u8]) {
        for i in 0..self.lanes.len() {
            if lane_fresh(self.edge_coord, i, hdr.phase) {
                self.lanes[i] = lanes.get(i).copied().unwrap_or(0) & 1;
            }
        }
        self.have[hdr.phase.bit() as usize] = Some(hdr.epoch);
    }

    /// Current merged lane values, LSB = lane 0.
    pub fn value(&self) -> u64 {
        self.lanes
            .iter()
            .enumerate()
            .take(64)
            .fold(0u64, |acc, (i, &b)| acc | ((b as u64 & 1) << i))
    }

    pub fn lanes(&self) -> &[u8] {
        &self.lanes
    }

    /// Merged value once both halves of `epoch` have arrived.
    pub fn aligned(&self, epoch: u16) -> Option<u64> {
        if self.have == [Some(epoch), Some(epoch)] {
            Some(self.value())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_stability() {
        assert_eq!(crc8(&[]), 0);
        let a = crc8(b"seam");
        let mut b = b"seam".to_vec();
        b[0] ^= 1;
        assert_ne!(a, crc8(&b));
    }

    #[test]
    fn test_lane_pack_lsb_first() {
        let packed = pack_lanes(&[1, 0, 0, 0, 0, 0, 0, 0, 1, 1]);
        assert_eq!(packed, vec![0x01, 0x03]);
        assert_eq!(unpack_lanes(&packed, 10), vec![1, 0, 0, 0, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_frame_round_trip() {
        let hdr = EdgeHeader {
            epoch: 0x0102,
            phase: Phase::B,
        };
        let lanes = vec![1, 1, 0, 1, 0, 0, 1, 0];
        let frame = encode_frame(hdr, &lanes);
        assert_eq!(frame.len(), 3 + 1 + 1);
        assert_eq!(&frame[0..3], &[0x02, 0x01, 1]);
        let (h, l) = decode_frame(&frame, 8).unwrap();
        assert_eq!(h, hdr);
        assert_eq!(l, lanes);
    }

    #[test]
    fn test_corrupt_frame_is_checksum_fault() {
        let frame = encode_frame(
            EdgeHeader {
                epoch: 1,
                phase: Phase::A,
            },
            &[1, 0, 1, 0],
        );
        let mut bad = frame.clone();
        bad[3] ^= 0x04;
        assert!(matches!(
            decode_frame(&bad, 4),
            Err(BarrierFault::ChecksumFailed)
        ));
        let mut short = frame;
        short.pop();
        assert!(matches!(
            decode_frame(&short, 4),
            Err(BarrierFault::ShortFrame { .. })
        ));
    }

    #[test]
    fn test_lane_freshness_parity() {
        // Edge at column 7: lane 0 is odd parity, refreshed in phase B.
        assert!(!lane_fresh(7, 0, Phase::A));
        assert!(lane_fresh(7, 0, Phase::B));
        assert!(lane_fresh(7, 1, Phase::A));
        // Edge at column 0: lane 0 even, refreshed in phase A.
        assert!(lane_fresh(0, 0, Phase::A));
    }

    #[test]
    fn test_buffer_interleaves_halves() {
        let mut buf = SeamBuffer::new(0, 4);
        // Phase A of epoch 5 carries lanes 0 and 2.
        buf.accept(
            &EdgeHeader {
                epoch: 5,
                phase: Phase::A,
            },
            &[1, 1, 1, 1],
        );
        assert_eq!(buf.value(), 0b0101);
        assert_eq!(buf.aligned(5), None);
        // Phase B fills lanes 1 and 3.
        buf.accept(
            &EdgeHeader {
                epoch: 5,
                phase: Phase::B,
            },
            &[0, 1, 0, 1],
        );
        assert_eq!(buf.aligned(5), Some(0b1111));
        assert_eq!(buf.aligned(6), None);
    }
}
