//! Neighbor rendezvous barrier: per (epoch, phase) synchronization with the
//! linked tiles.
//!
//! A tile may advance to the next half-cycle only when it has produced its
//! own edge frame and holds a validated frame from every expected neighbor
//! for the current epoch and phase. A frame that fails validation does not
//! count: its neighbor-done flag stays clear, so desynchronization can only
//! surface as a stall, never as tiles drifting apart.

use log::warn;
use thiserror::Error;

use crate::program::Dir;

use super::seam::EdgeHeader;
use super::Phase;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BarrierFault {
    #[error("frame from unexpected side {side}")]
    UnexpectedSide { side: Dir },
    #[error("epoch mismatch: got {got}, expected {expected}")]
    EpochMismatch { got: u16, expected: u16 },
    #[error("phase mismatch: got {got}, expected {expected}")]
    PhaseMismatch { got: Phase, expected: Phase },
    #[error("duplicate frame from side {side}")]
    Duplicate { side: Dir },
    #[error("seam frame checksum failed")]
    ChecksumFailed,
    #[error("seam frame truncated: got {got} bytes, want {want}")]
    ShortFrame { got: usize, want: usize },
    #[error("no seam frame received from side {side}")]
    Missing { side: Dir },
    #[error("barrier_cannot_advance at epoch {epoch} phase {phase}")]
    CannotAdvance { epoch: u16, phase: Phase },
}

/// Rendezvous state for one tile.
#[derive(Debug, Clone)]
pub struct NeighborBarrier {
    epoch: u16,
    phase: Phase,
    expect: [bool; 4],
    local_done: bool,
    neighbor_done: [bool; 4],
}

impl NeighborBarrier {
    /// `expect[dir]` marks the sides with linked neighbors.
    pub fn new(expect: [bool; 4]) -> NeighborBarrier {
        NeighborBarrier {
            epoch: 0,
            phase: Phase::A,
            expect,
            local_done: false,
            neighbor_done: [false; 4],
        }
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn expect_side(&mut self, side: Dir, on: bool) {
        self.expect[side.index()] = on;
    }

    /// This tile finished its own half-cycle and sent its frames.
    pub fn local_done(&mut self) {
        self.local_done = true;
    }

    /// Validate a received seam header against the current rendezvous.
    /// Only a fully valid header records the neighbor as done; any fault
    /// withholds the flag so the barrier stalls rather than desyncs.
    pub fn accept_header(&mut self, side: Dir, hdr: &EdgeHeader) -> Result<(), BarrierFault> {
        let fault = if !self.expect[side.index()] {
            Some(BarrierFault::UnexpectedSide { side })
        } else if hdr.epoch != self.epoch {
            Some(BarrierFault::EpochMismatch {
                got: hdr.epoch,
                expected: self.epoch,
            })
        } else if hdr.phase != self.phase {
            Some(BarrierFault::PhaseMismatch {
                got: hdr.phase,
                expected: self.phase,
            })
        } else if self.neighbor_done[side.index()] {
            Some(BarrierFault::Duplicate { side })
        } else {
            None
        };
        if let Some(f) = fault {
            warn!("barrier: rejecting frame from {side}: {f}");
            return Err(f);
        }
        self.neighbor_done[side.index()] = true;
        Ok(())
    }

    /// True once `side`'s frame for the current half-cycle was accepted.
    pub fn side_done(&self, side: Dir) -> bool {
        self.neighbor_done[side.index()]
    }

    pub fn can_advance(&self) -> bool {
        self.local_done
            && Dir::ALL
                .iter()
                .all(|d| !self.expect[d.index()] || self.neighbor_done[d.index()])
    }

    /// Move to the next half-cycle, or report the stall.
    pub fn advance(&mut self) -> Result<(), BarrierFault> {
        if !self.can_advance() {
            return Err(BarrierFault::CannotAdvance {
                epoch: self.epoch,
                phase: self.phase,
            });
        }
        self.local_done = false;
        self.neighbor_done = [false; 4];
        if self.phase == Phase::B {
            self.epoch = self.epoch.wrapping_add(1);
        }
        self.phase = self.phase.flip();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(epoch: u16, phase: Phase) -> EdgeHeader {
        EdgeHeader { epoch, phase }
    }

    fn east_only() -> NeighborBarrier {
        NeighborBarrier::new([false, true, false, false])
    }

    #[test]
    fn test_happy_path_epoch_rolls_after_b() {
        let mut b = east_only();
        for epoch in 0..3u16 {
            for phase in [Phase::A, Phase::B] {
                assert_eq!(b.epoch(), epoch);
                assert_eq!(b.phase(), phase);
                b.local_done();
                assert!(!b.can_advance());
                b.accept_header(Dir::E, &hdr(epoch, phase)).unwrap();
                b.advance().unwrap();
            }
        }
    }

    #[test]
    fn test_each_fault_is_distinct() {
        let mut b = east_only();
        b.local_done();
        assert_eq!(
            b.accept_header(Dir::W, &hdr(0, Phase::A)),
            Err(BarrierFault::UnexpectedSide { side: Dir::W })
        );
        assert_eq!(
            b.accept_header(Dir::E, &hdr(4, Phase::A)),
            Err(BarrierFault::EpochMismatch {
                got: 4,
                expected: 0
            })
        );
        assert_eq!(
            b.accept_header(Dir::E, &hdr(0, Phase::B)),
            Err(BarrierFault::PhaseMismatch {
                got: Phase::B,
                expected: Phase::A
            })
        );
        b.accept_header(Dir::E, &hdr(0, Phase::A)).unwrap();
        assert_eq!(
            b.accept_header(Dir::E, &hdr(0, Phase::A)),
            Err(BarrierFault::Duplicate { side: Dir::E })
        );
    }

    #[test]
    fn test_invalid_frame_withholds_done_and_stalls() {
        let mut b = east_only();
        b.local_done();
        // An epoch-mismatched frame must NOT count as the neighbor's done.
        let _ = b.accept_header(Dir::E, &hdr(9, Phase::A));
        assert!(!b.can_advance());
        assert_eq!(
            b.advance(),
            Err(BarrierFault::CannotAdvance {
                epoch: 0,
                phase: Phase::A
            })
        );
        // State is unchanged; a valid retry still lands.
        b.accept_header(Dir::E, &hdr(0, Phase::A)).unwrap();
        b.advance().unwrap();
        assert_eq!(b.phase(), Phase::B);
    }

    #[test]
    fn test_local_done_required() {
        let mut b = NeighborBarrier::new([false; 4]);
        assert!(!b.can_advance());
        b.local_done();
        assert!(b.can_advance());
    }
}
