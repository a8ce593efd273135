//! Multi-tile extension: seam frames, neighbor barriers, in-process
//! clusters of lock-stepped emulators.

pub mod barrier;
pub mod cluster;
pub mod seam;

pub use barrier::{BarrierFault, NeighborBarrier};
pub use cluster::{Cluster, ClusterError};
pub use seam::{EdgeHeader, SeamBuffer};

/// Execution phase of a tick. Phase A updates even-parity cells
/// (`(x+y) % 2 == 0`), phase B the odd ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    A,
    B,
}

impl Phase {
    pub fn flip(self) -> Phase {
        match self {
            Phase::A => Phase::B,
            Phase::B => Phase::A,
        }
    }

    pub fn bit(self) -> u8 {
        match self {
            Phase::A => 0,
            Phase::B => 1,
        }
    }

    pub fn from_bit(b: u8) -> Phase {
        if b & 1 == 0 {
            Phase::A
        } else {
            Phase::B
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
