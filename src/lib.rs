//! bitgrid-emu library
//!
//! Compiler and cycle-accurate emulator for BitGrid fabrics: expression
//! graphs, grid mapping and routing, the two-phase LUT-cell emulator,
//! bitstream and control-frame codecs, and the multi-tile seam runtime.

pub mod bitstream;
pub mod config;
pub mod emu;
pub mod expr;
pub mod graph;
pub mod logic;
pub mod mapper;
pub mod program;
pub mod protocol;
pub mod router;
pub mod server;
pub mod tiling;
pub mod trace;
