//! Placed-and-routed fabric program: the grid of LUT cells.
//!
//! A program is a sparse map from coordinates to [`Cell`]s on an
//! even-by-even grid, plus the named input/output bit bindings and the
//! precomputed pipeline latency. Cells are pure: four input [`Source`]s in
//! pin order N,E,S,W and four 16-bit truth tables, one per output direction.
//! The LUT index is `N | E<<1 | S<<2 | W<<3`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::logic;

/// Cardinal direction; doubles as pin index (N=0, E=1, S=2, W=3) and output
/// index. Serialized as its numeric index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dir {
    N = 0,
    E = 1,
    S = 2,
    W = 3,
}

impl Dir {
    pub const ALL: [Dir; 4] = [Dir::N, Dir::E, Dir::S, Dir::W];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: u8) -> Option<Dir> {
        match i {
            0 => Some(Dir::N),
            1 => Some(Dir::E),
            2 => Some(Dir::S),
            3 => Some(Dir::W),
            _ => None,
        }
    }

    pub fn opposite(self) -> Dir {
        match self {
            Dir::N => Dir::S,
            Dir::E => Dir::W,
            Dir::S => Dir::N,
            Dir::W => Dir::E,
        }
    }

    /// Grid delta of one step in this direction; y grows southward.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Dir::N => (0, -1),
            Dir::E => (1, 0),
            Dir::S => (0, 1),
            Dir::W => (-1, 0),
        }
    }

    pub fn from_delta(dx: i32, dy: i32) -> Option<Dir> {
        match (dx, dy) {
            (0, -1) => Some(Dir::N),
            (1, 0) => Some(Dir::E),
            (0, 1) => Some(Dir::S),
            (-1, 0) => Some(Dir::W),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dir::N => "N",
            Dir::E => "E",
            Dir::S => "S",
            Dir::W => "W",
        }
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Dir {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Dir {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(d)?;
        Dir::from_index(v).ok_or_else(|| serde::de::Error::custom(format!("bad direction {v}")))
    }
}

/// Grid coordinate; ordered so map iteration is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coord {
    pub x: u16,
    pub y: u16,
}

impl Coord {
    pub fn new(x: u16, y: u16) -> Self {
        Coord { x, y }
    }

    /// Phase parity: even cells update in phase A, odd in phase B.
    pub fn parity(self) -> u8 {
        ((self.x + self.y) & 1) as u8
    }

    /// Neighbor in `dir`, or None at the grid boundary.
    pub fn step(self, dir: Dir, width: u16, height: u16) -> Option<Coord> {
        let (dx, dy) = dir.delta();
        let nx = self.x as i32 + dx;
        let ny = self.y as i32 + dy;
        if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
            return None;
        }
        Some(Coord::new(nx as u16, ny as u16))
    }

    pub fn manhattan(self, other: Coord) -> u32 {
        self.x.abs_diff(other.x) as u32 + self.y.abs_diff(other.y) as u32
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Where one cell input pin (or one output bit) takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Const { value: u8 },
    Input { name: String, bit: u16 },
    Cell { x: u16, y: u16, out: Dir },
}

impl Source {
    pub const ZERO: Source = Source::Const { value: 0 };
    pub const ONE: Source = Source::Const { value: 1 };

    pub fn cell(coord: Coord, out: Dir) -> Source {
        Source::Cell {
            x: coord.x,
            y: coord.y,
            out,
        }
    }

    pub fn cell_ref(&self) -> Option<(Coord, Dir)> {
        match self {
            Source::Cell { x, y, out } => Some((Coord::new(*x, *y), *out)),
            _ => None,
        }
    }
}

/// Legacy op-tagged cell kinds accepted in program JSON. They are resolved
/// to truth tables once at load time; the emulator only ever sees LUTs.
///
/// Pin convention follows the original op cells: operands on N and E, ripple
/// carry on S; result on output 0, carry out on output 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyOp {
    Buf,
    Not,
    And,
    Or,
    Xor,
    AddBit,
    SubBit,
}

impl LegacyOp {
    pub fn from_name(name: &str) -> Option<LegacyOp> {
        match name {
            "BUF" => Some(LegacyOp::Buf),
            "NOT" => Some(LegacyOp::Not),
            "AND" => Some(LegacyOp::And),
            "OR" => Some(LegacyOp::Or),
            "XOR" => Some(LegacyOp::Xor),
            "ADD_BIT" => Some(LegacyOp::AddBit),
            "SUB_BIT" => Some(LegacyOp::SubBit),
            _ => None,
        }
    }

    /// Truth tables equivalent to the op.
    pub fn tables(self) -> [u16; 4] {
        let mut t = [0u16; 4];
        match self {
            LegacyOp::Buf => t[0] = logic::lut_from_fn(|n, _, _, _| n),
            LegacyOp::Not => t[0] = logic::lut_from_fn(|n, _, _, _| !n),
            LegacyOp::And => t[0] = logic::lut_from_fn(|n, e, _, _| n && e),
            LegacyOp::Or => t[0] = logic::lut_from_fn(|n, e, _, _| n || e),
            LegacyOp::Xor => t[0] = logic::lut_from_fn(|n, e, _, _| n ^ e),
            LegacyOp::AddBit => {
                t[0] = logic::lut_from_fn(|a, b, c, _| a ^ b ^ c);
                t[1] = logic::lut_from_fn(|a, b, c, _| (a && b) || (c && (a ^ b)));
            }
            LegacyOp::SubBit => {
                t[0] = logic::lut_from_fn(|a, b, c, _| a ^ !b ^ c);
                t[1] = logic::lut_from_fn(|a, b, c, _| (a && !b) || (c && (a ^ !b)));
            }
        }
        t
    }
}

/// One fabric cell: four input pins, four output truth tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Input pin sources in N,E,S,W order.
    pub inputs: [Source; 4],
    /// 16-bit LUT per output direction in N,E,S,W order.
    pub outputs: [u16; 4],
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            inputs: [Source::ZERO, Source::ZERO, Source::ZERO, Source::ZERO],
            outputs: [0; 4],
        }
    }
}

impl Cell {
    /// Pure pass-through: forward `src` arriving on `in_pin` to `out_dir`.
    pub fn route4(in_pin: Dir, out_dir: Dir, src: Source) -> Cell {
        let mut cell = Cell::default();
        cell.inputs[in_pin.index()] = src;
        cell.outputs = logic::route_luts(out_dir, in_pin);
        cell
    }

    pub fn from_legacy(op: LegacyOp, inputs: [Source; 4]) -> Cell {
        Cell {
            inputs,
            outputs: op.tables(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs == [0; 4]
    }

    /// Output nibble (N|E<<1|S<<2|W<<3) for a given LUT index.
    pub fn eval(&self, idx: u8) -> u8 {
        let mut nib = 0u8;
        for d in 0..4 {
            nib |= (((self.outputs[d] >> idx) & 1) as u8) << d;
        }
        nib
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("grid dimensions must be even, got {width}x{height}")]
    OddDimensions { width: u16, height: u16 },
    #[error("cell reference ({x},{y}) outside {width}x{height} grid")]
    OutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    #[error("combinational loop involving cell ({x},{y})")]
    CombinationalLoop { x: u16, y: u16 },
    #[error("unknown legacy op '{0}'")]
    UnknownOp(String),
    #[error("program JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A complete fabric program.
#[derive(Debug, Clone)]
pub struct Program {
    pub width: u16,
    pub height: u16,
    pub cells: BTreeMap<Coord, Cell>,
    /// Input variable name -> per-bit sources (normally `Source::Input`).
    pub input_bits: BTreeMap<String, Vec<Source>>,
    /// Output variable name -> per-bit sources (normally `Source::Cell`).
    pub output_bits: BTreeMap<String, Vec<Source>>,
    /// Full cycles until outputs are valid after inputs change.
    pub latency: u32,
}

impl Program {
    pub fn new(width: u16, height: u16) -> Result<Program, ProgramError> {
        if width % 2 != 0 || height % 2 != 0 || width == 0 || height == 0 {
            return Err(ProgramError::OddDimensions { width, height });
        }
        Ok(Program {
            width,
            height,
            cells: BTreeMap::new(),
            input_bits: BTreeMap::new(),
            output_bits: BTreeMap::new(),
            latency: 0,
        })
    }

    pub fn in_bounds(&self, c: Coord) -> bool {
        c.x < self.width && c.y < self.height
    }

    fn bounds_err(&self, c: Coord) -> ProgramError {
        ProgramError::OutOfBounds {
            x: c.x,
            y: c.y,
            width: self.width,
            height: self.height,
        }
    }

    /// Structural check: even dimensions, every cell and every cell
    /// reference inside the grid.
    pub fn check(&self) -> Result<(), ProgramError> {
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ProgramError::OddDimensions {
                width: self.width,
                height: self.height,
            });
        }
        for (coord, cell) in &self.cells {
            if !self.in_bounds(*coord) {
                return Err(self.bounds_err(*coord));
            }
            for src in &cell.inputs {
                if let Some((c, _)) = src.cell_ref() {
                    if !self.in_bounds(c) {
                        return Err(self.bounds_err(c));
                    }
                }
            }
        }
        for srcs in self.output_bits.values() {
            for src in srcs {
                if let Some((c, _)) = src.cell_ref() {
                    if !self.in_bounds(c) {
                        return Err(self.bounds_err(c));
                    }
                }
            }
        }
        Ok(())
    }

    /// Exact pipeline latency in full cycles, by parity-aware longest-path
    /// over the cell dependency graph.
    ///
    /// A cell of parity p first recomputes at the earliest tick t with
    /// `t % 2 == p` that is strictly after all of its inputs became valid;
    /// external inputs and constants are valid before tick 0. The result is
    /// the tick count needed by the deepest output source, rounded up to
    /// whole cycles.
    pub fn compute_latency(&self) -> Result<u32, ProgramError> {
        let coords: Vec<Coord> = self.cells.keys().copied().collect();
        let index: BTreeMap<Coord, usize> =
            coords.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        let n = coords.len();
        let mut indeg = vec![0usize; n];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, coord) in coords.iter().enumerate() {
            for src in &self.cells[coord].inputs {
                if let Some((c, _)) = src.cell_ref() {
                    // References to absent cells read as constant zero.
                    if let Some(&j) = index.get(&c) {
                        indeg[i] += 1;
                        succs[j].push(i);
                    }
                }
            }
        }
        let mut valid = vec![-1i64; n];
        let mut queue: std::collections::VecDeque<usize> =
            (0..n).filter(|&i| indeg[i] == 0).collect();
        let mut seen = 0usize;
        while let Some(i) = queue.pop_front() {
            seen += 1;
            let coord = coords[i];
            let mut base = 0i64;
            for src in &self.cells[&coord].inputs {
                if let Some((c, _)) = src.cell_ref() {
                    if let Some(&j) = index.get(&c) {
                        base = base.max(valid[j] + 1);
                    }
                }
            }
            let parity = coord.parity() as i64;
            valid[i] = if base % 2 == parity { base } else { base + 1 };
            for &s in &succs[i] {
                indeg[s] -= 1;
                if indeg[s] == 0 {
                    queue.push_back(s);
                }
            }
        }
        if seen != n {
            let looped = coords
                .iter()
                .enumerate()
                .find(|(i, _)| valid[*i] < 0)
                .map(|(_, c)| *c)
                .unwrap_or(Coord::new(0, 0));
            return Err(ProgramError::CombinationalLoop {
                x: looped.x,
                y: looped.y,
            });
        }
        let mut last = -1i64;
        for srcs in self.output_bits.values() {
            for src in srcs {
                if let Some((c, _)) = src.cell_ref() {
                    if let Some(&i) = index.get(&c) {
                        last = last.max(valid[i]);
                    }
                }
            }
        }
        // Output valid once tick `last` has committed: last+1 ticks,
        // rounded up to whole cycles.
        Ok(((last + 2) / 2) as u32)
    }

    pub fn to_json(&self) -> Result<String, ProgramError> {
        let shadow = ProgramJson::from(self);
        Ok(serde_json::to_string_pretty(&shadow)?)
    }

    pub fn from_json(text: &str) -> Result<Program, ProgramError> {
        let shadow: ProgramJson = serde_json::from_str(text)?;
        shadow.into_program()
    }

    pub fn save(&self, path: &Path) -> Result<(), ProgramError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Program, ProgramError> {
        let text = std::fs::read_to_string(path)?;
        Program::from_json(&text)
    }
}

#[derive(Serialize, Deserialize)]
struct CellJson {
    x: u16,
    y: u16,
    inputs: [Source; 4],
    #[serde(default)]
    outputs: [u16; 4],
    /// Legacy op tag; resolved to LUTs at load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ProgramJson {
    width: u16,
    height: u16,
    latency: u32,
    cells: Vec<CellJson>,
    input_bits: BTreeMap<String, Vec<Source>>,
    output_bits: BTreeMap<String, Vec<Source>>,
}

impl From<&Program> for ProgramJson {
    fn from(p: &Program) -> Self {
        ProgramJson {
            width: p.width,
            height: p.height,
            latency: p.latency,
            cells: p
                .cells
                .iter()
                .map(|(c, cell)| CellJson {
                    x: c.x,
                    y: c.y,
                    inputs: cell.inputs.clone(),
                    outputs: cell.outputs,
                    op: None,
                })
                .collect(),
            input_bits: p.input_bits.clone(),
            output_bits: p.output_bits.clone(),
        }
    }
}

impl ProgramJson {
    fn into_program(self) -> Result<Program, ProgramError> {
        let mut p = Program::new(self.width, self.height)?;
        p.latency = self.latency;
        p.input_bits = self.input_bits;
        p.output_bits = self.output_bits;
        for cj in self.cells {
            let outputs = match &cj.op {
                Some(name) => LegacyOp::from_name(name)
                    .ok_or_else(|| ProgramError::UnknownOp(name.clone()))?
                    .tables(),
                None => cj.outputs,
            };
            p.cells.insert(
                Coord::new(cj.x, cj.y),
                Cell {
                    inputs: cj.inputs,
                    outputs,
                },
            );
        }
        p.check()?;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_dimensions_rejected() {
        assert!(matches!(
            Program::new(9, 8),
            Err(ProgramError::OddDimensions { .. })
        ));
        assert!(matches!(
            Program::new(8, 7),
            Err(ProgramError::OddDimensions { .. })
        ));
        assert!(Program::new(8, 8).is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let mut p = Program::new(4, 4).unwrap();
        p.cells.insert(
            Coord::new(1, 1),
            Cell::route4(Dir::W, Dir::E, Source::Input {
                name: "a".into(),
                bit: 0,
            }),
        );
        p.input_bits.insert(
            "a".into(),
            vec![Source::Input {
                name: "a".into(),
                bit: 0,
            }],
        );
        p.output_bits
            .insert("o".into(), vec![Source::cell(Coord::new(1, 1), Dir::E)]);
        p.latency = 1;
        let text = p.to_json().unwrap();
        let q = Program::from_json(&text).unwrap();
        assert_eq!(q.width, 4);
        assert_eq!(q.cells, p.cells);
        assert_eq!(q.output_bits, p.output_bits);
        assert_eq!(q.latency, 1);
    }

    #[test]
    fn test_legacy_op_resolved_at_load() {
        let text = r#"{
            "width": 4, "height": 4, "latency": 1,
            "cells": [{
                "x": 0, "y": 1,
                "inputs": [
                    {"type": "input", "name": "a", "bit": 0},
                    {"type": "input", "name": "b", "bit": 0},
                    {"type": "const", "value": 0},
                    {"type": "const", "value": 0}
                ],
                "op": "XOR"
            }],
            "input_bits": {},
            "output_bits": {}
        }"#;
        let p = Program::from_json(text).unwrap();
        let cell = &p.cells[&Coord::new(0, 1)];
        assert_eq!(cell.outputs[0], crate::logic::lut_from_fn(|n, e, _, _| n ^ e));
        assert_eq!(cell.outputs[1], 0);
    }

    #[test]
    fn test_out_of_bounds_reference_rejected() {
        let mut p = Program::new(4, 4).unwrap();
        p.cells.insert(
            Coord::new(0, 0),
            Cell::route4(Dir::W, Dir::E, Source::Cell {
                x: 9,
                y: 0,
                out: Dir::E,
            }),
        );
        assert!(matches!(p.check(), Err(ProgramError::OutOfBounds { .. })));
    }

    #[test]
    fn test_latency_hop_chain() {
        // A west-to-east pass-through chain of length L starting at even
        // parity needs ceil(L/2) cycles.
        for len in 1u16..=6 {
            let mut p = Program::new(8, 8).unwrap();
            let mut prev = Source::Input {
                name: "a".into(),
                bit: 0,
            };
            for x in 0..len {
                let c = Coord::new(x, 0);
                p.cells.insert(c, Cell::route4(Dir::W, Dir::E, prev));
                prev = Source::cell(c, Dir::E);
            }
            p.output_bits.insert("o".into(), vec![prev]);
            let cycles = p.compute_latency().unwrap();
            assert_eq!(cycles, (len as u32 + 1) / 2, "chain length {len}");
        }
    }

    #[test]
    fn test_latency_detects_loop() {
        let mut p = Program::new(4, 4).unwrap();
        p.cells.insert(
            Coord::new(0, 0),
            Cell::route4(Dir::W, Dir::E, Source::cell(Coord::new(1, 0), Dir::W)),
        );
        p.cells.insert(
            Coord::new(1, 0),
            Cell::route4(Dir::E, Dir::W, Source::cell(Coord::new(0, 0), Dir::E)),
        );
        assert!(matches!(
            p.compute_latency(),
            Err(ProgramError::CombinationalLoop { .. })
        ));
    }
}
