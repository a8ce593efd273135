//! Cycle-accurate two-phase fabric emulator.
//!
//! State is one nibble per cell (committed N,E,S,W output bits), double
//! buffered. A tick recomputes every cell of one checkerboard parity from
//! the previous commit and swaps buffers atomically; ticks alternate phase A
//! (even parity, `(x+y)%2 == 0`) and phase B. A cycle is one A tick followed
//! by one B tick. Because consecutive cells on a path alternate parity, a
//! signal crosses two hops per full cycle once the pipeline is primed.

use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use crate::bitstream::{self, ApplyInfo, BitstreamError};
use crate::program::{Coord, Dir, Program, ProgramError, Source};

#[derive(Debug, Error)]
pub enum EmuError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("cell at ({0},{1}) references undeclared input '{2}'")]
    UndeclaredInput(u16, u16, String),
    #[error("unknown input variable '{0}'")]
    UnknownInput(String),
    #[error(transparent)]
    Bitstream(#[from] BitstreamError),
}

/// Steps of settling lag for bit `i` of a ripple column whose LSB cell sits
/// at even parity (phase A) or not. Used to size streaming hold windows.
pub fn ripple_lag(lsb_parity_even: bool, bit: u32) -> u32 {
    if lsb_parity_even {
        bit / 2
    } else {
        (bit + 1) / 2
    }
}

/// Streaming steps to hold an input so a `width`-bit ripple result fully
/// settles: the worst-lag bit plus one step of slack.
pub fn ripple_hold_steps(lsb_parity_even: bool, width: u32) -> u32 {
    if width == 0 {
        1
    } else {
        ripple_lag(lsb_parity_even, width - 1) + 1
    }
}

/// The emulator: owns a program plus its double-buffered cell state.
pub struct Emulator {
    program: Program,
    cur: Vec<u8>,
    next: Vec<u8>,
    inputs: BTreeMap<String, u64>,
    ticks: u64,
}

impl Emulator {
    pub fn new(program: Program) -> Result<Emulator, EmuError> {
        program.check()?;
        for (coord, cell) in &program.cells {
            for src in &cell.inputs {
                if let Source::Input { name, .. } = src {
                    if !program.input_bits.contains_key(name) {
                        return Err(EmuError::UndeclaredInput(
                            coord.x,
                            coord.y,
                            name.clone(),
                        ));
                    }
                }
            }
        }
        let n = program.width as usize * program.height as usize;
        debug!(
            "emulator: {}x{} grid, {} cells, latency {}",
            program.width,
            program.height,
            program.cells.len(),
            program.latency
        );
        Ok(Emulator {
            program,
            cur: vec![0; n],
            next: vec![0; n],
            inputs: BTreeMap::new(),
            ticks: 0,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Clear all cell state and the tick counter; inputs are kept.
    pub fn reset(&mut self) {
        self.cur.fill(0);
        self.next.fill(0);
        self.ticks = 0;
    }

    pub fn set_input(&mut self, name: &str, value: u64) -> Result<(), EmuError> {
        if !self.program.input_bits.contains_key(name) {
            return Err(EmuError::UnknownInput(name.to_string()));
        }
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_inputs(&mut self, values: &BTreeMap<String, u64>) -> Result<(), EmuError> {
        for (k, v) in values {
            self.set_input(k, *v)?;
        }
        Ok(())
    }

    /// Replace the truth tables in place from a BGBS image (headered or
    /// raw); cell wiring and bindings are untouched.
    pub fn load_bitstream(&mut self, data: &[u8]) -> Result<ApplyInfo, EmuError> {
        let info = bitstream::apply(&mut self.program, data)?;
        self.program.latency = self.program.compute_latency()?;
        Ok(info)
    }

    fn source_value(&self, src: &Source) -> u8 {
        match src {
            Source::Const { value } => value & 1,
            Source::Input { name, bit } => {
                let v = self.inputs.get(name).copied().unwrap_or(0);
                if *bit >= 64 {
                    0
                } else {
                    ((v >> bit) & 1) as u8
                }
            }
            Source::Cell { x, y, out } => {
                let i = *y as usize * self.program.width as usize + *x as usize;
                (self.cur[i] >> out.index()) & 1
            }
        }
    }

    /// One half-cycle: recompute every cell of the current parity from the
    /// last commit, then commit atomically.
    pub fn tick(&mut self) {
        let parity = (self.ticks & 1) as u8;
        self.next.copy_from_slice(&self.cur);
        let w = self.program.width as usize;
        for (coord, cell) in &self.program.cells {
            if coord.parity() != parity {
                continue;
            }
            let mut idx = 0u8;
            for (pin, src) in cell.inputs.iter().enumerate() {
                idx |= self.source_value(src) << pin;
            }
            self.next[coord.y as usize * w + coord.x as usize] = cell.eval(idx);
        }
        std::mem::swap(&mut self.cur, &mut self.next);
        self.ticks += 1;
    }

    pub fn run_ticks(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Run `n` full cycles (phase A then phase B each).
    pub fn run_cycles(&mut self, n: u32) {
        self.run_ticks(n as u64 * 2);
    }

    /// Committed output value of one cell output.
    pub fn cell_output(&self, coord: Coord, out: Dir) -> u8 {
        let i = coord.y as usize * self.program.width as usize + coord.x as usize;
        (self.cur[i] >> out.index()) & 1
    }

    /// Assemble every declared output variable from committed cell state.
    pub fn sample_outputs(&self) -> BTreeMap<String, u64> {
        let mut outs = BTreeMap::new();
        for (name, bits) in &self.program.output_bits {
            let mut v = 0u64;
            for (i, src) in bits.iter().enumerate().take(64) {
                v |= (self.source_value(src) as u64) << i;
            }
            outs.insert(name.clone(), v);
        }
        outs
    }

    /// Fixed-vector evaluation: reset, apply inputs, run the program's
    /// latency in full cycles, sample.
    pub fn eval(
        &mut self,
        inputs: &BTreeMap<String, u64>,
    ) -> Result<BTreeMap<String, u64>, EmuError> {
        self.reset();
        self.set_inputs(inputs)?;
        self.run_cycles(self.program.latency.max(1));
        Ok(self.sample_outputs())
    }

    /// Evaluate a batch of independent vectors.
    pub fn run(
        &mut self,
        vectors: &[BTreeMap<String, u64>],
    ) -> Result<Vec<BTreeMap<String, u64>>, EmuError> {
        vectors.iter().map(|v| self.eval(v)).collect()
    }

    /// Streaming evaluation: state persists across vectors; each vector is
    /// applied and the fabric advanced `ticks_per_step` half-cycles before
    /// sampling. Callers pick the step from [`ripple_hold_steps`] when they
    /// need settled ripple results.
    pub fn run_stream(
        &mut self,
        vectors: &[BTreeMap<String, u64>],
        ticks_per_step: u64,
        reset_first: bool,
    ) -> Result<Vec<BTreeMap<String, u64>>, EmuError> {
        if reset_first {
            self.reset();
        }
        let mut out = Vec::with_capacity(vectors.len());
        for v in vectors {
            self.set_inputs(v)?;
            self.run_ticks(ticks_per_step);
            out.push(self.sample_outputs());
        }
        Ok(out)
    }

    /// Committed outward-facing lane values along one grid edge: the N
    /// outputs of row 0, E outputs of the last column, S outputs of the last
    /// row, or W outputs of column 0. Lane index runs along the edge.
    pub fn edge_lanes(&self, side: Dir) -> Vec<u8> {
        let w = self.program.width;
        let h = self.program.height;
        match side {
            Dir::N => (0..w)
                .map(|x| self.cell_output(Coord::new(x, 0), Dir::N))
                .collect(),
            Dir::S => (0..w)
                .map(|x| self.cell_output(Coord::new(x, h - 1), Dir::S))
                .collect(),
            Dir::W => (0..h)
                .map(|y| self.cell_output(Coord::new(0, y), Dir::W))
                .collect(),
            Dir::E => (0..h)
                .map(|y| self.cell_output(Coord::new(w - 1, y), Dir::E))
                .collect(),
        }
    }

    /// Local grid coordinate of edge lane `i` on `side`; its parity decides
    /// which phase refreshes the lane.
    pub fn edge_lane_coord(&self, side: Dir, lane: u16) -> Coord {
        match side {
            Dir::N => Coord::new(lane, 0),
            Dir::S => Coord::new(lane, self.program.height - 1),
            Dir::W => Coord::new(0, lane),
            Dir::E => Coord::new(self.program.width - 1, lane),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Cell, Source};

    fn chain(len: u16) -> Program {
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
        p.input_bits.insert(
            "a".into(),
            vec![Source::Input {
                name: "a".into(),
                bit: 0,
            }],
        );
        p.output_bits.insert("o".into(), vec![prev]);
        p.latency = p.compute_latency().unwrap();
        p
    }

    #[test]
    fn test_two_hops_per_cycle() {
        // An L-hop pass-through chain injected before phase A delivers in
        // ceil(L/2) full cycles.
        for len in 1u16..=6 {
            let p = chain(len);
            let mut emu = Emulator::new(p).unwrap();
            emu.set_input("a", 1).unwrap();
            let want = (len as u32 + 1) / 2;
            for cycle in 1..=want {
                emu.run_cycles(1);
                let arrived = emu.sample_outputs()["o"] == 1;
                assert_eq!(arrived, cycle == want, "len {len} cycle {cycle}");
            }
        }
    }

    #[test]
    fn test_phase_isolation() {
        // After a single A tick only even-parity cells may change.
        let p = chain(4);
        let mut emu = Emulator::new(p).unwrap();
        emu.set_input("a", 1).unwrap();
        emu.tick();
        assert_eq!(emu.cell_output(Coord::new(0, 0), Dir::E), 1);
        assert_eq!(emu.cell_output(Coord::new(1, 0), Dir::E), 0);
    }

    #[test]
    fn test_same_parity_cells_see_old_values() {
        // Cells updating in one tick all read the previous commit: (2,0)
        // must not see a value racing through (1,0) in the same tick.
        let p = chain(3);
        let mut emu = Emulator::new(p).unwrap();
        emu.set_input("a", 1).unwrap();
        emu.tick(); // A: (0,0) and (2,0) update; (2,0) reads old (1,0)=0
        assert_eq!(emu.cell_output(Coord::new(2, 0), Dir::E), 0);
        emu.tick(); // B: (1,0) picks up (0,0)
        assert_eq!(emu.cell_output(Coord::new(1, 0), Dir::E), 1);
        emu.tick(); // A again: now (2,0) sees it
        assert_eq!(emu.cell_output(Coord::new(2, 0), Dir::E), 1);
    }

    #[test]
    fn test_unknown_input_rejected() {
        let p = chain(2);
        let mut emu = Emulator::new(p).unwrap();
        assert!(matches!(
            emu.set_input("nope", 1),
            Err(EmuError::UnknownInput(_))
        ));
    }

    #[test]
    fn test_undeclared_input_reference_fatal() {
        let mut p = chain(2);
        p.input_bits.clear();
        assert!(matches!(
            Emulator::new(p),
            Err(EmuError::UndeclaredInput(..))
        ));
    }

    #[test]
    fn test_reset_clears_state() {
        let p = chain(2);
        let mut emu = Emulator::new(p).unwrap();
        emu.set_input("a", 1).unwrap();
        emu.run_cycles(4);
        assert_eq!(emu.sample_outputs()["o"], 1);
        emu.reset();
        assert_eq!(emu.sample_outputs()["o"], 0);
        assert_eq!(emu.ticks(), 0);
    }

    #[test]
    fn test_ripple_lag_window() {
        assert_eq!(ripple_lag(true, 0), 0);
        assert_eq!(ripple_lag(true, 7), 3);
        assert_eq!(ripple_lag(false, 0), 0);
        assert_eq!(ripple_lag(false, 7), 4);
        assert_eq!(ripple_hold_steps(true, 8), 4);
        assert_eq!(ripple_hold_steps(false, 8), 5);
    }

    #[test]
    fn test_edge_lanes() {
        let p = chain(8); // cells fill row 0 across the grid
        let mut emu = Emulator::new(p).unwrap();
        emu.set_input("a", 1).unwrap();
        emu.run_cycles(8);
        let east = emu.edge_lanes(Dir::E);
        assert_eq!(east.len(), 8);
        assert_eq!(east[0], 1); // (7,0) E output
        assert!(east[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_streaming_persists_state() {
        let p = chain(2);
        let mut emu = Emulator::new(p).unwrap();
        let mk = |v: u64| {
            let mut m = BTreeMap::new();
            m.insert("a".to_string(), v);
            m
        };
        // Chain of 2 delivers after 1 cycle = 2 ticks per step.
        let outs = emu
            .run_stream(&[mk(1), mk(1), mk(0), mk(0)], 2, true)
            .unwrap();
        assert_eq!(outs[0]["o"], 1);
        assert_eq!(outs[1]["o"], 1);
        assert_eq!(outs[2]["o"], 0);
    }
}
