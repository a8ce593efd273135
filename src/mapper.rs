//! Graph-to-grid mapping.
//!
//! Placement strategy: columns are emitted left to right in topological
//! order, one per lowered node plus helper columns for widening and for
//! shifts of cell-backed values. Bit i of a value sits at row i. Every
//! value still needed by a later column is re-emitted through each
//! intervening column on spare pins and outputs, so the column just west
//! of a consumer always carries all of its operands and every cell
//! reference the mapper writes is grid-adjacent. Values whose bits are
//! all inputs or constants are free: they feed pins anywhere without
//! placement.
//!
//! Add/Sub become ripple columns: sum on E, carry on S, so each carry
//! feeds the geometric south neighbor directly. Shifts of free values are
//! pure re-indexing and place no cells; shifts of cell-backed values
//! become one ladder column per shifted bit.
//!
//! Multiplication is lowered first, into shift-and-add over the
//! multiplier bits; when the multiplier is signed the final partial
//! product is subtracted (two's-complement identity), which yields exact
//! products at full width.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::graph::{Graph, GraphError, NodeId, Op};
use crate::logic;
use crate::program::{Cell, Coord, Dir, Program, ProgramError, Source};

#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("grid too narrow: needed column {col} on a {width}-wide grid")]
    TooNarrow { col: u16, width: u16 },
    #[error("grid too short: node needs {bits} rows on a {height}-tall grid")]
    TooShort { bits: u16, height: u16 },
    #[error("column {x} row {y} has no spare pin for a carried value; re-associate the expression")]
    Congested { x: u16, y: u16 },
    #[error("op {0} survived lowering")]
    UnsupportedOp(&'static str),
}

/// Per-bit sources of a mapped node, with the extension rule attached.
#[derive(Debug, Clone)]
struct BitSrcs {
    bits: Vec<Source>,
    signed: bool,
}

impl BitSrcs {
    /// Bit `i`, sign-replicated past the top for signed values, zero
    /// otherwise. This one rule gives arithmetic right shift and operand
    /// sign extension everywhere.
    fn bit(&self, i: usize) -> Source {
        match self.bits.get(i) {
            Some(s) => s.clone(),
            None => {
                if self.signed {
                    self.bits.last().cloned().unwrap_or(Source::ZERO)
                } else {
                    Source::ZERO
                }
            }
        }
    }

    /// Bit for a bitwise op: a free 1-bit operand broadcasts its single
    /// bit across every lane (used by the lowered multiply partials).
    fn lane(&self, i: usize) -> Source {
        if self.bits.len() == 1 {
            self.bits[0].clone()
        } else {
            self.bit(i)
        }
    }

    /// True when no bit is a cell output, i.e. the value needs no
    /// placement and no forwarding.
    fn is_free(&self) -> bool {
        self.bits
            .iter()
            .all(|b| !matches!(b, Source::Cell { .. }))
    }
}

/// One cell under construction, with explicit pin/output bookkeeping so
/// carried values can claim the spares deterministically.
#[derive(Default)]
struct RowCell {
    cell: Cell,
    pins_used: u8,
    outs_used: u8,
}

impl RowCell {
    fn bind_pin(&mut self, pin: Dir, src: Source) {
        self.cell.inputs[pin.index()] = src;
        self.pins_used |= 1 << pin.index();
    }

    fn bind_out(&mut self, out: Dir, table: u16) {
        self.cell.outputs[out.index()] = table;
        self.outs_used |= 1 << out.index();
    }

    fn pin_bound(&self, pin: Dir) -> bool {
        self.pins_used & (1 << pin.index()) != 0
    }

    fn free_pin(&self) -> Option<Dir> {
        [Dir::W, Dir::S, Dir::E, Dir::N]
            .into_iter()
            .find(|d| self.pins_used & (1 << d.index()) == 0)
    }

    fn free_out(&self) -> Option<Dir> {
        [Dir::E, Dir::N, Dir::W, Dir::S]
            .into_iter()
            .find(|d| self.outs_used & (1 << d.index()) == 0)
    }
}

/// One column under construction.
struct ColBuilder {
    x: u16,
    height: u16,
    rows: Vec<RowCell>,
}

impl ColBuilder {
    fn new(x: u16, height: u16) -> ColBuilder {
        ColBuilder {
            x,
            height,
            rows: Vec::new(),
        }
    }

    fn row(&mut self, y: u16) -> Result<&mut RowCell, MapError> {
        if y >= self.height {
            return Err(MapError::TooShort {
                bits: y + 1,
                height: self.height,
            });
        }
        while self.rows.len() <= y as usize {
            self.rows.push(RowCell::default());
        }
        Ok(&mut self.rows[y as usize])
    }
}

/// Maps a dataflow graph onto a fixed even-by-even grid.
pub struct Mapper {
    width: u16,
    height: u16,
}

impl Mapper {
    pub fn new(width: u16, height: u16) -> Result<Mapper, MapError> {
        if width % 2 != 0 || height % 2 != 0 || width == 0 || height == 0 {
            return Err(ProgramError::OddDimensions { width, height }.into());
        }
        Ok(Mapper { width, height })
    }

    pub fn map(&self, graph: &Graph) -> Result<Program, MapError> {
        graph.validate()?;
        let lowered = lower(graph)?;
        let order = lowered.topo_order()?;
        debug!(
            "mapping {} nodes ({} after lowering) onto {}x{}",
            graph.len(),
            lowered.len(),
            self.width,
            self.height
        );

        let mut lay = Layout {
            width: self.width,
            height: self.height,
            prog: Program::new(self.width, self.height)?,
            col: 0,
            live: Vec::new(),
            vals: HashMap::new(),
            uses: count_uses(&lowered),
        };

        for id in order {
            let node = lowered.node(id);
            let mapped = match &node.op {
                Op::Input => {
                    let name = node.name.as_deref().unwrap_or("");
                    let bits: Vec<Source> = (0..node.width)
                        .map(|b| Source::Input {
                            name: name.to_string(),
                            bit: b,
                        })
                        .collect();
                    lay.prog.input_bits.insert(name.to_string(), bits.clone());
                    BitSrcs {
                        bits,
                        signed: node.signed,
                    }
                }
                Op::Const(v) => BitSrcs {
                    bits: (0..node.width)
                        .map(|b| Source::Const {
                            value: ((v >> b.min(63)) & 1) as u8,
                        })
                        .collect(),
                    signed: false,
                },
                Op::Shl(k) => {
                    let a_id = node.operands[0];
                    if lay.vals[&a_id].is_free() {
                        let a = lay.vals[&a_id].clone();
                        lay.consume(&node.operands);
                        BitSrcs {
                            bits: (0..node.width as usize)
                                .map(|b| {
                                    if b < *k as usize {
                                        Source::ZERO
                                    } else {
                                        a.bit(b - *k as usize)
                                    }
                                })
                                .collect(),
                            signed: node.signed,
                        }
                    } else {
                        lay.widen(a_id, node.width)?;
                        let mut cur = lay.vals[&a_id].clone();
                        lay.consume(&node.operands);
                        for _ in 0..*k {
                            cur = lay.shift_down_step(&cur, node.width)?;
                        }
                        cur.bits.truncate(node.width as usize);
                        BitSrcs {
                            bits: cur.bits,
                            signed: node.signed,
                        }
                    }
                }
                Op::Shr(k) => {
                    let a_id = node.operands[0];
                    if lay.vals[&a_id].is_free() {
                        let a = lay.vals[&a_id].clone();
                        lay.consume(&node.operands);
                        BitSrcs {
                            bits: (0..node.width as usize)
                                .map(|b| a.bit(b + *k as usize))
                                .collect(),
                            signed: node.signed,
                        }
                    } else {
                        lay.widen(a_id, node.width)?;
                        let mut cur = lay.vals[&a_id].clone();
                        lay.consume(&node.operands);
                        // A narrowing shift still climbs at the operand's
                        // full span so every ladder hop stays adjacent;
                        // the surplus top lanes are dropped afterwards.
                        let span = (cur.bits.len() as u16).max(node.width);
                        for _ in 0..*k {
                            cur = lay.shift_up_step(&cur, span)?;
                        }
                        cur.bits.truncate(node.width as usize);
                        BitSrcs {
                            bits: cur.bits,
                            signed: node.signed,
                        }
                    }
                }
                Op::Not => {
                    let a_id = node.operands[0];
                    lay.widen(a_id, node.width)?;
                    let a = lay.vals[&a_id].clone();
                    lay.consume(&node.operands);
                    let lut = logic::lut_from_fn(|n, _, _, _| !n);
                    lay.unary_column(node.width, &a, lut)?
                }
                Op::And | Op::Or | Op::Xor => {
                    let a_id = node.operands[0];
                    let b_id = node.operands[1];
                    lay.broadcast_or_widen(a_id, node.width)?;
                    lay.broadcast_or_widen(b_id, node.width)?;
                    let a = lay.vals[&a_id].clone();
                    let b = lay.vals[&b_id].clone();
                    lay.consume(&node.operands);
                    let lut = match node.op {
                        Op::And => logic::lut_from_fn(|n, e, _, _| n && e),
                        Op::Or => logic::lut_from_fn(|n, e, _, _| n || e),
                        _ => logic::lut_from_fn(|n, e, _, _| n ^ e),
                    };
                    lay.bitwise_column(node.width, &a, &b, lut)?
                }
                Op::Add | Op::Sub => {
                    let a_id = node.operands[0];
                    let b_id = node.operands[1];
                    lay.widen(a_id, node.width)?;
                    lay.widen(b_id, node.width)?;
                    let a = lay.vals[&a_id].clone();
                    let b = lay.vals[&b_id].clone();
                    lay.consume(&node.operands);
                    lay.ripple_column(node.width, &a, &b, node.op == Op::Sub)?
                }
                Op::Output => {
                    let a = lay.vals[&node.operands[0]].clone();
                    let name = node.name.as_deref().unwrap_or("");
                    // Output bindings are sampled, not wired: no transit
                    // and no adjacency needed.
                    let bits: Vec<Source> =
                        (0..node.width as usize).map(|b| a.bit(b)).collect();
                    lay.prog.output_bits.insert(name.to_string(), bits.clone());
                    BitSrcs {
                        bits,
                        signed: node.signed,
                    }
                }
                Op::Mul => return Err(MapError::UnsupportedOp("MUL")),
            };
            if !mapped.is_free() && lay.uses[id.index()] > 0 {
                lay.live.push(id);
            }
            lay.vals.insert(id, mapped);
        }

        let mut prog = lay.prog;
        prog.latency = prog.compute_latency()?;
        debug!(
            "mapped program: {} cells, latency {} cycles",
            prog.cells.len(),
            prog.latency
        );
        Ok(prog)
    }
}

/// Remaining wired consumers per node; outputs sample and do not count.
fn count_uses(g: &Graph) -> Vec<usize> {
    let mut uses = vec![0usize; g.len()];
    for i in 0..g.len() {
        let node = g.node(NodeId(i as u32));
        if node.op == Op::Output {
            continue;
        }
        for op in &node.operands {
            uses[op.index()] += 1;
        }
    }
    uses
}

/// Column-by-column placement state.
struct Layout {
    width: u16,
    height: u16,
    prog: Program,
    col: u16,
    /// Cell-backed values still needed by a later column, creation order.
    live: Vec<NodeId>,
    vals: HashMap<NodeId, BitSrcs>,
    uses: Vec<usize>,
}

impl Layout {
    fn next_col(&mut self) -> Result<u16, MapError> {
        if self.col >= self.width {
            return Err(MapError::TooNarrow {
                col: self.col,
                width: self.width,
            });
        }
        let c = self.col;
        self.col += 1;
        Ok(c)
    }

    fn consume(&mut self, operands: &[NodeId]) {
        for op in operands {
            if self.uses[op.index()] > 0 {
                self.uses[op.index()] -= 1;
            }
        }
    }

    /// Re-emit every still-needed cell-backed value through this column on
    /// spare pins, then write the column's cells into the program. Keeping
    /// live values in the previous column at all times is what makes every
    /// operand reference adjacent.
    fn commit(&mut self, mut cb: ColBuilder, skip: Option<NodeId>) -> Result<(), MapError> {
        let carried: Vec<NodeId> = self
            .live
            .iter()
            .copied()
            .filter(|id| Some(*id) != skip && self.uses[id.index()] > 0)
            .collect();
        for id in carried {
            let bits = self.vals[&id].bits.clone();
            let mut moved = Vec::with_capacity(bits.len());
            for (i, src) in bits.into_iter().enumerate() {
                if !matches!(src, Source::Cell { .. }) {
                    moved.push(src);
                    continue;
                }
                let rc = cb.row(i as u16)?;
                let (pin, out) = match (rc.free_pin(), rc.free_out()) {
                    (Some(p), Some(o)) => (p, o),
                    _ => {
                        return Err(MapError::Congested {
                            x: cb.x,
                            y: i as u16,
                        })
                    }
                };
                rc.bind_pin(pin, src);
                rc.bind_out(out, logic::pin_mask(pin));
                moved.push(Source::cell(Coord::new(cb.x, i as u16), out));
            }
            if let Some(v) = self.vals.get_mut(&id) {
                v.bits = moved;
            }
        }
        for (y, rc) in cb.rows.into_iter().enumerate() {
            if rc.pins_used == 0 && rc.outs_used == 0 {
                continue;
            }
            self.prog.cells.insert(Coord::new(cb.x, y as u16), rc.cell);
        }
        let uses = &self.uses;
        self.live.retain(|id| uses[id.index()] > 0);
        Ok(())
    }

    /// Materialize a signed cell-backed operand at full consumer width by
    /// replicating its top bit down a ladder. Unsigned and free operands
    /// need nothing: their extension bits are constants.
    fn widen(&mut self, id: NodeId, width: u16) -> Result<(), MapError> {
        let v = self.vals[&id].clone();
        if v.is_free() || !v.signed || v.bits.len() >= width as usize {
            return Ok(());
        }
        let old_w = v.bits.len() as u16;
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = Vec::with_capacity(width as usize);
        for i in 0..old_w {
            let src = v.bits[i as usize].clone();
            let top = i == old_w - 1;
            if !top && !matches!(src, Source::Cell { .. }) {
                bits.push(src);
                continue;
            }
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::W, src);
            rc.bind_out(Dir::E, logic::pin_mask(Dir::W));
            if top {
                rc.bind_out(Dir::S, logic::pin_mask(Dir::W));
            }
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
        }
        for i in old_w..width {
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::N, Source::cell(Coord::new(x, i - 1), Dir::S));
            rc.bind_out(Dir::E, logic::pin_mask(Dir::N));
            if i < width - 1 {
                rc.bind_out(Dir::S, logic::pin_mask(Dir::N));
            }
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
        }
        self.commit(cb, Some(id))?;
        self.vals.insert(id, BitSrcs { bits, signed: true });
        Ok(())
    }

    /// Operand prep for bitwise columns: a cell-backed 1-bit operand must
    /// be replicated down every lane before it can feed them; anything
    /// else follows the widening rule.
    fn broadcast_or_widen(&mut self, id: NodeId, width: u16) -> Result<(), MapError> {
        let v = self.vals[&id].clone();
        if v.is_free() || v.bits.len() != 1 || width <= 1 {
            return self.widen(id, width);
        }
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = Vec::with_capacity(width as usize);
        {
            let rc = cb.row(0)?;
            rc.bind_pin(Dir::W, v.bits[0].clone());
            rc.bind_out(Dir::E, logic::pin_mask(Dir::W));
            rc.bind_out(Dir::S, logic::pin_mask(Dir::W));
            bits.push(Source::cell(Coord::new(x, 0), Dir::E));
        }
        for i in 1..width {
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::N, Source::cell(Coord::new(x, i - 1), Dir::S));
            rc.bind_out(Dir::E, logic::pin_mask(Dir::N));
            if i < width - 1 {
                rc.bind_out(Dir::S, logic::pin_mask(Dir::N));
            }
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
        }
        let signed = v.signed;
        self.commit(cb, Some(id))?;
        self.vals.insert(id, BitSrcs { bits, signed });
        Ok(())
    }

    /// One left-shift step: bit j+1 of the result takes bit j of the
    /// input, dropping one row through this column on the way east.
    fn shift_down_step(&mut self, cur: &BitSrcs, width: u16) -> Result<BitSrcs, MapError> {
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = vec![Source::ZERO; width as usize];
        for j in 0..width.saturating_sub(1) {
            let src = cur.bit(j as usize);
            if !matches!(src, Source::Cell { .. }) {
                bits[(j + 1) as usize] = src;
                continue;
            }
            {
                let rc = cb.row(j)?;
                rc.bind_pin(Dir::W, src);
                rc.bind_out(Dir::S, logic::pin_mask(Dir::W));
            }
            let rc = cb.row(j + 1)?;
            rc.bind_pin(Dir::N, Source::cell(Coord::new(x, j), Dir::S));
            rc.bind_out(Dir::E, logic::pin_mask(Dir::N));
            bits[(j + 1) as usize] = Source::cell(Coord::new(x, j + 1), Dir::E);
        }
        self.commit(cb, None)?;
        Ok(BitSrcs {
            bits,
            signed: cur.signed,
        })
    }

    /// One right-shift step: bit j of the result takes bit j+1 of the
    /// input, climbing one row; the top bit refills per the extension
    /// rule (sign replication or zero).
    fn shift_up_step(&mut self, cur: &BitSrcs, width: u16) -> Result<BitSrcs, MapError> {
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = vec![Source::ZERO; width as usize];
        for r in 1..width {
            let src = cur.bit(r as usize);
            if !matches!(src, Source::Cell { .. }) {
                bits[(r - 1) as usize] = src;
                continue;
            }
            {
                let rc = cb.row(r)?;
                rc.bind_pin(Dir::W, src);
                rc.bind_out(Dir::N, logic::pin_mask(Dir::W));
            }
            let rc = cb.row(r - 1)?;
            rc.bind_pin(Dir::S, Source::cell(Coord::new(x, r), Dir::N));
            rc.bind_out(Dir::E, logic::pin_mask(Dir::S));
            bits[(r - 1) as usize] = Source::cell(Coord::new(x, r - 1), Dir::E);
        }
        let top = cur.bit(width as usize);
        if matches!(top, Source::Cell { .. }) {
            // Sign replication: the top input bit also feeds the result's
            // own top lane. Its W pin already carries that bit.
            let rc = cb.row(width - 1)?;
            if !rc.pin_bound(Dir::W) {
                rc.bind_pin(Dir::W, top);
            }
            rc.bind_out(Dir::E, logic::pin_mask(Dir::W));
            bits[(width - 1) as usize] = Source::cell(Coord::new(x, width - 1), Dir::E);
        } else {
            bits[(width - 1) as usize] = top;
        }
        self.commit(cb, None)?;
        Ok(BitSrcs {
            bits,
            signed: cur.signed,
        })
    }

    fn unary_column(
        &mut self,
        width: u16,
        a: &BitSrcs,
        lut: u16,
    ) -> Result<BitSrcs, MapError> {
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = Vec::with_capacity(width as usize);
        for i in 0..width {
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::N, a.bit(i as usize));
            rc.bind_out(Dir::E, lut);
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
        }
        let signed = a.signed;
        self.commit(cb, None)?;
        Ok(BitSrcs { bits, signed })
    }

    fn bitwise_column(
        &mut self,
        width: u16,
        a: &BitSrcs,
        b: &BitSrcs,
        lut: u16,
    ) -> Result<BitSrcs, MapError> {
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let mut bits = Vec::with_capacity(width as usize);
        for i in 0..width {
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::N, a.lane(i as usize));
            rc.bind_pin(Dir::E, b.lane(i as usize));
            rc.bind_out(Dir::E, lut);
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
        }
        let signed = a.signed || b.signed;
        self.commit(cb, None)?;
        Ok(BitSrcs { bits, signed })
    }

    /// Ripple adder/subtractor column. Sum on E, carry on S: the carry
    /// consumer sits at y+1, the geometric south neighbor, so the chain
    /// needs no extra wiring. Subtraction complements the subtrahend in
    /// the LUT and seeds the carry with 1.
    fn ripple_column(
        &mut self,
        width: u16,
        a: &BitSrcs,
        b: &BitSrcs,
        sub: bool,
    ) -> Result<BitSrcs, MapError> {
        let x = self.next_col()?;
        let mut cb = ColBuilder::new(x, self.height);
        let (sum_lut, carry_lut) = if sub {
            (
                logic::lut_from_fn(|a, b, c, _| a ^ !b ^ c),
                logic::lut_from_fn(|a, b, c, _| (a && !b) || (c && (a ^ !b))),
            )
        } else {
            (
                logic::lut_from_fn(|a, b, c, _| a ^ b ^ c),
                logic::lut_from_fn(|a, b, c, _| (a && b) || (c && (a ^ b))),
            )
        };
        let mut carry = if sub { Source::ONE } else { Source::ZERO };
        let mut bits = Vec::with_capacity(width as usize);
        for i in 0..width {
            let rc = cb.row(i)?;
            rc.bind_pin(Dir::N, a.bit(i as usize));
            rc.bind_pin(Dir::E, b.bit(i as usize));
            rc.bind_pin(Dir::S, carry);
            rc.bind_out(Dir::E, sum_lut);
            rc.bind_out(Dir::S, carry_lut);
            bits.push(Source::cell(Coord::new(x, i), Dir::E));
            carry = Source::cell(Coord::new(x, i), Dir::S);
        }
        let signed = a.signed || b.signed;
        self.commit(cb, None)?;
        Ok(BitSrcs { bits, signed })
    }
}

/// Rewrite every `Mul` into shift-and-add over the multiplier bits.
///
/// The multiplicand is extended per its own signedness, so signed-by-
/// unsigned products come out exact; the final partial is subtracted only
/// when the *multiplier* is signed, since it is the multiplier's top bit
/// that weighs `-2^(rw-1)`.
pub fn lower(graph: &Graph) -> Result<Graph, MapError> {
    let order = graph.topo_order()?;
    let mut out = Graph::new();
    let mut remap: Vec<Option<NodeId>> = vec![None; graph.len()];
    for id in order {
        let node = graph.node(id);
        let ops = |remap: &[Option<NodeId>]| -> Vec<NodeId> {
            node.operands
                .iter()
                .map(|o| remap[o.index()].unwrap_or(NodeId(0)))
                .collect()
        };
        let new_id = match &node.op {
            Op::Input => out.add_input(
                node.name.as_deref().unwrap_or(""),
                node.width,
                node.signed,
            ),
            Op::Const(v) => out.add_const(*v, node.width),
            Op::Output => {
                let o = ops(&remap);
                out.add_output(node.name.as_deref().unwrap_or(""), o[0], node.width)
            }
            Op::Mul => {
                let o = ops(&remap);
                lower_mul(&mut out, graph, id, o[0], o[1])
            }
            op => {
                let o = ops(&remap);
                out.add_op(op.clone(), o, node.width, node.signed)
            }
        };
        remap[id.index()] = Some(new_id);
    }
    Ok(out)
}

fn lower_mul(out: &mut Graph, graph: &Graph, id: NodeId, a: NodeId, b: NodeId) -> NodeId {
    let node = graph.node(id);
    let rw = graph.node(node.operands[1]).width;
    let b_signed = graph.node(node.operands[1]).signed;
    let w = node.width;
    let signed = node.signed;
    let mut acc: Option<NodeId> = None;
    for i in 0..rw {
        let bit = out.add_op(Op::Shr(i), [b], 1, false);
        let shifted = out.add_op(Op::Shl(i), [a], w, signed);
        let partial = out.add_op(Op::And, [shifted, bit], w, signed);
        let negate = b_signed && i == rw - 1;
        acc = Some(match acc {
            None if negate => {
                let zero = out.add_const(0, w);
                out.add_op(Op::Sub, [zero, partial], w, signed)
            }
            None => partial,
            Some(prev) => {
                let op = if negate { Op::Sub } else { Op::Add };
                out.add_op(op, [prev, partial], w, signed)
            }
        });
    }
    acc.unwrap_or_else(|| out.add_const(0, w))
}
