//! Multi-bit dataflow graph consumed by the mapper.
//!
//! The graph is a true DAG held in an arena: nodes live in a `Vec` and refer
//! to their operands by [`NodeId`] index, never by pointer. Widths and
//! signedness are declared per node; the mapper later slices every node into
//! per-bit LUT cells.

use smallvec::SmallVec;
use thiserror::Error;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operation performed by a node.
///
/// Shift amounts are constants baked into the op; the fabric has no barrel
/// shifter, a shift is pure re-wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// External input variable (named, leaf).
    Input,
    /// Constant value (leaf).
    Const(u64),
    And,
    Or,
    Xor,
    Not,
    /// Left shift by a constant amount.
    Shl(u16),
    /// Right shift by a constant amount; arithmetic when the operand is signed.
    Shr(u16),
    Add,
    Sub,
    Mul,
    /// Named output tap.
    Output,
}

impl Op {
    /// Number of operands this op requires.
    pub fn arity(&self) -> usize {
        match self {
            Op::Input | Op::Const(_) => 0,
            Op::Not | Op::Shl(_) | Op::Shr(_) | Op::Output => 1,
            Op::And | Op::Or | Op::Xor | Op::Add | Op::Sub | Op::Mul => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Input => "INPUT",
            Op::Const(_) => "CONST",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::Not => "NOT",
            Op::Shl(_) => "SHL",
            Op::Shr(_) => "SHR",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Output => "OUTPUT",
        }
    }
}

/// One node of the dataflow graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    /// Operand node ids, in positional order.
    pub operands: SmallVec<[NodeId; 2]>,
    /// Result width in bits.
    pub width: u16,
    /// Two's-complement interpretation of the result.
    pub signed: bool,
    /// Variable name for Input/Output nodes.
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains a cycle")]
    Cycle,
    #[error("node {0} references operand {1} out of range")]
    BadOperand(usize, usize),
    #[error("node {node} ({op}) has {got} operands, expected {want}")]
    Arity {
        node: usize,
        op: &'static str,
        got: usize,
        want: usize,
    },
    #[error("node {0} has zero width")]
    ZeroWidth(usize),
}

/// Arena-based DAG of multi-bit operations.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Input nodes in declaration order.
    pub inputs: Vec<NodeId>,
    /// Output nodes in declaration order.
    pub outputs: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Declare an external input variable.
    pub fn add_input(&mut self, name: &str, width: u16, signed: bool) -> NodeId {
        let id = self.push(Node {
            op: Op::Input,
            operands: SmallVec::new(),
            width,
            signed,
            name: Some(name.to_string()),
        });
        self.inputs.push(id);
        id
    }

    /// Add a constant node.
    pub fn add_const(&mut self, value: u64, width: u16) -> NodeId {
        self.push(Node {
            op: Op::Const(value),
            operands: SmallVec::new(),
            width,
            signed: false,
            name: None,
        })
    }

    /// Add an operation node.
    pub fn add_op<I>(&mut self, op: Op, operands: I, width: u16, signed: bool) -> NodeId
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.push(Node {
            op,
            operands: operands.into_iter().collect(),
            width,
            signed,
            name: None,
        })
    }

    /// Declare a named output fed by `source`.
    pub fn add_output(&mut self, name: &str, source: NodeId, width: u16) -> NodeId {
        let signed = self.node(source).signed;
        let id = self.push(Node {
            op: Op::Output,
            operands: [source].into_iter().collect(),
            width,
            signed,
            name: Some(name.to_string()),
        });
        self.outputs.push(id);
        id
    }

    /// Structural validation: operand ids in range, arities, nonzero widths.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (i, n) in self.nodes.iter().enumerate() {
            if n.width == 0 {
                return Err(GraphError::ZeroWidth(i));
            }
            let want = n.op.arity();
            if n.operands.len() != want {
                return Err(GraphError::Arity {
                    node: i,
                    op: n.op.name(),
                    got: n.operands.len(),
                    want,
                });
            }
            for &opnd in &n.operands {
                if opnd.index() >= self.nodes.len() {
                    return Err(GraphError::BadOperand(i, opnd.index()));
                }
            }
        }
        Ok(())
    }

    /// Kahn topological order over the whole arena; deterministic (lowest id
    /// first among ready nodes).
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let n = self.nodes.len();
        let mut indeg = vec![0usize; n];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in self.nodes.iter().enumerate() {
            for &opnd in &node.operands {
                indeg[i] += 1;
                succs[opnd.index()].push(i);
            }
        }
        // BinaryHeap of Reverse(index) keeps the order deterministic.
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| indeg[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeId(i as u32));
            for &s in &succs[i] {
                indeg[s] -= 1;
                if indeg[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }
        if order.len() != n {
            return Err(GraphError::Cycle);
        }
        Ok(order)
    }

    /// Longest dependency chain (logic ops weigh 1, leaves and taps 0) ending
    /// at each node. Used for sizing reports and latency sanity checks.
    pub fn longest_paths(&self) -> Result<Vec<u32>, GraphError> {
        let order = self.topo_order()?;
        let mut dist = vec![0u32; self.nodes.len()];
        for id in order {
            let n = &self.nodes[id.index()];
            let w = match n.op {
                Op::Input | Op::Const(_) | Op::Output => 0,
                _ => 1,
            };
            let best = n
                .operands
                .iter()
                .map(|o| dist[o.index()])
                .max()
                .unwrap_or(0);
            dist[id.index()] = best + w;
        }
        Ok(dist)
    }

    /// Length of the critical path to the deepest output (or deepest node if
    /// the graph has no outputs).
    pub fn critical_path_len(&self) -> Result<u32, GraphError> {
        let dist = self.longest_paths()?;
        let over_outputs = self
            .outputs
            .iter()
            .map(|o| dist[o.index()])
            .max();
        Ok(over_outputs.unwrap_or_else(|| dist.iter().copied().max().unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Graph {
        let mut g = Graph::new();
        let a = g.add_input("a", 8, false);
        let b = g.add_input("b", 8, false);
        let x = g.add_op(Op::Xor, [a, b], 8, false);
        let s = g.add_op(Op::Add, [x, b], 8, false);
        g.add_output("o", s, 8);
        g
    }

    #[test]
    fn test_topo_order_respects_deps() {
        let g = sample();
        let order = g.topo_order().unwrap();
        let pos: Vec<usize> = {
            let mut p = vec![0; g.len()];
            for (rank, id) in order.iter().enumerate() {
                p[id.index()] = rank;
            }
            p
        };
        for (id, n) in g.nodes() {
            for opnd in &n.operands {
                assert!(pos[opnd.index()] < pos[id.index()]);
            }
        }
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = sample();
        // Force a self-loop through the arena.
        let id = NodeId(2);
        g.nodes[2].operands[0] = id;
        assert!(matches!(g.topo_order(), Err(GraphError::Cycle)));
    }

    #[test]
    fn test_critical_path() {
        let g = sample();
        // xor (1) -> add (2); inputs weigh 0.
        assert_eq!(g.critical_path_len().unwrap(), 2);
    }

    #[test]
    fn test_validate_arity() {
        let mut g = Graph::new();
        let a = g.add_input("a", 4, false);
        g.add_op(Op::And, [a], 4, false);
        assert!(matches!(g.validate(), Err(GraphError::Arity { .. })));
    }
}
