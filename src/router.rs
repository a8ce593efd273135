//! Routing pass: legalize long-distance cell references.
//!
//! The mapper is allowed to reference any producing cell from anywhere. This
//! pass rewrites every non-adjacent reference into a chain of pass-through
//! cells found by A* over the 4-connected grid: cost 1 per hop plus an
//! optional turn penalty, Manhattan-distance heuristic. Occupied coordinates
//! (logic cells and previously committed hops) are blocked, endpoints
//! exempt. Nets are routed first-come in deterministic program order with no
//! rip-up; an unroutable net is a hard error and the caller may retry with a
//! different penalty or a larger grid.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, trace};
use thiserror::Error;

use crate::logic;
use crate::program::{Cell, Coord, Dir, Program, ProgramError, Source};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("no route from ({},{}) to ({},{})", from.x, from.y, to.x, to.y)]
    NoRoute { from: Coord, to: Coord },
    #[error("LUT collision at ({},{}) output {out}", at.x, at.y)]
    LutCollision { at: Coord, out: Dir },
}

pub struct Router {
    /// Extra cost charged whenever a path changes direction; biases routes
    /// toward straight runs.
    pub turn_penalty: u32,
}

impl Default for Router {
    fn default() -> Self {
        Router { turn_penalty: 1 }
    }
}

struct PendingNet {
    sink: Coord,
    pin: usize,
    src: Coord,
    out: Dir,
}

impl Router {
    pub fn new(turn_penalty: u32) -> Router {
        Router { turn_penalty }
    }

    /// Route every non-adjacent reference in `prog`, inserting pass-through
    /// cells and rewriting sink pins, then recompute the latency.
    pub fn route(&self, prog: &mut Program) -> Result<(), RouteError> {
        prog.check()?;
        let w = prog.width as usize;
        let h = prog.height as usize;
        let mut occ = vec![false; w * h];
        for c in prog.cells.keys() {
            occ[c.y as usize * w + c.x as usize] = true;
        }

        // Deterministic net order: program cell order, then pin index.
        let mut nets = Vec::new();
        for (coord, cell) in &prog.cells {
            for (pin, src) in cell.inputs.iter().enumerate() {
                if let Some((s, out)) = src.cell_ref() {
                    if s.manhattan(*coord) != 1 {
                        nets.push(PendingNet {
                            sink: *coord,
                            pin,
                            src: s,
                            out,
                        });
                    }
                }
            }
        }
        debug!("routing {} nets on {}x{}", nets.len(), w, h);

        for net in nets {
            if net.src == net.sink {
                return Err(RouteError::NoRoute {
                    from: net.src,
                    to: net.sink,
                });
            }
            let path = self.astar(prog, &occ, net.src, net.sink)?;
            trace!(
                "net {}{} -> {} pin {}: {} hops",
                net.src,
                net.out,
                net.sink,
                net.pin,
                path.len().saturating_sub(2)
            );
            let mut feed = Source::cell(net.src, net.out);
            for i in 1..path.len() - 1 {
                let at = path[i];
                let travel_in = step_dir(path[i - 1], at);
                let travel_out = step_dir(at, path[i + 1]);
                let in_pin = travel_in.opposite();
                let cell = prog.cells.entry(at).or_default();
                if cell.outputs[travel_out.index()] != 0 {
                    return Err(RouteError::LutCollision {
                        at,
                        out: travel_out,
                    });
                }
                cell.outputs[travel_out.index()] = logic::pin_mask(in_pin);
                cell.inputs[in_pin.index()] = feed;
                occ[at.y as usize * w + at.x as usize] = true;
                feed = Source::cell(at, travel_out);
            }
            if let Some(cell) = prog.cells.get_mut(&net.sink) {
                cell.inputs[net.pin] = feed;
            }
        }

        prog.latency = prog.compute_latency()?;
        debug!("routed program: {} cells, latency {}", prog.cells.len(), prog.latency);
        Ok(())
    }

    /// A* from `start` to `goal`. States are (coordinate, incoming
    /// direction) so turn costs compose correctly; ties break on coordinate
    /// to keep results deterministic. Returns the inclusive path.
    fn astar(
        &self,
        prog: &Program,
        occ: &[bool],
        start: Coord,
        goal: Coord,
    ) -> Result<Vec<Coord>, RouteError> {
        let w = prog.width as usize;
        let slots = w * prog.height as usize * 5;
        // Slot 4 is "no incoming direction" (the start state).
        let idx = |c: Coord, d: usize| (c.y as usize * w + c.x as usize) * 5 + d;
        let mut best = vec![u32::MAX; slots];
        let mut came: Vec<u32> = vec![u32::MAX; slots];

        let mut heap: BinaryHeap<Reverse<(u32, u32, u16, u16, u8)>> = BinaryHeap::new();
        let s = idx(start, 4);
        best[s] = 0;
        heap.push(Reverse((start.manhattan(goal), 0, start.x, start.y, 4)));

        while let Some(Reverse((_f, g, x, y, d))) = heap.pop() {
            let here = Coord::new(x, y);
            let state = idx(here, d as usize);
            if g != best[state] {
                continue; // stale entry
            }
            if here == goal {
                return Ok(reconstruct(state, &came, w));
            }
            for nd in Dir::ALL {
                let Some(next) = here.step(nd, prog.width, prog.height) else {
                    continue;
                };
                if next != goal && occ[next.y as usize * w + next.x as usize] {
                    continue;
                }
                let turn = if d != 4 && nd.index() != d as usize {
                    self.turn_penalty
                } else {
                    0
                };
                let ng = g + 1 + turn;
                let nstate = idx(next, nd.index());
                if ng < best[nstate] {
                    best[nstate] = ng;
                    came[nstate] = state as u32;
                    heap.push(Reverse((
                        ng + next.manhattan(goal),
                        ng,
                        next.x,
                        next.y,
                        nd.index() as u8,
                    )));
                }
            }
        }
        Err(RouteError::NoRoute {
            from: start,
            to: goal,
        })
    }
}

fn step_dir(from: Coord, to: Coord) -> Dir {
    let dx = to.x as i32 - from.x as i32;
    let dy = to.y as i32 - from.y as i32;
    // Callers only pass adjacent coordinates.
    Dir::from_delta(dx, dy).unwrap_or(Dir::N)
}

fn reconstruct(goal_state: usize, came: &[u32], w: usize) -> Vec<Coord> {
    let mut path = Vec::new();
    let mut state = goal_state;
    loop {
        let cell = state / 5;
        path.push(Coord::new((cell % w) as u16, (cell / w) as u16));
        if came[state] == u32::MAX {
            break;
        }
        state = came[state] as usize;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::Emulator;

    fn one_net(width: u16, height: u16, src: Coord, sink: Coord) -> Program {
        let mut p = Program::new(width, height).unwrap();
        p.cells.insert(
            src,
            Cell::route4(Dir::W, Dir::E, Source::Input {
                name: "a".into(),
                bit: 0,
            }),
        );
        p.cells
            .insert(sink, Cell::route4(Dir::W, Dir::E, Source::cell(src, Dir::E)));
        p.input_bits.insert(
            "a".into(),
            vec![Source::Input {
                name: "a".into(),
                bit: 0,
            }],
        );
        p.output_bits
            .insert("o".into(), vec![Source::cell(sink, Dir::E)]);
        p
    }

    fn assert_all_adjacent(p: &Program) {
        for (coord, cell) in &p.cells {
            for src in &cell.inputs {
                if let Some((s, _)) = src.cell_ref() {
                    assert_eq!(s.manhattan(*coord), 1, "ref {s} -> {coord}");
                }
            }
        }
    }

    #[test]
    fn test_route_inserts_adjacent_chain() {
        let mut p = one_net(8, 8, Coord::new(0, 0), Coord::new(5, 0));
        Router::default().route(&mut p).unwrap();
        assert_all_adjacent(&p);
        // Straight run W->E uses the canonical forwarding table.
        let hop = &p.cells[&Coord::new(2, 0)];
        assert_eq!(hop.outputs[Dir::E.index()], 0xFF00);
    }

    #[test]
    fn test_routed_value_still_arrives() {
        let mut p = one_net(8, 8, Coord::new(0, 0), Coord::new(5, 0));
        Router::default().route(&mut p).unwrap();
        let mut emu = Emulator::new(p).unwrap();
        let mut inputs = std::collections::BTreeMap::new();
        inputs.insert("a".to_string(), 1u64);
        assert_eq!(emu.eval(&inputs).unwrap()["o"], 1);
        inputs.insert("a".to_string(), 0u64);
        assert_eq!(emu.eval(&inputs).unwrap()["o"], 0);
    }

    #[test]
    fn test_route_detours_around_obstacles() {
        let mut p = one_net(8, 8, Coord::new(0, 0), Coord::new(5, 0));
        // Wall across the straight path.
        for y in 0..3u16 {
            p.cells.insert(
                Coord::new(3, y),
                Cell::route4(Dir::N, Dir::S, Source::ZERO),
            );
        }
        Router::default().route(&mut p).unwrap();
        assert_all_adjacent(&p);
        // The wall cells keep their own tables.
        assert_eq!(
            p.cells[&Coord::new(3, 1)].outputs[Dir::S.index()],
            logic::pin_mask(Dir::N)
        );
    }

    #[test]
    fn test_no_route_is_an_error() {
        let mut p = one_net(8, 8, Coord::new(0, 0), Coord::new(5, 0));
        // Seal the sink off completely.
        for c in [
            Coord::new(4, 0),
            Coord::new(6, 0),
            Coord::new(5, 1),
        ] {
            p.cells
                .insert(c, Cell::route4(Dir::N, Dir::S, Source::ZERO));
        }
        let err = Router::default().route(&mut p);
        assert!(matches!(err, Err(RouteError::NoRoute { .. })));
    }

    #[test]
    fn test_latency_recomputed_after_routing() {
        let mut p = one_net(8, 8, Coord::new(0, 0), Coord::new(5, 0));
        let before = p.compute_latency().unwrap();
        Router::default().route(&mut p).unwrap();
        assert!(p.latency >= before);
        // 6 cells in the final chain starting at even parity: ceil(6/2).
        assert_eq!(p.latency, 3);
    }
}
