//! BGCF device server: one emulator session per client connection.
//!
//! Frame dispatch is synchronous and deterministic; every request either
//! mutates the session, produces reply frames, or produces an ERROR frame
//! while the session keeps running. Only QUIT closes the connection and
//! only SHUTDOWN stops the listener.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};

use crate::emu::Emulator;
use crate::program::{Dir, Program};
use crate::protocol::{
    self, Decoder, ErrorInfo, Frame, Hello, Link, LinkAck, LoadChunk, MsgType, Step, Unlink,
};

/// ERROR frame codes.
pub mod error_code {
    pub const BAD_PAYLOAD: u16 = 1;
    pub const NO_SESSION: u16 = 2;
    pub const APPLY_FAILED: u16 = 3;
    pub const UNKNOWN_INPUT: u16 = 4;
    pub const LINK_REJECTED: u16 = 5;
}

/// What the transport should do after a batch of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    CloseConnection,
    ShutdownServer,
}

struct LoadState {
    total: usize,
    buf: Vec<u8>,
    /// Per-byte receipt map; re-sent or overlapping chunks must not count
    /// toward completeness twice.
    covered: Vec<bool>,
}

impl LoadState {
    fn complete(&self) -> bool {
        self.covered.iter().all(|&c| c)
    }
}

/// A seam link registered by a LINK request. The server records the
/// topology and acknowledges; frame exchange itself runs over the seam
/// transport, not this control channel.
#[derive(Debug, Clone)]
pub struct LinkState {
    pub side: Dir,
    pub lanes: u16,
    pub local_out: String,
    pub remote_in: String,
    pub host: String,
    pub port: u16,
}

/// One client's view of the device.
pub struct Session {
    emu: Emulator,
    loads: BTreeMap<u16, LoadState>,
    links: Vec<LinkState>,
    seq: u16,
}

impl Session {
    pub fn new(program: Program) -> Result<Session, crate::emu::EmuError> {
        Ok(Session {
            emu: Emulator::new(program)?,
            loads: BTreeMap::new(),
            links: Vec::new(),
            seq: 0,
        })
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emu
    }

    pub fn links(&self) -> &[LinkState] {
        &self.links
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn reply(&mut self, msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
        let seq = self.next_seq();
        protocol::pack_frame(msg_type, payload, seq, 0)
    }

    fn error(&mut self, code: u16, message: &str) -> Vec<u8> {
        warn!("session error {code}: {message}");
        let payload = ErrorInfo {
            code,
            message: message.to_string(),
        }
        .encode();
        self.reply(MsgType::Error, &payload)
    }

    /// Dispatch one frame; returns encoded reply frames and a transport
    /// directive.
    pub fn handle(&mut self, frame: &Frame) -> (Vec<Vec<u8>>, Control) {
        let mut replies = Vec::new();
        let mut control = Control::Continue;
        match frame.msg_type {
            MsgType::Hello => {
                let p = self.emu.program();
                let hello = Hello {
                    width: p.width,
                    height: p.height,
                    proto_version: protocol::VERSION as u16,
                    features: 0,
                };
                debug!("HELLO: {}x{} grid", p.width, p.height);
                let payload = hello.encode();
                replies.push(self.reply(MsgType::Hello, &payload));
            }
            MsgType::LoadChunk => match LoadChunk::decode(&frame.payload) {
                Ok(chunk) => {
                    let state = self.loads.entry(chunk.session_id).or_insert_with(|| {
                        LoadState {
                            total: chunk.total_bytes as usize,
                            buf: vec![0; chunk.total_bytes as usize],
                            covered: vec![false; chunk.total_bytes as usize],
                        }
                    });
                    let start = chunk.offset as usize;
                    let end = start + chunk.data.len();
                    if end > state.total {
                        replies.push(self.error(
                            error_code::BAD_PAYLOAD,
                            "chunk past end of load session",
                        ));
                    } else {
                        state.buf[start..end].copy_from_slice(&chunk.data);
                        state.covered[start..end].fill(true);
                    }
                }
                Err(e) => replies.push(self.error(error_code::BAD_PAYLOAD, &e.to_string())),
            },
            MsgType::Apply => {
                // Apply the newest complete session.
                let sid = self
                    .loads
                    .iter()
                    .rev()
                    .find(|(_, s)| s.complete())
                    .map(|(sid, _)| *sid);
                match sid {
                    Some(sid) => {
                        let state = self.loads.remove(&sid);
                        let data = state.map(|s| s.buf).unwrap_or_default();
                        match self.emu.load_bitstream(&data) {
                            Ok(info) => {
                                info!(
                                    "applied bitstream session {sid}: {} cells changed",
                                    info.cells_touched
                                );
                            }
                            Err(e) => {
                                replies.push(
                                    self.error(error_code::APPLY_FAILED, &e.to_string()),
                                );
                            }
                        }
                    }
                    None => {
                        replies.push(
                            self.error(error_code::NO_SESSION, "no complete load session"),
                        );
                    }
                }
            }
            MsgType::SetInputs => match protocol::decode_name_u64(&frame.payload) {
                Ok(map) => {
                    for (name, value) in map {
                        if let Err(e) = self.emu.set_input(&name, value) {
                            replies.push(
                                self.error(error_code::UNKNOWN_INPUT, &e.to_string()),
                            );
                        }
                    }
                }
                Err(e) => replies.push(self.error(error_code::BAD_PAYLOAD, &e.to_string())),
            },
            MsgType::Step => match Step::decode(&frame.payload) {
                Ok(step) => self.emu.run_ticks(step.ticks as u64),
                Err(e) => replies.push(self.error(error_code::BAD_PAYLOAD, &e.to_string())),
            },
            MsgType::GetOutputs => {
                let outs = self.emu.sample_outputs();
                let payload = protocol::encode_name_u64(&outs);
                replies.push(self.reply(MsgType::Outputs, &payload));
            }
            MsgType::Link => match Link::decode(&frame.payload) {
                Ok(link) => {
                    if self.links.iter().any(|l| l.side == link.side) {
                        replies.push(
                            self.error(error_code::LINK_REJECTED, "side already linked"),
                        );
                    } else {
                        let p = self.emu.program();
                        let lanes = if link.lanes != 0 {
                            link.lanes
                        } else {
                            match link.side {
                                Dir::N | Dir::S => p.width,
                                Dir::E | Dir::W => p.height,
                            }
                        };
                        info!(
                            "link {} -> {}:{} ({} lanes)",
                            link.side, link.host, link.port, lanes
                        );
                        self.links.push(LinkState {
                            side: link.side,
                            lanes,
                            local_out: link.local_out,
                            remote_in: link.remote_in,
                            host: link.host,
                            port: link.port,
                        });
                        let payload = LinkAck { lanes }.encode();
                        replies.push(self.reply(MsgType::LinkAck, &payload));
                    }
                }
                Err(e) => replies.push(self.error(error_code::BAD_PAYLOAD, &e.to_string())),
            },
            MsgType::Unlink => match Unlink::decode(&frame.payload) {
                Ok(u) => {
                    let before = self.links.len();
                    self.links.retain(|l| l.side != u.side);
                    debug!("unlink {}: removed {}", u.side, before - self.links.len());
                }
                Err(e) => replies.push(self.error(error_code::BAD_PAYLOAD, &e.to_string())),
            },
            MsgType::Quit => {
                control = Control::CloseConnection;
            }
            MsgType::Shutdown => {
                control = Control::ShutdownServer;
            }
            // Device-to-host types arriving at the device are dropped.
            MsgType::Outputs | MsgType::LinkAck | MsgType::Error => {
                debug!("ignoring device-bound frame {:?}", frame.msg_type);
            }
        }
        (replies, control)
    }
}

fn handle_client(stream: &mut TcpStream, program: &Program) -> anyhow::Result<Control> {
    stream
        .set_read_timeout(Some(Duration::from_secs(1)))
        .context("set_read_timeout")?;
    let mut session = Session::new(program.clone())?;
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(Control::Continue),
            Ok(n) => decoder.push(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e).context("read"),
        }
        while let Some(result) = decoder.next_frame() {
            let frame = match result {
                Ok(f) => f,
                Err(e) => {
                    // Bad frame: drop it, keep the session.
                    warn!("dropping frame: {e}");
                    continue;
                }
            };
            let (replies, control) = session.handle(&frame);
            for r in &replies {
                stream.write_all(r).context("write reply")?;
            }
            if control != Control::Continue {
                return Ok(control);
            }
        }
    }
}

/// Serve one program over TCP, one client at a time.
pub fn serve(addr: &str, program: Program) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!("listening on {addr}");
    for conn in listener.incoming() {
        let mut stream = match conn {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!("client connected: {peer}");
        match handle_client(&mut stream, &program) {
            Ok(Control::ShutdownServer) => {
                info!("shutdown requested by {peer}");
                break;
            }
            Ok(_) => info!("client disconnected: {peer}"),
            Err(e) => warn!("client {peer} failed: {e:#}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::{self, ScanOrder};
    use crate::program::{Cell, Coord, Source};

    fn passthrough_program() -> Program {
        let mut p = Program::new(4, 4).unwrap();
        let c = Coord::new(0, 0);
        p.cells.insert(
            c,
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
        p.output_bits.insert("o".into(), vec![Source::cell(c, Dir::E)]);
        p.latency = p.compute_latency().unwrap();
        p
    }

    fn request(session: &mut Session, msg_type: MsgType, payload: &[u8]) -> (Vec<Frame>, Control) {
        let frame = Frame {
            msg_type,
            flags: 0,
            seq: 1,
            payload: payload.to_vec(),
        };
        let (bytes, control) = session.handle(&frame);
        let mut dec = Decoder::new();
        let mut frames = Vec::new();
        for b in bytes {
            dec.push(&b);
        }
        while let Some(f) = dec.next_frame() {
            frames.push(f.unwrap());
        }
        (frames, control)
    }

    #[test]
    fn test_hello_reports_grid() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let (frames, _) = request(&mut s, MsgType::Hello, &[]);
        let hello = Hello::decode(&frames[0].payload).unwrap();
        assert_eq!((hello.width, hello.height), (4, 4));
    }

    #[test]
    fn test_step_and_outputs() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), 1u64);
        let (frames, _) = request(
            &mut s,
            MsgType::SetInputs,
            &protocol::encode_name_u64(&inputs),
        );
        assert!(frames.is_empty());
        request(&mut s, MsgType::Step, &Step { ticks: 2 }.encode());
        let (frames, _) = request(&mut s, MsgType::GetOutputs, &[]);
        assert_eq!(frames[0].msg_type, MsgType::Outputs);
        let outs = protocol::decode_name_u64(&frames[0].payload).unwrap();
        assert_eq!(outs["o"], 1);
    }

    #[test]
    fn test_unknown_input_is_error_frame() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert("zz".to_string(), 1u64);
        let (frames, control) = request(
            &mut s,
            MsgType::SetInputs,
            &protocol::encode_name_u64(&inputs),
        );
        assert_eq!(frames[0].msg_type, MsgType::Error);
        let e = ErrorInfo::decode(&frames[0].payload).unwrap();
        assert_eq!(e.code, error_code::UNKNOWN_INPUT);
        // Session survives.
        assert_eq!(control, Control::Continue);
    }

    #[test]
    fn test_chunked_load_and_apply() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let bs = bitstream::pack(s.emulator().program(), ScanOrder::RowMajor, 0);
        let mid = bs.len() / 2;
        for (offset, part) in [(0usize, &bs[..mid]), (mid, &bs[mid..])] {
            let chunk = LoadChunk {
                session_id: 7,
                total_bytes: bs.len() as u32,
                offset: offset as u32,
                data: part.to_vec(),
            };
            let (frames, _) = request(&mut s, MsgType::LoadChunk, &chunk.encode());
            assert!(frames.is_empty());
        }
        let (frames, _) = request(&mut s, MsgType::Apply, &[]);
        assert!(frames.is_empty(), "apply of a valid image is silent");
    }

    #[test]
    fn test_resent_chunk_does_not_fake_completion() {
        // A retransmitted first half must not make up for a missing second
        // half: completion is byte coverage, not a running count.
        let mut s = Session::new(passthrough_program()).unwrap();
        let bs = bitstream::pack(s.emulator().program(), ScanOrder::RowMajor, 0);
        let mid = bs.len() / 2;
        let first = LoadChunk {
            session_id: 7,
            total_bytes: bs.len() as u32,
            offset: 0,
            data: bs[..mid].to_vec(),
        };
        request(&mut s, MsgType::LoadChunk, &first.encode());
        request(&mut s, MsgType::LoadChunk, &first.encode());
        let (frames, _) = request(&mut s, MsgType::Apply, &[]);
        let e = ErrorInfo::decode(&frames[0].payload).unwrap();
        assert_eq!(e.code, error_code::NO_SESSION);

        let second = LoadChunk {
            session_id: 7,
            total_bytes: bs.len() as u32,
            offset: mid as u32,
            data: bs[mid..].to_vec(),
        };
        request(&mut s, MsgType::LoadChunk, &second.encode());
        let (frames, _) = request(&mut s, MsgType::Apply, &[]);
        assert!(frames.is_empty(), "fully covered image applies");
    }

    #[test]
    fn test_apply_without_session() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let (frames, _) = request(&mut s, MsgType::Apply, &[]);
        let e = ErrorInfo::decode(&frames[0].payload).unwrap();
        assert_eq!(e.code, error_code::NO_SESSION);
    }

    #[test]
    fn test_link_ack_resolves_lanes() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let link = Link {
            side: Dir::E,
            lanes: 0,
            local_out: "east".into(),
            remote_in: "west".into(),
            host: "127.0.0.1".into(),
            port: 9001,
        };
        let (frames, _) = request(&mut s, MsgType::Link, &link.encode());
        assert_eq!(frames[0].msg_type, MsgType::LinkAck);
        assert_eq!(LinkAck::decode(&frames[0].payload).unwrap().lanes, 4);
        assert_eq!(s.links().len(), 1);

        // Second link on the same side is rejected.
        let (frames, _) = request(&mut s, MsgType::Link, &link.encode());
        assert_eq!(frames[0].msg_type, MsgType::Error);

        request(&mut s, MsgType::Unlink, &Unlink { side: Dir::E }.encode());
        assert!(s.links().is_empty());
    }

    #[test]
    fn test_quit_and_shutdown_controls() {
        let mut s = Session::new(passthrough_program()).unwrap();
        let (_, c) = request(&mut s, MsgType::Quit, &[]);
        assert_eq!(c, Control::CloseConnection);
        let (_, c) = request(&mut s, MsgType::Shutdown, &[]);
        assert_eq!(c, Control::ShutdownServer);
    }
}
