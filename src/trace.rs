//! Seam/barrier trace capture for offline debugging.
//!
//! Events are appended to a file as JSON lines or CSV rows; every event
//! carries the tile, seam side, epoch, phase and an optional lane payload so
//! a stalled barrier can be reconstructed after the fact.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Jsonl,
    Csv,
}

impl TraceFormat {
    pub fn from_name(name: &str) -> Option<TraceFormat> {
        match name {
            "jsonl" | "json" => Some(TraceFormat::Jsonl),
            "csv" => Some(TraceFormat::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// "tx", "rx", "aligned", "fault".
    pub kind: &'static str,
    pub tile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    pub epoch: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lanes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct TraceLogger {
    out: BufWriter<File>,
    format: TraceFormat,
}

impl TraceLogger {
    pub fn create(path: &Path, format: TraceFormat) -> std::io::Result<TraceLogger> {
        let mut out = BufWriter::new(File::create(path)?);
        if format == TraceFormat::Csv {
            writeln!(out, "kind,tile,side,epoch,phase,value,lanes,detail")?;
        }
        Ok(TraceLogger { out, format })
    }

    pub fn log(&mut self, ev: &TraceEvent) -> std::io::Result<()> {
        match self.format {
            TraceFormat::Jsonl => {
                serde_json::to_writer(&mut self.out, ev)?;
                writeln!(self.out)?;
            }
            TraceFormat::Csv => {
                let lanes = ev
                    .lanes
                    .as_ref()
                    .map(|l| {
                        l.iter()
                            .map(|b| b.to_string())
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                writeln!(
                    self.out,
                    "{},{},{},{},{},{},{},{}",
                    ev.kind,
                    ev.tile,
                    ev.side.as_deref().unwrap_or(""),
                    ev.epoch,
                    ev.phase.as_deref().unwrap_or(""),
                    ev.value.map(|v| v.to_string()).unwrap_or_default(),
                    lanes,
                    ev.detail.as_deref().unwrap_or("")
                )?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TraceEvent {
        TraceEvent {
            kind: "rx",
            tile: "tl".to_string(),
            side: Some("E".to_string()),
            epoch: 3,
            phase: Some("A".to_string()),
            value: Some(0xAB),
            lanes: Some(vec![1, 0, 1]),
            detail: None,
        }
    }

    #[test]
    fn test_jsonl_lines() {
        let dir = std::env::temp_dir().join("bitgrid-trace-jsonl");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.jsonl");
        let mut log = TraceLogger::create(&path, TraceFormat::Jsonl).unwrap();
        log.log(&event()).unwrap();
        log.log(&event()).unwrap();
        log.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let v: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(v["kind"], "rx");
        assert_eq!(v["epoch"], 3);
    }

    #[test]
    fn test_csv_header_and_rows() {
        let dir = std::env::temp_dir().join("bitgrid-trace-csv");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.csv");
        let mut log = TraceLogger::create(&path, TraceFormat::Csv).unwrap();
        log.log(&event()).unwrap();
        log.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("kind,tile"));
        assert_eq!(lines.next().unwrap(), "rx,tl,E,3,A,171,101,");
    }
}
