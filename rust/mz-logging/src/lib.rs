//! mz-logging: terminal logger setup + append-only NDJSON decision events.
//!
//! Diagnostics go through the `log` facade; per-decision records that are
//! meant to be post-processed go to an NDJSON file, one object per line.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::LevelFilter;
use serde::Serialize;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version stamped on every event.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

pub fn now_ms() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_millis() as u64
}

/// Parse a level name ("error" .. "trace", or "off"). Unknown names give `None`.
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    s.trim().parse::<LevelFilter>().ok()
}

/// Install a terminal logger at `level`. Fails if a logger is already set.
pub fn init_terminal(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfoV1 {
    pub schema: u32,
    pub protocol_version: u32,
    pub crate_version: &'static str,
}

impl VersionInfoV1 {
    pub fn new(protocol_version: u32) -> Self {
        Self {
            schema: EVENT_SCHEMA_VERSION,
            protocol_version,
            crate_version: VERSION,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InferStatsV1 {
    pub inflight: u64,
    pub queued: u64,
    pub submitted: u64,
    pub calls: u64,
    pub results: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub max_inflight: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_mean_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummaryV1 {
    pub entropy: f32,
    pub max_p: f32,
    pub argmax: String,
}

impl PolicySummaryV1 {
    /// Summarize a labelled distribution. `None` when it is empty.
    pub fn from_labelled<L: ToString>(dist: &[(L, f32)]) -> Option<Self> {
        let (best, max_p) = dist
            .iter()
            .fold(None::<(&L, f32)>, |acc, (l, p)| match acc {
                Some((_, bp)) if bp >= *p => acc,
                _ => Some((l, *p)),
            })?;
        let entropy = dist
            .iter()
            .map(|(_, p)| *p)
            .filter(|p| *p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        Some(Self {
            entropy,
            max_p,
            argmax: best.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub v: VersionInfoV1,

    pub run_id: String,
    pub game_id: u64,
    pub ply: u32,
    pub player: u8,
    pub decision: String,

    pub action: String,
    pub budget_ms: u64,
    pub elapsed_ms: u64,
    pub root_visits: u32,
    pub root_children: usize,
    pub root_value: f32,
    pub simulations: u64,
    pub workers_merged: usize,
    pub workers_failed: usize,
    pub workers_late: usize,

    pub policy: Option<PolicySummaryV1>,
    pub infer: Option<InferStatsV1>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameEndEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub v: VersionInfoV1,

    pub run_id: String,
    pub game_id: u64,
    pub plies: u32,
    /// `None` for a draw.
    pub winner: Option<u8>,
    pub wall_ms: u64,
}

#[derive(Debug)]
pub enum NdjsonError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for NdjsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NdjsonError::Io(e) => write!(f, "ndjson io: {e}"),
            NdjsonError::Json(e) => write!(f, "ndjson encode: {e}"),
        }
    }
}

impl std::error::Error for NdjsonError {}

impl From<io::Error> for NdjsonError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for NdjsonError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Append-only NDJSON writer.
///
/// Contract: each call writes exactly one JSON object followed by a newline.
pub struct NdjsonWriter {
    w: BufWriter<File>,
    lines_since_flush: u64,
    flush_every_lines: u64,
}

impl NdjsonWriter {
    /// Open a file for append. Creates it if it doesn't exist.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        Self::open_append_with_flush(path, 0)
    }

    /// `flush_every_lines=0` disables periodic flushing.
    pub fn open_append_with_flush(
        path: impl AsRef<Path>,
        flush_every_lines: u64,
    ) -> Result<Self, NdjsonError> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            w: BufWriter::new(f),
            lines_since_flush: 0,
            flush_every_lines,
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut buf = serde_json::to_vec(event)?;
        buf.push(b'\n');
        self.w.write_all(&buf)?;
        self.lines_since_flush += 1;
        if self.flush_every_lines > 0 && self.lines_since_flush >= self.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        self.lines_since_flush = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use serde_json::Value;

    fn read_ndjson_lenient(path: &Path) -> Vec<Value> {
        let s = fs::read_to_string(path).expect("read");
        s.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .collect()
    }

    fn decision(ply: u32, action: &str) -> DecisionEventV1 {
        DecisionEventV1 {
            event: "decision",
            ts_ms: now_ms(),
            v: VersionInfoV1::new(1),
            run_id: "r".to_string(),
            game_id: 3,
            ply,
            player: 0,
            decision: "Priority".to_string(),
            action: action.to_string(),
            budget_ms: 40,
            elapsed_ms: 41,
            root_visits: 120,
            root_children: 3,
            root_value: 0.25,
            simulations: 118,
            workers_merged: 4,
            workers_failed: 0,
            workers_late: 0,
            policy: PolicySummaryV1::from_labelled(&[("ability:0", 0.25), ("ability:1", 0.75)]),
            infer: None,
        }
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn writes_one_valid_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut w = NdjsonWriter::open_append(&path).unwrap();
        w.write_event(&decision(0, "ability:1")).unwrap();
        w.write_event(&decision(1, "target:1")).unwrap();
        w.flush().unwrap();

        let vals = read_ndjson_lenient(&path);
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0]["event"], "decision");
        assert_eq!(vals[0]["v"]["schema"], EVENT_SCHEMA_VERSION);
        assert_eq!(vals[1]["action"], "target:1");
        assert_eq!(vals[1]["policy"]["argmax"], "ability:1");
        assert!(vals[1]["infer"].is_null());
    }

    #[test]
    fn lenient_reader_tolerates_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        {
            let mut w = NdjsonWriter::open_append_with_flush(&path, 1).unwrap();
            w.write_event(&decision(0, "ability:0")).unwrap();
        }

        // Crash mid-write: a partial object with no newline.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"event":"decision","ply":"#).unwrap();
        f.flush().unwrap();

        let vals = read_ndjson_lenient(&path);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0]["ply"], 0);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        for ply in 0..2 {
            let mut w = NdjsonWriter::open_append(&path).unwrap();
            w.write_event(&decision(ply, "ability:0")).unwrap();
        }
        assert_eq!(read_ndjson_lenient(&path).len(), 2);
    }

    #[test]
    fn policy_summary() {
        let s = PolicySummaryV1::from_labelled(&[("a", 0.5), ("b", 0.5)]).unwrap();
        assert_eq!(s.argmax, "a");
        assert!((s.entropy - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(PolicySummaryV1::from_labelled::<&str>(&[]).is_none());
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
