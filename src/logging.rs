//! Structured logging for the escalation engine.
//!
//! Every record is one JSON object on stderr (stdout carries the broadcast
//! stream in the binary), stamped with the run id and a process-wide
//! sequence number. `incident`, `status` and `msg` are lifted to the top
//! level so a single incident can be followed with `jq`; everything else
//! lands under `data`.
//!
//! Environment:
//! - `LOG_LEVEL`: trace | debug | info (default) | warn | error
//! - `LOG_DOMAINS`: comma-separated domain names, or `all` (default)
//! - `RUN_ID`: correlation id, generated when unset
//! - `LOG_DIR`: when set, records are also appended to
//!   `<LOG_DIR>/<run_id>/events.jsonl` (info and above) and `trace.jsonl`

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(Level::Info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Ingest,    // inbound sensor/perception/dashboard messages
    Incident,  // transitions
    Timer,     // countdown lifecycle
    Notify,    // email, sound, snapshots
    Broadcast, // observer fan-out
    System,    // startup, shutdown, config
    Profile,   // notifier latency
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ingest => "ingest",
            Domain::Incident => "incident",
            Domain::Timer => "timer",
            Domain::Notify => "notify",
            Domain::Broadcast => "broadcast",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match filter().domains.as_ref() {
            None => true,
            Some(allowed) => allowed.iter().any(|d| d == self.as_str()),
        }
    }
}

struct Filter {
    min_level: Level,
    // None means every domain
    domains: Option<Vec<String>>,
}

fn filter() -> &'static Filter {
    static FILTER: OnceLock<Filter> = OnceLock::new();
    FILTER.get_or_init(|| Filter {
        min_level: Level::from_env(),
        domains: std::env::var("LOG_DOMAINS").ok().and_then(|v| parse_domains(&v)),
    })
}

fn parse_domains(raw: &str) -> Option<Vec<String>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return None;
    }
    Some(
        raw.split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect(),
    )
}

type Sink = Mutex<BufWriter<File>>;

struct Run {
    id: String,
    events: Option<Sink>,
    trace: Option<Sink>,
}

static SEQ: AtomicU64 = AtomicU64::new(0);

fn run() -> &'static Run {
    static RUN: OnceLock<Run> = OnceLock::new();
    RUN.get_or_init(|| {
        let id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("fw-{}-{}", Utc::now().timestamp_millis(), std::process::id()));
        match std::env::var("LOG_DIR") {
            Ok(base) => open_run_dir(&Path::new(&base).join(&id), id),
            Err(_) => Run { id, events: None, trace: None },
        }
    })
}

fn open_run_dir(dir: &Path, id: String) -> Run {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("[log] cannot create {}: {}", dir.display(), err);
        return Run { id, events: None, trace: None };
    }
    let open = |name: &str| {
        File::create(dir.join(name))
            .map(|f| Mutex::new(BufWriter::new(f)))
            .map_err(|err| eprintln!("[log] cannot create {}: {}", name, err))
            .ok()
    };
    Run { events: open("events.jsonl"), trace: open("trace.jsonl"), id }
}

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    run_id: &'a str,
    seq: u64,
    lvl: Level,
    component: &'static str,
    event: &'a str,
    #[serde(flatten)]
    top: Map<String, Value>,
    data: Map<String, Value>,
}

const REDACTED_KEYS: &[&str] = &["password", "smtp_password", "authorization"];
const TOP_LEVEL_KEYS: &[&str] = &["incident", "status", "msg"];

fn redact(fields: &mut Map<String, Value>) {
    for key in REDACTED_KEYS {
        if let Some(v) = fields.get_mut(*key) {
            *v = v_str("[REDACTED]");
        }
    }
}

fn lift(fields: &mut Map<String, Value>) -> Map<String, Value> {
    TOP_LEVEL_KEYS
        .iter()
        .filter_map(|k| fields.remove(*k).map(|v| ((*k).to_string(), v)))
        .collect()
}

/// Emit one record if `level` and `domain` pass the filter.
pub fn log(level: Level, domain: Domain, event: &str, mut fields: Map<String, Value>) {
    if level < filter().min_level || !domain.is_enabled() {
        return;
    }
    redact(&mut fields);
    let top = lift(&mut fields);
    let run = run();
    let record = Record {
        ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        run_id: &run.id,
        seq: SEQ.fetch_add(1, Ordering::Relaxed),
        lvl: level,
        component: domain.as_str(),
        event,
        top,
        data: fields,
    };
    let Ok(line) = serde_json::to_string(&record) else {
        return;
    };

    let sink = if level >= Level::Info { &run.events } else { &run.trace };
    if let Some(Ok(mut w)) = sink.as_ref().map(|s| s.lock()) {
        let _ = writeln!(w, "{}", line).and_then(|_| w.flush());
    }
    eprintln!("{}", line);
}

pub fn info(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Info, domain, event, fields);
}

pub fn warn(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Warn, domain, event, fields);
}

pub fn debug(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Debug, domain, event, fields);
}

/// Short sha256 fingerprint for correlating payloads and frames in logs
/// without writing them out.
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}

/// Emits a trace record with the elapsed time when dropped.
pub struct ProfileScope {
    label: &'static str,
    fields: Map<String, Value>,
    start: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, fields: obj(fields), start: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let mut fields = std::mem::take(&mut self.fields);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_us".to_string(), json!(self.start.elapsed().as_micros() as u64));
        log(Level::Trace, Domain::Profile, "scope", fields);
    }
}
