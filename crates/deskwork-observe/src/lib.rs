use anyhow::Result;
use chrono::{Local, Utc};
use deskwork_core::{TelemetryConfig, TelemetryEvent};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod audit;
pub mod publisher;

pub use audit::{AuditEntry, AuditLog, AuditRecord};
pub use publisher::{Publisher, TELEMETRY_CAPACITY};

pub const NO_SESSION_LOG: &str = "No logs found for this session.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Per-session log files, the audit chain and the optional remote sink.
pub struct Observer {
    log_dir: PathBuf,
    audit: AuditLog,
    telemetry: Option<TelemetrySink>,
    verbose: AtomicBool,
    structured: AtomicBool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(data_dir: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        let log_dir = data_dir.join("logs");
        fs::create_dir_all(&log_dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_dir,
            audit: AuditLog::new(data_dir.join("audit.jsonl")),
            telemetry,
            verbose: AtomicBool::new(false),
            structured: AtomicBool::new(false),
        })
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Switch between `[ts] [LEVEL] msg` lines and JSON lines.
    pub fn set_structured(&self, structured: bool) {
        self.structured.store(structured, Ordering::Relaxed);
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn log(&self, session_id: &str, level: LogLevel, message: &str) -> Result<()> {
        let line = if self.structured.load(Ordering::Relaxed) {
            serde_json::to_string(&json!({
                "ts": Utc::now().to_rfc3339(),
                "level": level.as_str(),
                "session_id": session_id,
                "message": message,
            }))?
        } else {
            format!(
                "[{}] [{}] {message}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level.as_str()
            )
        };
        append_line(&self.session_log_path(session_id), &line)
    }

    /// Log a message to stderr with `[deskwork]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.is_verbose() {
            eprintln!("[deskwork] {msg}");
        }
    }

    /// Log a warning: always written to the session log, and to stderr.
    pub fn warn_log(&self, session_id: &str, msg: &str) {
        eprintln!("[deskwork WARN] {msg}");
        let _ = self.log(session_id, LogLevel::Warn, msg);
    }

    pub fn session_log(&self, session_id: &str) -> Result<String> {
        let path = self.session_log_path(session_id);
        if path.exists() {
            Ok(fs::read_to_string(path)?)
        } else {
            Ok(NO_SESSION_LOG.to_string())
        }
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", sanitize_file_stem(session_id)))
    }

    /// Forward a telemetry event to the remote sink, if one is configured.
    pub fn emit_telemetry(&self, session_id: &str, event: &TelemetryEvent) -> Result<()> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };

        let body = json!({
            "name": "deskwork.telemetry",
            "at": Utc::now().to_rfc3339(),
            "session_id": session_id,
            "payload": event,
        });

        // Fire-and-forget so the dispatch thread never waits on the network.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.session_log_path(session_id);
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = append_line(&log_path, &line);
            }
        });
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}
