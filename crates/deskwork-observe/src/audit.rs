//! Append-only, hash-chained record of executed tool calls.
//!
//! Each line of `audit.jsonl` carries the hash of the previous line, so any
//! edit or deletion in the middle of the file breaks the chain.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const APPEND_ATTEMPTS: usize = 3;

/// What a caller reports about one finished tool call.
#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub session_id: &'a str,
    pub tool: &'a str,
    pub status: &'a str,
    /// Redacted, human-readable summary. Never raw arguments or output.
    pub action: &'a str,
    pub duration_ms: u64,
    pub working_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: u64,
    pub session_id: String,
    pub tool: String,
    pub status: String,
    pub action: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub working_dir: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let ts = self.ts.to_string();
        let duration = self.duration_ms.to_string();
        let fields: [&str; 8] = [
            &self.prev_hash,
            &ts,
            &self.session_id,
            &self.tool,
            &self.status,
            &self.action,
            &duration,
            self.working_dir.as_deref().unwrap_or(""),
        ];
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }
}

pub struct AuditLog {
    path: PathBuf,
    // Serializes read-last-hash + append so concurrent writers keep one chain.
    last_hash: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_hash: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord<'_>) -> Result<AuditEntry> {
        let mut last = self.last_hash.lock().unwrap_or_else(|e| e.into_inner());
        let prev_hash = match last.as_ref() {
            Some(hash) => hash.clone(),
            None => self.read_last_hash()?,
        };

        let mut entry = AuditEntry {
            ts: deskwork_core::now_ms(),
            session_id: record.session_id.to_string(),
            tool: record.tool.to_string(),
            status: record.status.to_string(),
            action: record.action.to_string(),
            duration_ms: record.duration_ms,
            working_dir: record.working_dir.map(|p| p.display().to_string()),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        let line = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut last_err = None;
        for _ in 0..APPEND_ATTEMPTS {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .and_then(|mut file| writeln!(file, "{line}"));
            match written {
                Ok(()) => {
                    *last = Some(entry.hash.clone());
                    return Ok(entry);
                }
                Err(err) => {
                    last_err = Some(err);
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
        }
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("audit append failed")))
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<AuditEntry>(line).map_err(anyhow::Error::from))
            .collect()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self.entries()?.into_iter().rev().take(limit).collect())
    }

    /// True when every entry hashes correctly and links to its predecessor.
    pub fn verify_chain(&self) -> Result<bool> {
        let mut prev = String::new();
        for entry in self.entries()? {
            if entry.prev_hash != prev || entry.compute_hash() != entry.hash {
                return Ok(false);
            }
            prev = entry.hash;
        }
        Ok(true)
    }

    fn read_last_hash(&self) -> Result<String> {
        Ok(self
            .entries()?
            .last()
            .map(|entry| entry.hash.clone())
            .unwrap_or_default())
    }
}
