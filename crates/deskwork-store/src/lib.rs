use anyhow::Result;
use chrono::{DateTime, Utc};
use deskwork_core::{
    ChatMessage, SESSION_EXPORT_FORMAT, SESSION_EXPORT_VERSION, Session, SessionExport,
    SessionSummary, Skill, Template, validate_transcript,
};
use deskwork_policy::PolicyEngine;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub mod redact;

pub use redact::{redact_for_storage, scrub_for_export, tool_output_placeholder};

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const UNTITLED_SESSION_TITLE: &str = "Untitled Chat";

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            payload TEXT NOT NULL,
            UNIQUE(session_id, seq)
         );
         CREATE INDEX IF NOT EXISTS idx_sessions_order ON sessions(pinned DESC, updated_at DESC);",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            prompt TEXT NOT NULL,
            created_at INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS skills (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            tools TEXT NOT NULL
         );",
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("malformed import payload: {0}")]
    Malformed(String),
    #[error("invalid session '{id}': {reason}")]
    InvalidSession { id: String, reason: String },
}

/// Durable transcript operations the agent loop depends on.
pub trait TranscriptStore: Send + Sync {
    fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Appends in order, redacting each message first.
    fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()>;

    /// Skill toggles; an empty list leaves every tool enabled.
    fn skills(&self) -> Result<Vec<Skill>> {
        Ok(Vec::new())
    }
}

pub struct Store {
    pub root: PathBuf,
    db_path: PathBuf,
    policy: PolicyEngine,
}

impl Store {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let store = Self {
            root: data_dir.to_path_buf(),
            db_path: data_dir.join("sessions.sqlite"),
            policy: PolicyEngine::default(),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn db(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    // ── Sessions ───────────────────────────────────────────────────────

    pub fn create_session(&self, title: &str) -> Result<Session> {
        let now = now_millis();
        let title = normalize_title(title, DEFAULT_SESSION_TITLE);
        let session = Session {
            id: Uuid::now_v7().to_string(),
            title,
            created_at: from_millis(now),
            updated_at: from_millis(now),
            pinned: false,
            messages: Vec::new(),
        };
        self.db()?.execute(
            "INSERT INTO sessions (id, title, created_at, updated_at, pinned) VALUES (?1, ?2, ?3, ?4, 0)",
            params![session.id, session.title, now, now],
        )?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.db()?;
        load_session(&conn, id)
    }

    /// Summaries sorted pinned-first, then most recently updated.
    ///
    /// A non-empty `query` keeps sessions whose title or id contains it,
    /// ignoring case.
    pub fn list_sessions(&self, query: Option<&str>) -> Result<Vec<SessionSummary>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.title, s.created_at, s.updated_at, s.pinned,
                    (SELECT COUNT(1) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s
             ORDER BY s.pinned DESC, s.updated_at DESC, s.id DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SessionSummary {
                id: r.get(0)?,
                title: r.get(1)?,
                created_at: from_millis(r.get(2)?),
                updated_at: from_millis(r.get(3)?),
                pinned: r.get::<_, i64>(4)? != 0,
                message_count: r.get::<_, i64>(5)?.max(0) as usize,
            })
        })?;
        let needle = query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());
        let mut out = Vec::new();
        for row in rows {
            let summary = row?;
            let keep = needle.as_ref().is_none_or(|q| {
                summary.title.to_lowercase().contains(q) || summary.id.to_lowercase().contains(q)
            });
            if keep {
                out.push(summary);
            }
        }
        Ok(out)
    }

    pub fn append_message(&self, id: &str, message: &ChatMessage) -> Result<()> {
        self.append_messages(id, std::slice::from_ref(message))
    }

    pub fn rename_session(&self, id: &str, title: &str) -> Result<Session> {
        let title = normalize_title(title, UNTITLED_SESSION_TITLE);
        self.touch_metadata(id, |tx, updated_at| {
            tx.execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, updated_at, id],
            )?;
            Ok(())
        })
    }

    pub fn toggle_pin(&self, id: &str, pinned: bool) -> Result<Session> {
        self.touch_metadata(id, |tx, updated_at| {
            tx.execute(
                "UPDATE sessions SET pinned = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(pinned), updated_at, id],
            )?;
            Ok(())
        })
    }

    fn touch_metadata<F>(&self, id: &str, apply: F) -> Result<Session>
    where
        F: FnOnce(&Transaction<'_>, i64) -> Result<()>,
    {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        let updated_at = next_updated_at(&tx, id)?;
        apply(&tx, updated_at)?;
        tx.commit()?;
        load_session(&conn, id)?.ok_or_else(|| StoreError::SessionNotFound(id.to_string()).into())
    }

    // ── Export / import ────────────────────────────────────────────────

    /// Every session as a self-contained JSON document with tool output,
    /// images, credentials and file paths already scrubbed.
    pub fn export_sessions(&self) -> Result<String> {
        let conn = self.db()?;
        let ids: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions ORDER BY pinned DESC, updated_at DESC, id DESC")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut session) = load_session(&conn, &id)? else {
                continue;
            };
            session.title = self.policy.scrub_for_export(&session.title);
            session.messages = session
                .messages
                .iter()
                .map(|m| scrub_for_export(&self.policy, m))
                .collect();
            sessions.push(session);
        }
        let doc = SessionExport {
            format: SESSION_EXPORT_FORMAT.to_string(),
            version: SESSION_EXPORT_VERSION,
            exported_at: Utc::now(),
            sessions,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Validates the whole payload first, then replaces or inserts every
    /// session in one transaction. Nothing is written if any session is bad.
    pub fn import_sessions(&self, payload: &str) -> Result<usize> {
        let doc: SessionExport =
            serde_json::from_str(payload).map_err(|e| ImportError::Malformed(e.to_string()))?;
        if doc.format != SESSION_EXPORT_FORMAT {
            return Err(ImportError::Malformed(format!("unknown format '{}'", doc.format)).into());
        }
        if doc.version > SESSION_EXPORT_VERSION {
            return Err(ImportError::Malformed(format!(
                "unsupported version {} (newest known is {SESSION_EXPORT_VERSION})",
                doc.version
            ))
            .into());
        }
        let mut seen = std::collections::HashSet::new();
        for session in &doc.sessions {
            validate_import(session)?;
            if !seen.insert(session.id.as_str()) {
                return Err(ImportError::InvalidSession {
                    id: session.id.clone(),
                    reason: "duplicate id in payload".to_string(),
                }
                .into());
            }
        }

        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        for session in &doc.sessions {
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session.id])?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![session.id])?;
            tx.execute(
                "INSERT INTO sessions (id, title, created_at, updated_at, pinned) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.id,
                    session.title,
                    session.created_at.timestamp_millis(),
                    session.updated_at.timestamp_millis(),
                    i64::from(session.pinned)
                ],
            )?;
            insert_messages(&tx, &self.policy, &session.id, 0, &session.messages)?;
        }
        tx.commit()?;
        Ok(doc.sessions.len())
    }

    // ── Templates ──────────────────────────────────────────────────────

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT id, title, prompt FROM templates ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |r| {
            Ok(Template {
                id: r.get(0)?,
                title: r.get(1)?,
                prompt: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn save_template(&self, title: &str, prompt: &str) -> Result<Template> {
        let template = Template {
            id: Uuid::now_v7().to_string(),
            title: title.to_string(),
            prompt: prompt.to_string(),
        };
        insert_template(&self.db()?, &template)?;
        Ok(template)
    }

    pub fn delete_template(&self, id: &str) -> Result<bool> {
        let changed = self
            .db()?
            .execute("DELETE FROM templates WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ── Skills ─────────────────────────────────────────────────────────

    /// Inserts any skill not yet stored; existing toggles are kept.
    pub fn ensure_skills(&self, defaults: &[Skill]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        for skill in defaults {
            tx.execute(
                "INSERT OR IGNORE INTO skills (id, name, description, enabled, tools) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    skill.id,
                    skill.name,
                    skill.description,
                    i64::from(skill.enabled),
                    serde_json::to_string(&skill.tools)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_skills(&self) -> Result<Vec<Skill>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, enabled, tools FROM skills ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, description, enabled, tools) = row?;
            out.push(Skill {
                id,
                name,
                description,
                enabled,
                tools: serde_json::from_str(&tools)?,
            });
        }
        Ok(out)
    }

    /// Returns `false` when no skill has that id.
    pub fn set_skill_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let changed = self.db()?.execute(
            "UPDATE skills SET enabled = ?1 WHERE id = ?2",
            params![i64::from(enabled), id],
        )?;
        Ok(changed > 0)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
                if *version == 2 {
                    seed_templates(&conn)?;
                }
            }
        }
        Ok(())
    }
}

impl TranscriptStore for Store {
    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Store::get_session(self, id)
    }

    fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        let updated_at = next_updated_at(&tx, id)?;
        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE session_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        insert_messages(&tx, &self.policy, id, next_seq, messages)?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![updated_at, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn skills(&self) -> Result<Vec<Skill>> {
        self.list_skills()
    }
}

fn insert_messages(
    tx: &Transaction<'_>,
    policy: &PolicyEngine,
    session_id: &str,
    after_seq: i64,
    messages: &[ChatMessage],
) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO messages (session_id, seq, role, payload) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (offset, message) in messages.iter().enumerate() {
        let redacted = redact_for_storage(policy, message);
        let seq = after_seq + 1 + offset as i64;
        stmt.execute(params![
            session_id,
            seq,
            redacted.role(),
            serde_json::to_string(&redacted)?
        ])?;
    }
    Ok(())
}

fn load_session(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let header = conn
        .query_row(
            "SELECT id, title, created_at, updated_at, pinned FROM sessions WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)? != 0,
                ))
            },
        )
        .optional()?;
    let Some((id, title, created_at, updated_at, pinned)) = header else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT payload FROM messages WHERE session_id = ?1 ORDER BY seq ASC")?;
    let rows = stmt.query_map(params![id], |r| r.get::<_, String>(0))?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(serde_json::from_str(&row?)?);
    }
    Ok(Some(Session {
        id,
        title,
        created_at: from_millis(created_at),
        updated_at: from_millis(updated_at),
        pinned,
        messages,
    }))
}

/// `updated_at` for the next mutation: now, but never earlier than the
/// current value.
fn next_updated_at(tx: &Transaction<'_>, id: &str) -> Result<i64> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT updated_at FROM sessions WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    let current = current.ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
    Ok(now_millis().max(current))
}

fn validate_import(session: &Session) -> Result<(), ImportError> {
    let invalid = |reason: &str| ImportError::InvalidSession {
        id: session.id.clone(),
        reason: reason.to_string(),
    };
    if session.id.trim().is_empty() {
        return Err(invalid("empty id"));
    }
    if session.updated_at < session.created_at {
        return Err(invalid("updated_at precedes created_at"));
    }
    validate_transcript(&session.messages).map_err(|e| invalid(&e.to_string()))
}

fn seed_templates(conn: &Connection) -> Result<()> {
    let defaults = [
        (
            "Code Review",
            "Please review the code in the current directory. Look for bugs, security issues, and performance improvements.",
        ),
        (
            "Summarize Project",
            "Read the README.md and the file structure, then summarize what this project does.",
        ),
    ];
    for (title, prompt) in defaults {
        insert_template(
            conn,
            &Template {
                id: Uuid::now_v7().to_string(),
                title: title.to_string(),
                prompt: prompt.to_string(),
            },
        )?;
    }
    Ok(())
}

fn insert_template(conn: &Connection, template: &Template) -> Result<()> {
    conn.execute(
        "INSERT INTO templates (id, title, prompt, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![template.id, template.title, template.prompt, now_millis()],
    )?;
    Ok(())
}

fn normalize_title(title: &str, fallback: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
