use deskwork_core::{AppSettings, Sensitivity, ToolKind};
use regex::{Captures, Regex};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

pub const REASON_READ_ONLY: &str = "Read-only mode is enabled";
pub const REASON_OUTSIDE_WORKSPACE: &str = "Path is outside the active workspace";
pub const REASON_EXTERNAL_URL: &str = "External URL requires approval";
pub const REASON_SENSITIVE: &str = "Sensitive action requires explicit approval";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("path '{0}' is outside the active workspace")]
    PathOutsideWorkspace(String),
    #[error("command '{0}' is not in the allowlist")]
    CommandNotAllowed(String),
}

/// What the policy needs to know about one tool call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub tool: &'a str,
    pub arguments: &'a Value,
    pub sensitivity: Sensitivity,
    pub kind: ToolKind,
    pub mutating: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    secret_regex: Regex,
    api_key_regex: Regex,
    bearer_regex: Regex,
    unix_path_regex: Regex,
    windows_path_regex: Regex,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            secret_regex: Regex::new(r"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*[^\s]+")
                .expect("valid regex"),
            api_key_regex: Regex::new(r"\bsk-[A-Za-z0-9_\-]{12,}").expect("valid regex"),
            bearer_regex: Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._\-]+").expect("valid regex"),
            unix_path_regex: Regex::new(r#"(^|[\s"'(=:,\[])((?:/[^\s/"'<>()\[\],]+){2,}/?)"#)
                .expect("valid regex"),
            windows_path_regex: Regex::new(r#"(^|[\s"'(=:,\[])([A-Za-z]:\\[^\s"'<>()\[\],]*)"#)
                .expect("valid regex"),
        }
    }

    /// Why a call must wait for the user, or `None` when it may run unattended.
    ///
    /// Read-only mode pends every mutating call, whatever its declared
    /// sensitivity. Otherwise only sensitive calls are pended, with the most
    /// specific reason the arguments support.
    pub fn approval_reason(
        &self,
        call: &CallContext<'_>,
        working_dir: &Path,
        settings: &AppSettings,
    ) -> Option<String> {
        if settings.read_only && call.mutating {
            return Some(REASON_READ_ONLY.to_string());
        }
        if call.sensitivity == Sensitivity::Safe {
            return None;
        }

        if call.kind == ToolKind::Shell
            && let Some(command) = command_line(call.arguments)
            && let Err(PolicyError::CommandNotAllowed(cmd)) =
                self.check_command(&command, &settings.command_allowlist)
        {
            return Some(format!("Command '{cmd}' is not in the allowlist"));
        }

        let target = string_arg(call.arguments, "path").or_else(|| string_arg(call.arguments, "url"));
        if let Some(target) = target {
            if is_external_url(target) {
                return Some(REASON_EXTERNAL_URL.to_string());
            }
            if self.check_path(target, working_dir).is_err() {
                return Some(REASON_OUTSIDE_WORKSPACE.to_string());
            }
        }

        Some(REASON_SENSITIVE.to_string())
    }

    /// Dry-run preview shown in an approval request.
    pub fn action_summary(&self, tool: &str, arguments: &Value, kind: ToolKind) -> String {
        let summary = match (kind, command_line(arguments), string_arg(arguments, "path")) {
            (ToolKind::Shell, Some(command), _) => format!("Would run: {command}"),
            (_, _, Some(path)) if arguments.get("content").is_some() => {
                format!("Would write to {path}")
            }
            _ => format!("Would run {tool}"),
        };
        self.redact(&summary)
    }

    pub fn check_path(&self, path: &str, working_dir: &Path) -> Result<(), PolicyError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            working_dir.join(candidate)
        };
        if normalize(&joined).starts_with(normalize(working_dir)) {
            Ok(())
        } else {
            Err(PolicyError::PathOutsideWorkspace(path.to_string()))
        }
    }

    /// Allowlist entries match as leading tokens, case-insensitively.
    pub fn check_command(&self, cmd: &str, allowlist: &[String]) -> Result<(), PolicyError> {
        let lowered = cmd.to_lowercase();
        let cmd_tokens: Vec<&str> = lowered.split_whitespace().collect();
        let Some(program) = cmd_tokens.first() else {
            return Err(PolicyError::CommandNotAllowed(String::new()));
        };
        for allowed in allowlist {
            let allowed = allowed.to_lowercase();
            let allowed_tokens: Vec<&str> = allowed.split_whitespace().collect();
            if allowed_tokens.is_empty() {
                continue;
            }
            if cmd_tokens.len() >= allowed_tokens.len()
                && cmd_tokens[..allowed_tokens.len()] == allowed_tokens[..]
            {
                return Ok(());
            }
        }
        Err(PolicyError::CommandNotAllowed((*program).to_string()))
    }

    /// Masks credentials. Applying it twice changes nothing further.
    pub fn redact(&self, text: &str) -> String {
        let out = self.secret_regex.replace_all(text, "$1=REDACTED");
        let out = self.api_key_regex.replace_all(&out, "[REDACTED_KEY]");
        self.bearer_regex
            .replace_all(&out, "Bearer REDACTED")
            .to_string()
    }

    /// Replaces absolute file paths with `[path]/<file name>`.
    pub fn strip_paths(&self, text: &str) -> String {
        let keep_name = |caps: &Captures<'_>| {
            let name = caps[2]
                .trim_end_matches(['/', '\\'])
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or_default()
                .to_string();
            format!("{}[path]/{}", &caps[1], name)
        };
        let out = self.unix_path_regex.replace_all(text, keep_name);
        self.windows_path_regex
            .replace_all(&out, keep_name)
            .to_string()
    }

    /// Credential and path scrubbing applied to exported documents.
    pub fn scrub_for_export(&self, text: &str) -> String {
        self.strip_paths(&self.redact(text))
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn string_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `command` plus an optional `args` array, space separated.
fn command_line(arguments: &Value) -> Option<String> {
    let command = string_arg(arguments, "command")?;
    let extra: Vec<&str> = arguments
        .get("args")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if extra.is_empty() {
        Some(command.to_string())
    } else {
        Some(format!("{command} {}", extra.join(" ")))
    }
}

fn is_external_url(target: &str) -> bool {
    let lowered = target.to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
