use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod transcript;

pub use transcript::{TranscriptError, validate_transcript};

pub type Result<T> = anyhow::Result<T>;

pub const SESSION_EXPORT_FORMAT: &str = "deskwork.sessions";
pub const SESSION_EXPORT_VERSION: u32 = 1;

/// Per-user data directory holding the session database, logs and settings.
pub fn data_dir(base: &Path) -> PathBuf {
    base.join(".deskwork")
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    AwaitingApproval,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingModel => write!(f, "awaiting_model"),
            Self::ExecutingTools => write!(f, "executing_tools"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
        }
    }
}

pub fn is_valid_loop_transition(from: LoopState, to: LoopState) -> bool {
    if from == to {
        return true;
    }
    match from {
        LoopState::Idle => matches!(to, LoopState::AwaitingModel),
        LoopState::AwaitingModel => matches!(
            to,
            LoopState::ExecutingTools | LoopState::AwaitingApproval | LoopState::Idle
        ),
        LoopState::ExecutingTools => matches!(
            to,
            LoopState::AwaitingApproval | LoopState::AwaitingModel | LoopState::Idle
        ),
        LoopState::AwaitingApproval => matches!(
            to,
            LoopState::ExecutingTools | LoopState::AwaitingModel | LoopState::Idle
        ),
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Inline image reference, usually a `data:` URL produced by a screenshot tool.
    Image { image_url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Text segments joined with newlines; image parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// How a tool-result message came to be.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    #[default]
    Success,
    Error,
    Denied,
    Expired,
}

impl ToolResultStatus {
    /// Denied and expired results are denial records; the tool never ran.
    pub fn is_denial(self) -> bool {
        matches!(self, Self::Denied | Self::Expired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "user")]
    User { content: MessageContent },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<MessageContent>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: MessageContent,
        #[serde(default)]
        status: ToolResultStatus,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(MessageContent::Text(content.into())),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: content.map(MessageContent::Text),
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<MessageContent>,
        status: ToolResultStatus,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            status,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::User { content } | Self::Tool { content, .. } => content.as_text(),
            Self::Assistant { content, .. } => {
                content.as_ref().map(MessageContent::as_text).unwrap_or_default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub message_count: usize,
}

/// Self-contained export document; sessions inside are already redacted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionExport {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
}

// ---------------------------------------------------------------------------
// Tools and approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Safe,
    Sensitive,
}

/// Coarse category of a tool, used by telemetry and skill grouping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Filesystem,
    Shell,
    Network,
    Input,
    Screen,
    Document,
    System,
    Plan,
    Model,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Filesystem => "filesystem",
            Self::Shell => "shell",
            Self::Network => "network",
            Self::Input => "input",
            Self::Screen => "screen",
            Self::Document => "document",
            Self::System => "system",
            Self::Plan => "plan",
            Self::Model => "model",
        };
        f.write_str(name)
    }
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingApproval {
    pub id: String,
    pub tool: String,
    pub action: String,
    pub reason: String,
    /// Unix epoch milliseconds; zero means the request never expires.
    pub expires_at: u64,
}

impl PendingApproval {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now_ms
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalResolution {
    pub id: String,
    pub status: ApprovalStatus,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ActivityStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEvent {
    pub id: String,
    pub status: ActivityStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEvent {
    pub steps: Vec<String>,
    pub current_step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub tool: String,
    pub status: ActivityStatus,
    pub duration_ms: u64,
    pub kind: ToolKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatStreamEvent {
    pub seq: u64,
    pub token: String,
    pub done: bool,
}

/// Named events delivered to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    Activity(ActivityEvent),
    PlanUpdate(PlanEvent),
    Telemetry(TelemetryEvent),
    ApprovalRequest(PendingApproval),
    ApprovalResolved(ApprovalResolution),
    ChatStream(ChatStreamEvent),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activity(_) => "activity",
            Self::PlanUpdate(_) => "plan_update",
            Self::Telemetry(_) => "telemetry",
            Self::ApprovalRequest(_) => "approval_request",
            Self::ApprovalResolved(_) => "approval_resolved",
            Self::ChatStream(_) => "chat_stream",
        }
    }
}

// ---------------------------------------------------------------------------
// Templates and skills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub title: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Tool names this skill switches on or off.
    #[serde(default)]
    pub tools: Vec<String>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

/// Behaviour flags shared by every session. Credentials never live here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    pub provider: String,
    pub model: String,
    /// Overrides the provider's chat endpoint, e.g. for a local proxy.
    pub api_base: Option<String>,
    pub read_only: bool,
    pub structured_logs: bool,
    pub streaming: bool,
    pub approval_ttl_secs: u64,
    pub max_rounds: u32,
    pub tool_workers: usize,
    pub command_allowlist: Vec<String>,
    pub telemetry: TelemetryConfig,
    pub reduced_motion: bool,
    pub high_contrast: bool,
}

pub const DEFAULT_MAX_ROUNDS: u32 = 10;
pub const DEFAULT_TOOL_WORKERS: usize = 4;
pub const DEFAULT_APPROVAL_TTL_SECS: u64 = 600;

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            read_only: false,
            structured_logs: false,
            streaming: false,
            approval_ttl_secs: DEFAULT_APPROVAL_TTL_SECS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            tool_workers: DEFAULT_TOOL_WORKERS,
            command_allowlist: ["ls", "dir", "pwd", "cat", "type", "echo"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            telemetry: TelemetryConfig::default(),
            reduced_motion: false,
            high_contrast: false,
        }
    }
}

impl AppSettings {
    pub fn user_settings_path() -> Option<PathBuf> {
        home_dir().map(|home| data_dir(&home).join("settings.json"))
    }

    pub fn data_settings_path(data_dir: &Path) -> PathBuf {
        data_dir.join("settings.json")
    }

    /// Defaults, then the user file, then the data-dir file, merged key by key.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        let local = Self::data_settings_path(data_dir);
        if !paths.contains(&local) {
            paths.push(local);
        }
        Self::load_layers(&paths)
    }

    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let path = Self::data_settings_path(data_dir);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid settings path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Zero disables expiry.
    pub fn approval_expiry_from(&self, now_ms: u64) -> u64 {
        if self.approval_ttl_secs == 0 {
            0
        } else {
            now_ms.saturating_add(self.approval_ttl_secs.saturating_mul(1000))
        }
    }
}

pub fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let msg = ChatMessage::assistant_calls(
            None,
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "list_dir".to_string(),
                arguments: json!({"path": "/tmp"}),
            }],
        );
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["id"], "call_1");
        assert!(value.get("content").is_none());

        let back: ChatMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn message_content_accepts_text_or_parts() {
        let plain: MessageContent = serde_json::from_value(json!("hello")).expect("text");
        assert_eq!(plain, MessageContent::text("hello"));

        let parts: MessageContent = serde_json::from_value(json!([
            {"type": "text", "text": "look"},
            {"type": "image", "image_url": "data:image/png;base64,AAAA"}
        ]))
        .expect("parts");
        assert!(parts.has_images());
        assert_eq!(parts.as_text(), "look");
    }

    #[test]
    fn tool_result_status_defaults_to_success() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "tool",
            "tool_call_id": "c1",
            "content": "ok"
        }))
        .expect("deserialize");
        assert!(matches!(
            msg,
            ChatMessage::Tool {
                status: ToolResultStatus::Success,
                ..
            }
        ));
    }

    #[test]
    fn notification_names_match_wire_tags() {
        let event = Notification::ApprovalResolved(ApprovalResolution {
            id: "a1".to_string(),
            status: ApprovalStatus::Expired,
        });
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event"], event.name());
        assert_eq!(value["payload"]["status"], "expired");

        let plan = Notification::PlanUpdate(PlanEvent::default());
        assert_eq!(
            serde_json::to_value(&plan).expect("serialize")["event"],
            "plan_update"
        );
    }

    #[test]
    fn pending_approval_zero_expiry_never_expires() {
        let pending = PendingApproval {
            id: "a".to_string(),
            tool: "delete_file".to_string(),
            action: "Would run delete_file".to_string(),
            reason: "Sensitive action requires explicit approval".to_string(),
            expires_at: 0,
        };
        assert!(!pending.is_expired_at(u64::MAX));
        let timed = PendingApproval {
            expires_at: 10,
            ..pending
        };
        assert!(!timed.is_expired_at(9));
        assert!(timed.is_expired_at(10));
    }

    #[test]
    fn settings_layers_merge_key_by_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        let user = dir.join("user.json");
        let local = dir.join("local.json");
        fs::write(&user, r#"{"read_only": true, "telemetry": {"enabled": true}}"#).expect("user");
        fs::write(
            &local,
            r#"{"max_rounds": 3, "telemetry": {"endpoint": "http://localhost:9"}}"#,
        )
        .expect("local");

        let settings = AppSettings::load_layers(&[user, local, dir.join("missing.json")])
            .expect("load");
        assert!(settings.read_only);
        assert_eq!(settings.max_rounds, 3);
        assert!(settings.telemetry.enabled);
        assert_eq!(
            settings.telemetry.endpoint.as_deref(),
            Some("http://localhost:9")
        );
        assert_eq!(settings.tool_workers, DEFAULT_TOOL_WORKERS);
    }

    #[test]
    fn settings_save_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("data");
        let settings = AppSettings {
            streaming: true,
            approval_ttl_secs: 0,
            ..AppSettings::default()
        };
        settings.save(&dir).expect("save");
        let loaded =
            AppSettings::load_layers(&[AppSettings::data_settings_path(&dir)]).expect("load");
        assert_eq!(loaded, settings);
        assert_eq!(loaded.approval_expiry_from(1_000), 0);
    }

    #[test]
    fn loop_turn_cycle_is_valid() {
        let cycle = [
            LoopState::Idle,
            LoopState::AwaitingModel,
            LoopState::ExecutingTools,
            LoopState::AwaitingApproval,
            LoopState::ExecutingTools,
            LoopState::AwaitingModel,
            LoopState::Idle,
        ];
        for pair in cycle.windows(2) {
            assert!(is_valid_loop_transition(pair[0], pair[1]), "{pair:?}");
        }
        assert!(!is_valid_loop_transition(
            LoopState::Idle,
            LoopState::ExecutingTools
        ));
    }

    proptest! {
        #[test]
        fn merge_json_value_is_idempotent_for_flat_objects(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_json_value(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_json_value(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }

        #[test]
        fn approval_expiry_is_never_before_now(now in 0u64..u64::MAX / 2, ttl in 1u64..100_000) {
            let settings = AppSettings { approval_ttl_secs: ttl, ..AppSettings::default() };
            prop_assert!(settings.approval_expiry_from(now) > now);
        }
    }
}
