//! Tool registry: maps tool names to executable capabilities.
//!
//! The registry is a pure lookup and dispatch table. Whether a call may run
//! is decided elsewhere; a capability only declares its sensitivity, its
//! coarse kind and whether it mutates the machine.

pub mod skills;
pub mod validation;

use deskwork_core::{MessageContent, Sensitivity, ToolDefinition, ToolKind};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub use skills::{SkillSet, default_skills};
pub use validation::validate_arguments;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("tool disabled: {0}")]
    Disabled(String),
}

/// A named, executable tool.
///
/// Execution time is bounded only by the implementation itself; callers
/// never time a capability out.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn sensitivity(&self) -> Sensitivity;

    fn kind(&self) -> ToolKind;

    /// JSON schema of the accepted arguments.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// Whether running the tool changes files, processes or input state.
    fn mutating(&self) -> bool {
        self.sensitivity() == Sensitivity::Sensitive
    }

    fn execute(&self, arguments: &Value, working_dir: &Path) -> Result<MessageContent, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(self.name(), self.description(), self.parameters())
    }
}

type ToolFn = dyn Fn(&Value, &Path) -> Result<MessageContent, ToolError> + Send + Sync;

/// Closure-backed capability for hosts that wire tools at startup.
pub struct FnTool {
    name: String,
    description: String,
    sensitivity: Sensitivity,
    kind: ToolKind,
    mutating: bool,
    parameters: Value,
    run: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: &str, sensitivity: Sensitivity, kind: ToolKind, run: F) -> Self
    where
        F: Fn(&Value, &Path) -> Result<MessageContent, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: format!("Run {name}"),
            sensitivity,
            kind,
            mutating: sensitivity == Sensitivity::Sensitive,
            parameters: json!({"type": "object", "properties": {}}),
            run: Box::new(run),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_mutating(mut self, mutating: bool) -> Self {
        self.mutating = mutating;
        self
    }
}

impl Capability for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    fn mutating(&self) -> bool {
        self.mutating
    }

    fn execute(&self, arguments: &Value, working_dir: &Path) -> Result<MessageContent, ToolError> {
        (self.run)(arguments, working_dir)
    }
}

/// Process-wide tool table. Read-only once built, so it is shared behind an `Arc`.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<dyn Capability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability, replacing any previous one with the same name.
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, capability);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Schemas of every tool not switched off, in registration order.
    pub fn definitions(&self, disabled: &HashSet<String>) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter(|name| !disabled.contains(*name))
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Validates arguments against the tool's schema, then runs it.
    pub fn execute(
        &self,
        capability: &dyn Capability,
        arguments: &Value,
        working_dir: &Path,
    ) -> Result<MessageContent, ToolError> {
        validate_arguments(&capability.parameters(), arguments)
            .map_err(ToolError::InvalidArguments)?;
        capability.execute(arguments, working_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(name: &str, sensitivity: Sensitivity) -> FnTool {
        FnTool::new(name, sensitivity, ToolKind::System, |args, _| {
            Ok(MessageContent::text(args.to_string()))
        })
    }

    #[test]
    fn resolve_returns_registered_capability() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("list_dir", Sensitivity::Safe));
        let tool = registry.resolve("list_dir").expect("registered");
        assert_eq!(tool.sensitivity(), Sensitivity::Safe);
        assert!(!tool.mutating());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn re_registering_replaces_without_reordering() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("a", Sensitivity::Safe));
        registry.register(echo("b", Sensitivity::Safe));
        registry.register(echo("a", Sensitivity::Sensitive));
        assert_eq!(registry.names(), ["a", "b"]);
        assert_eq!(
            registry.resolve("a").expect("a").sensitivity(),
            Sensitivity::Sensitive
        );
    }

    #[test]
    fn definitions_skip_disabled_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("read_file", Sensitivity::Safe));
        registry.register(echo("execute_command", Sensitivity::Sensitive));
        let disabled: HashSet<String> = ["execute_command".to_string()].into_iter().collect();
        let defs = registry.definitions(&disabled);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "read_file");
        assert_eq!(defs[0].tool_type, "function");
    }

    #[test]
    fn execute_rejects_arguments_that_miss_the_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(
            echo("read_file", Sensitivity::Safe).with_parameters(json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })),
        );
        let tool = registry.resolve("read_file").expect("registered");
        let err = registry
            .execute(tool.as_ref(), &json!({}), Path::new("."))
            .expect_err("missing path");
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let ok = registry
            .execute(tool.as_ref(), &json!({"path": "a.txt"}), Path::new("."))
            .expect("valid");
        assert!(ok.as_text().contains("a.txt"));
    }

    #[test]
    fn fn_tool_receives_working_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let tool = FnTool::new("pwd", Sensitivity::Safe, ToolKind::Shell, |_, dir| {
            Ok(MessageContent::text(dir.display().to_string()))
        });
        let out = tool.execute(&json!({}), tmp.path()).expect("run");
        assert_eq!(out.as_text(), tmp.path().display().to_string());
    }
}
