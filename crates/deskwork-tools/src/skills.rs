//! Toggleable capability groups.
//!
//! A skill lists the tool names it controls. Tools that no skill mentions
//! stay enabled.

use deskwork_core::Skill;
use std::collections::HashSet;

fn skill(id: &str, name: &str, description: &str, tools: &[&str]) -> Skill {
    Skill {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        enabled: true,
        tools: tools.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn default_skills() -> Vec<Skill> {
    vec![
        skill(
            "file_system",
            "File System",
            "Read, write, and manage files.",
            &["read_file", "write_file", "list_dir", "delete_file", "find_file_smart", "search_files"],
        ),
        skill(
            "terminal",
            "Terminal",
            "Execute shell commands.",
            &["execute_command"],
        ),
        skill(
            "browser",
            "Web Browser",
            "Search the web and read pages.",
            &["search_web", "fetch_url"],
        ),
        skill(
            "automation",
            "UI Automation",
            "Control mouse and keyboard.",
            &[
                "mouse_move",
                "mouse_click",
                "keyboard_type",
                "keyboard_press",
                "get_screenshot",
                "wait",
            ],
        ),
        skill(
            "apps",
            "Applications",
            "Launch applications and create documents.",
            &["open_app", "create_docx", "create_slide_deck"],
        ),
        skill(
            "system",
            "System",
            "Check system stats.",
            &["get_system_stats"],
        ),
    ]
}

/// Snapshot of skill toggles used to filter the tool schema.
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    skills: Vec<Skill>,
}

impl SkillSet {
    pub fn new(skills: Vec<Skill>) -> Self {
        Self { skills }
    }

    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    pub fn skill_for_tool(&self, tool: &str) -> Option<&Skill> {
        self.skills
            .iter()
            .find(|skill| skill.tools.iter().any(|t| t == tool))
    }

    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        self.skill_for_tool(tool).is_none_or(|skill| skill.enabled)
    }

    pub fn disabled_tools(&self) -> HashSet<String> {
        self.skills
            .iter()
            .filter(|skill| !skill.enabled)
            .flat_map(|skill| skill.tools.iter().cloned())
            .collect()
    }
}
