//! Advisory step list the model keeps up to date through two agent tools.

use deskwork_core::{PlanEvent, ToolCall, ToolDefinition};
use serde_json::{Value, json};
use std::sync::Mutex;

pub const SET_PLAN_TOOL: &str = "set_plan";
pub const COMPLETE_STEP_TOOL: &str = "complete_step";

pub fn is_plan_tool(name: &str) -> bool {
    name == SET_PLAN_TOOL || name == COMPLETE_STEP_TOOL
}

/// Clamps a cursor into `0..=len`.
pub fn clamp_step(index: i64, len: usize) -> usize {
    if index <= 0 {
        0
    } else {
        (index as u64).min(len as u64) as usize
    }
}

#[derive(Default)]
pub struct PlanTracker {
    plan: Mutex<PlanEvent>,
}

impl PlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> PlanEvent {
        self.plan.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the plan wholesale.
    pub fn replace(&self, steps: Vec<String>, current_step: i64) -> PlanEvent {
        let current_step = clamp_step(current_step, steps.len());
        let next = PlanEvent {
            steps,
            current_step,
        };
        *self.plan.lock().unwrap_or_else(|e| e.into_inner()) = next.clone();
        next
    }

    /// Moves the cursor just past `index`.
    pub fn complete_step(&self, index: i64) -> PlanEvent {
        let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
        plan.current_step = clamp_step(index.saturating_add(1), plan.steps.len());
        plan.clone()
    }

    /// Applies a `set_plan` / `complete_step` call. The error string goes
    /// back to the model as the tool result.
    pub fn apply(&self, call: &ToolCall) -> Result<PlanEvent, String> {
        match call.name.as_str() {
            SET_PLAN_TOOL => {
                let steps = call
                    .arguments
                    .get("steps")
                    .and_then(Value::as_array)
                    .ok_or_else(|| "set_plan requires a 'steps' array".to_string())?
                    .iter()
                    .map(|step| match step {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                Ok(self.replace(steps, int_arg(&call.arguments, "current_step")))
            }
            COMPLETE_STEP_TOOL => {
                if call.arguments.get("step_index").is_none() {
                    return Err("complete_step requires 'step_index'".to_string());
                }
                Ok(self.complete_step(int_arg(&call.arguments, "step_index")))
            }
            other => Err(format!("not a plan tool: {other}")),
        }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                SET_PLAN_TOOL,
                "Replace the task plan shown to the user with an ordered list of steps.",
                json!({
                    "type": "object",
                    "properties": {
                        "steps": {"type": "array", "items": {"type": "string"}},
                        "current_step": {"type": "integer"}
                    },
                    "required": ["steps"]
                }),
            ),
            ToolDefinition::function(
                COMPLETE_STEP_TOOL,
                "Mark a plan step as finished.",
                json!({
                    "type": "object",
                    "properties": {"step_index": {"type": "integer"}},
                    "required": ["step_index"]
                }),
            ),
        ]
    }
}

pub fn plan_summary(plan: &PlanEvent) -> String {
    format!(
        "Plan updated: {} steps, current step {}",
        plan.steps.len(),
        plan.current_step
    )
}

fn int_arg(args: &Value, key: &str) -> i64 {
    match args.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(i64::MAX),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "p1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn set_plan_replaces_and_clamps() {
        let tracker = PlanTracker::new();
        let plan = tracker
            .apply(&call(SET_PLAN_TOOL, json!({"steps": ["read", "write"], "current_step": 7})))
            .expect("plan");
        assert_eq!(plan.current_step, 2);

        let plan = tracker
            .apply(&call(SET_PLAN_TOOL, json!({"steps": ["only"], "current_step": -3})))
            .expect("plan");
        assert_eq!(plan, PlanEvent {
            steps: vec!["only".to_string()],
            current_step: 0
        });
        assert_eq!(tracker.current(), plan);
    }

    #[test]
    fn complete_step_moves_cursor_past_index() {
        let tracker = PlanTracker::new();
        tracker.replace(vec!["a".into(), "b".into(), "c".into()], 0);
        assert_eq!(tracker.complete_step(0).current_step, 1);
        assert_eq!(tracker.complete_step(2).current_step, 3);
        assert_eq!(tracker.complete_step(99).current_step, 3);
    }

    #[test]
    fn malformed_plan_calls_are_reported_not_applied() {
        let tracker = PlanTracker::new();
        tracker.replace(vec!["keep".into()], 0);
        assert!(tracker.apply(&call(SET_PLAN_TOOL, json!({"steps": "nope"}))).is_err());
        assert!(tracker.apply(&call(COMPLETE_STEP_TOOL, json!({}))).is_err());
        assert_eq!(tracker.current().steps, ["keep"]);
    }

    proptest! {
        #[test]
        fn cursor_always_within_bounds(len in 0usize..20, index in any::<i64>()) {
            let tracker = PlanTracker::new();
            let steps: Vec<String> = (0..len).map(|i| format!("step {i}")).collect();
            let plan = tracker.replace(steps, index);
            prop_assert!(plan.current_step <= len);
            let plan = tracker.complete_step(index);
            prop_assert!(plan.current_step <= len);
        }
    }
}
