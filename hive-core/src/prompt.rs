//! System-prompt composition.
//!
//! Node prompts layer three parts: a static identity (agent-level), a
//! deterministic narrative of what has happened so far (execution path +
//! shared-state keys, no LLM cost), and the node's own focus directive.
//! A datetime stamp closes the prompt so the model knows "now".

use chrono::Utc;
use serde_json::Value;

use crate::state::StateSnapshot;

const NARRATIVE_VALUE_LIMIT: usize = 200;

fn with_datetime(prompt: &str) -> String {
    let stamp = format!(
        "Current date and time: {}",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    );
    if prompt.is_empty() {
        stamp
    } else {
        format!("{prompt}\n\n{stamp}")
    }
}

/// Compose the layered system prompt for one node iteration.
pub fn compose_system_prompt(
    identity: Option<&str>,
    narrative: Option<&str>,
    focus: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(identity) = identity.filter(|s| !s.is_empty()) {
        parts.push(identity.to_string());
    }
    if let Some(narrative) = narrative.filter(|s| !s.is_empty()) {
        parts.push(format!(
            "--- Context (what has happened so far) ---\n{narrative}"
        ));
    }
    if let Some(focus) = focus.filter(|s| !s.is_empty()) {
        parts.push(format!("--- Current Focus ---\n{focus}"));
    }

    with_datetime(&parts.join("\n\n"))
}

fn truncate_value(value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.len() > NARRATIVE_VALUE_LIMIT {
        let mut cut = NARRATIVE_VALUE_LIMIT;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &rendered[..cut])
    } else {
        rendered
    }
}

/// Build the narrative layer from structured state. Deterministic, cheap.
pub fn build_narrative(execution_path: &[String], state: &StateSnapshot) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !execution_path.is_empty() {
        let phases: Vec<String> = execution_path
            .iter()
            .map(|node| format!("- {node}"))
            .collect();
        parts.push(format!("Phases completed:\n{}", phases.join("\n")));
    }

    if !state.is_empty() {
        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .iter()
            .filter(|key| !state[key.as_str()].is_null())
            .map(|key| format!("- {key}: {}", truncate_value(&state[key.as_str()])))
            .collect();
        if !lines.is_empty() {
            parts.push(format!("Current state:\n{}", lines.join("\n")));
        }
    }

    parts.join("\n\n")
}

/// Render a node's declared inputs as a prompt block. Unset keys are
/// listed as such so the model does not hallucinate values for them.
pub fn render_inputs(inputs: &[(String, Option<Value>)]) -> String {
    if inputs.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = inputs
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("- {key}: {}", truncate_value(value)),
            None => format!("- {key}: (unset)"),
        })
        .collect();
    format!("Inputs:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn layers_compose_in_order() {
        let prompt = compose_system_prompt(
            Some("You are a research agent."),
            Some("- scoped the project"),
            Some("Synthesize findings."),
        );
        let identity_at = prompt.find("research agent").unwrap();
        let context_at = prompt.find("--- Context").unwrap();
        let focus_at = prompt.find("--- Current Focus").unwrap();
        assert!(identity_at < context_at && context_at < focus_at);
        assert!(prompt.contains("Current date and time:"));
    }

    #[test]
    fn empty_layers_are_skipped() {
        let prompt = compose_system_prompt(None, None, Some("Focus."));
        assert!(!prompt.contains("--- Context"));
        assert!(prompt.contains("--- Current Focus"));
    }

    #[test]
    fn narrative_truncates_long_values() {
        let mut state = StateSnapshot::default();
        state.insert("blob".to_string(), json!("x".repeat(500)));
        let narrative = build_narrative(&["collect".to_string()], &state);
        assert!(narrative.contains("Phases completed"));
        assert!(narrative.contains("..."));
        assert!(narrative.len() < 500);
    }

    #[test]
    fn unset_inputs_are_marked() {
        let rendered = render_inputs(&[
            ("query".to_string(), Some(json!("rust"))),
            ("cursor".to_string(), None),
        ]);
        assert!(rendered.contains("- query: rust"));
        assert!(rendered.contains("- cursor: (unset)"));
    }
}
