//! Playbook parsing and structural validation.
//!
//! Validation failures reject the submission before any execution state is
//! created; they are fatal and never retried.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::playbook::types::{
    Directive, EvalEntry, Playbook, DEFAULT_TOOL_KINDS, START_STEP,
};

/// Parse a playbook from YAML and validate its structure.
pub fn parse_playbook(yaml: &str) -> EngineResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml)?;
    validate_playbook(&playbook)?;
    Ok(playbook)
}

/// Validate an already-parsed playbook.
pub fn validate_playbook(playbook: &Playbook) -> EngineResult<()> {
    if playbook.kind != "Playbook" {
        return Err(EngineError::SchemaViolation(format!(
            "kind must be 'Playbook', got '{}'",
            playbook.kind
        )));
    }
    if playbook.api_version.is_empty() {
        return Err(EngineError::SchemaViolation("apiVersion is required".into()));
    }
    if playbook.metadata.name.is_empty() {
        return Err(EngineError::SchemaViolation(
            "metadata.name is required".into(),
        ));
    }

    // Mutable state may not be declared at the document root; ctx exists
    // only through recorded patches.
    if let Some(key) = playbook.extra.keys().next() {
        return Err(EngineError::SchemaViolation(format!(
            "unknown root-level field '{}' (mutable root state is not allowed)",
            key
        )));
    }

    if let Some(workload) = playbook_workload(playbook) {
        if !workload.is_object() && !workload.is_null() {
            return Err(EngineError::SchemaViolation(
                "workload must be an object".into(),
            ));
        }
    }

    if playbook.workflow.is_empty() {
        return Err(EngineError::SchemaViolation(
            "workflow must contain at least one step".into(),
        ));
    }

    let mut names = HashSet::new();
    for step in &playbook.workflow {
        if step.step.is_empty() {
            return Err(EngineError::SchemaViolation(
                "every step needs a non-empty name".into(),
            ));
        }
        if !names.insert(step.step.as_str()) {
            return Err(EngineError::SchemaViolation(format!(
                "duplicate step name '{}'",
                step.step
            )));
        }
    }
    if !names.contains(START_STEP) {
        return Err(EngineError::SchemaViolation(format!(
            "workflow must contain a '{}' step",
            START_STEP
        )));
    }

    let mut allowed_kinds: HashSet<&str> = DEFAULT_TOOL_KINDS.iter().copied().collect();
    for kind in &playbook.executor.allow_kinds {
        allowed_kinds.insert(kind.as_str());
    }

    for step in &playbook.workflow {
        // A step with nothing to run and nowhere to route is dead weight.
        if step.tool.is_none() && step.next.is_empty() {
            return Err(EngineError::SchemaViolation(format!(
                "step '{}' must declare a tool pipeline or at least one next arc",
                step.step
            )));
        }

        for arc in step.arcs() {
            if !names.contains(arc.step.as_str()) {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}': next references unknown step '{}'",
                    step.step, arc.step
                )));
            }
        }

        if let Some(loop_def) = &step.loop_def {
            if loop_def.collection.trim().is_empty() {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}': loop.in must be a non-empty expression",
                    step.step
                )));
            }
            if loop_def.iterator.trim().is_empty() {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}': loop.iterator must be a non-empty name",
                    step.step
                )));
            }
            if loop_def.spec.max_in_flight == Some(0) {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}': loop.spec.max_in_flight must be positive",
                    step.step
                )));
            }
        }

        let tasks = step.pipeline()?;
        let mut labels = HashSet::new();
        for task in &tasks {
            if !labels.insert(task.label.as_str()) {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}': duplicate task label '{}'",
                    step.step, task.label
                )));
            }
            if !allowed_kinds.contains(task.kind.as_str()) {
                return Err(EngineError::SchemaViolation(format!(
                    "step '{}', task '{}': unknown tool kind '{}'",
                    step.step, task.label, task.kind
                )));
            }
        }
        // Jump targets are static labels, checked up front.
        for task in &tasks {
            for entry in &task.eval {
                let rule = match entry {
                    EvalEntry::Rule(rule) => rule,
                    EvalEntry::Else { rule } => rule,
                };
                if rule.directive == Directive::Jump {
                    match &rule.to {
                        None => {
                            return Err(EngineError::SchemaViolation(format!(
                                "step '{}', task '{}': jump requires 'to'",
                                step.step, task.label
                            )))
                        }
                        Some(to) if !labels.contains(to.as_str()) => {
                            return Err(EngineError::UnknownJumpTarget(to.clone()));
                        }
                        Some(_) => {}
                    }
                }
                if rule.attempts == Some(0) {
                    return Err(EngineError::SchemaViolation(format!(
                        "step '{}', task '{}': attempts must be at least 1",
                        step.step, task.label
                    )));
                }
            }
        }
    }

    Ok(())
}

fn playbook_workload(playbook: &Playbook) -> Option<&serde_json::Value> {
    if playbook.workload.is_null() {
        None
    } else {
        Some(&playbook.workload)
    }
}
