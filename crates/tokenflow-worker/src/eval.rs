//! Eval rule selection.
//!
//! After every tool invocation the task's `eval` list is walked in order:
//! the first rule whose `expr` is true wins, an `else` arm catches the rest,
//! and with no match at all the outcome status picks the implicit default
//! (success continues, error fails).

use serde_json::{Map, Value};
use tracing::warn;

use tokenflow_core::{EvalEntry, EvalRule, Outcome, TemplateRenderer};

/// The selected rule plus whether it was written by the author or implied.
#[derive(Debug, Clone)]
pub struct Decision {
    pub rule: EvalRule,
    pub explicit: bool,
}

/// Pick the rule governing this outcome.
///
/// An expression that fails to evaluate counts as not matching; the walk
/// continues, so a broken guard can never accidentally fire a directive.
pub fn decide(
    renderer: &TemplateRenderer,
    entries: &[EvalEntry],
    scope: &Map<String, Value>,
    outcome: &Outcome,
) -> Decision {
    let mut fallback: Option<&EvalRule> = None;

    for entry in entries {
        match entry {
            EvalEntry::Else { rule } => {
                fallback = Some(rule);
            }
            EvalEntry::Rule(rule) => {
                let matched = match &rule.expr {
                    None => true,
                    Some(expr) => match renderer.evaluate_condition(expr, scope) {
                        Ok(matched) => matched,
                        Err(err) => {
                            warn!(expr = %expr, %err, "eval expression failed, treating as no match");
                            false
                        }
                    },
                };
                if matched {
                    return Decision {
                        rule: rule.clone(),
                        explicit: true,
                    };
                }
            }
        }
    }

    if let Some(rule) = fallback {
        return Decision {
            rule: rule.clone(),
            explicit: true,
        };
    }

    Decision {
        rule: if outcome.is_success() {
            EvalRule::default_continue()
        } else {
            EvalRule::default_fail()
        },
        explicit: false,
    }
}
