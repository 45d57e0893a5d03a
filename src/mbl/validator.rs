use std::collections::HashSet;

use crate::mbl::ast::{Action, TaskDefinition};

/// Static checks over a parsed task. Returns human-readable findings in
/// document order; an empty list means the task may be executed.
pub fn validate(task: &TaskDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if task.steps.is_empty() {
        errors.push("task has no steps".to_string());
    }

    let inputs: HashSet<&str> = task.inputs.iter().map(String::as_str).collect();

    // Extracted names accumulate in document order; names extracted inside
    // an `if` branch count as visible after the block.
    let mut extracted: HashSet<String> = HashSet::new();
    for step in &task.steps {
        check_actions(&step.actions, &inputs, &mut extracted, &mut errors, false);
    }

    // Handlers see everything the main body extracts; extracts inside one
    // handler stay local to that handler.
    for (name, handler) in [("on timeout", &task.on_timeout), ("on error", &task.on_error)] {
        if let Some(handler) = handler {
            let mut handler_extracted = extracted.clone();
            let before = errors.len();
            check_actions(
                &handler.actions,
                &inputs,
                &mut handler_extracted,
                &mut errors,
                false,
            );
            for error in errors.iter_mut().skip(before) {
                *error = format!("{name} handler: {error}");
            }
        }
    }

    errors
}

fn check_actions(
    actions: &[Action],
    inputs: &HashSet<&str>,
    extracted: &mut HashSet<String>,
    errors: &mut Vec<String>,
    inside_if: bool,
) {
    for action in actions {
        match action {
            Action::Extract { variable, .. } => {
                extracted.insert(variable.clone());
            }
            Action::Output { variable } => {
                if !extracted.contains(variable) {
                    errors.push(format!(
                        "output '{variable}' is not preceded by an extract of that name"
                    ));
                }
            }
            Action::Type {
                value,
                is_param: true,
                ..
            }
            | Action::Select {
                value,
                is_param: true,
                ..
            } => {
                if !inputs.contains(value.as_str()) {
                    errors.push(format!("parameter '{value}' is not a declared input"));
                }
            }
            Action::IfScreenShows {
                condition,
                then_actions,
                else_actions,
            } => {
                if inside_if {
                    errors.push(format!(
                        "nested 'if screen shows \"{condition}\"' blocks are not supported"
                    ));
                }
                check_actions(then_actions, inputs, extracted, errors, true);
                if let Some(else_actions) = else_actions {
                    check_actions(else_actions, inputs, extracted, errors, true);
                }
            }
            _ => {}
        }
    }
}
