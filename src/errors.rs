use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Classifies an error for reporting and exit-code purposes. Kinds in the
/// Config/Schema/Definition/Selection group indicate a problem detected
/// before any step has run (exit code 2); the rest indicate a failure of a
/// run in progress (exit code 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Schema,
    Definition,
    Assignment,
    StepSelection,
    StepValidation,
    ParameterValidation,
    Substitution,
    CyclicSubstitution,
    Unset,
    Parser,
    Formula,
    Backend,
    CabRuntime,
    CabOutput,
    StepExecution,
    Runtime,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Config => "config error",
            ErrorKind::Schema => "schema error",
            ErrorKind::Definition => "definition error",
            ErrorKind::Assignment => "assignment error",
            ErrorKind::StepSelection => "step selection error",
            ErrorKind::StepValidation => "step validation error",
            ErrorKind::ParameterValidation => "parameter validation error",
            ErrorKind::Substitution => "substitution error",
            ErrorKind::CyclicSubstitution => "cyclic substitution",
            ErrorKind::Unset => "unset value",
            ErrorKind::Parser => "formula parse error",
            ErrorKind::Formula => "formula error",
            ErrorKind::Backend => "backend error",
            ErrorKind::CabRuntime => "cab runtime error",
            ErrorKind::CabOutput => "cab output error",
            ErrorKind::StepExecution => "step execution error",
            ErrorKind::Runtime => "runtime error",
        }
    }

    /// True for errors raised before execution begins (config/definition
    /// phase), which map to exit code 2 rather than 1.
    pub fn is_config_phase(self) -> bool {
        matches!(
            self,
            ErrorKind::Config
                | ErrorKind::Schema
                | ErrorKind::Definition
                | ErrorKind::StepSelection
        )
    }
}

fn render_error(message: &str, nested: &[StimelaError]) -> String {
    if nested.is_empty() {
        message.to_string()
    } else {
        let causes: Vec<String> = nested.iter().map(|e| e.to_string()).collect();
        format!("{}: {}", message, causes.join(", "))
    }
}

/// Error type shared by the whole engine. Carries a kind, a message and a
/// list of nested causes, so aggregated failures (e.g. one per parameter, or
/// one per scatter worker) surface every underlying problem.
#[derive(Debug, Error)]
#[error("{}", render_error(.message, .nested))]
pub struct StimelaError {
    pub kind: ErrorKind,
    pub message: String,
    pub nested: Vec<StimelaError>,
    logged: AtomicBool,
}

impl Clone for StimelaError {
    fn clone(&self) -> Self {
        StimelaError {
            kind: self.kind,
            message: self.message.clone(),
            nested: self.nested.clone(),
            logged: AtomicBool::new(self.logged.load(Ordering::Relaxed)),
        }
    }
}

impl StimelaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StimelaError {
            kind,
            message: message.into(),
            nested: Vec::new(),
            logged: AtomicBool::new(false),
        }
    }

    pub fn with_nested(kind: ErrorKind, message: impl Into<String>, nested: Vec<StimelaError>) -> Self {
        StimelaError {
            kind,
            message: message.into(),
            nested,
            logged: AtomicBool::new(false),
        }
    }

    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        StimelaError::with_nested(kind, message, vec![self])
    }

    /// The logged flag prevents the same error being reported at multiple
    /// levels of the recipe tree.
    pub fn logged(&self) -> bool {
        self.logged.load(Ordering::Relaxed)
    }

    pub fn mark_logged(&self) {
        self.logged.store(true, Ordering::Relaxed);
    }

    /// Flattened list of leaf causes, one line each, for summary reporting.
    pub fn cause_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for err in &self.nested {
            if err.nested.is_empty() {
                lines.push(format!("{}: {}", err.kind.label(), err.message));
            } else {
                lines.push(format!("{}: {}", err.kind.label(), err.message));
                for sub in err.cause_lines() {
                    lines.push(format!("  {sub}"));
                }
            }
        }
        lines
    }
}

pub type Result<T> = std::result::Result<T, StimelaError>;

pub fn config_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Config, message)
}

pub fn schema_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Schema, message)
}

pub fn definition_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Definition, message)
}

pub fn subst_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Substitution, message)
}

pub fn unset_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Unset, message)
}

pub fn parser_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Parser, message)
}

pub fn formula_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Formula, message)
}

pub fn param_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::ParameterValidation, message)
}

pub fn backend_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Backend, message)
}

pub fn cab_runtime_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::CabRuntime, message)
}

pub fn assignment_error(message: impl Into<String>) -> StimelaError {
    StimelaError::new(ErrorKind::Assignment, message)
}

pub fn join_quote(values: &[String]) -> String {
    if values.is_empty() {
        String::new()
    } else {
        format!("'{}'", values.join("', '"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_causes_appear_in_message() {
        let inner = param_error("'x' is required");
        let outer = StimelaError::with_nested(
            ErrorKind::ParameterValidation,
            "2 parameters failed validation",
            vec![inner, param_error("'y' is required")],
        );
        let text = outer.to_string();
        assert!(text.contains("2 parameters failed validation"));
        assert!(text.contains("'x' is required"));
        assert!(text.contains("'y' is required"));
    }

    #[test]
    fn logged_flag_sticks() {
        let err = backend_error("no backend available");
        assert!(!err.logged());
        err.mark_logged();
        assert!(err.logged());
    }

    #[test]
    fn config_phase_kinds() {
        assert!(ErrorKind::Config.is_config_phase());
        assert!(ErrorKind::StepSelection.is_config_phase());
        assert!(!ErrorKind::CabRuntime.is_config_phase());
    }

    #[test]
    fn join_quote_formats() {
        assert_eq!(join_quote(&[]), "");
        assert_eq!(
            join_quote(&["a".to_string(), "b".to_string()]),
            "'a', 'b'"
        );
    }
}
