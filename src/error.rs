//! Error Types
//!
//! A single error enum covers rule definition, registry composition and
//! run orchestration. Definition errors always carry the rule name so the
//! user can find the offending directive.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A directive value is malformed or not allowed on this rule.
    #[error("Error in rule '{rule}' ({directive}): {message}")]
    RuleDefinition {
        rule: String,
        directive: String,
        message: String,
    },

    #[error("The name '{name}' is already used by another rule")]
    DuplicateRule { name: String },

    #[error("{context}: rule '{name}' is not defined")]
    UnknownRule { name: String, context: String },

    #[error("There are no rules in the workflow")]
    NoRules,

    #[error("Invalid 'use rule' statement: {0}")]
    InvalidUseRule(String),

    #[error(
        "Directory cannot be locked ({path}). Another process holds the lock; \
         if it died unexpectedly, remove the lock with --unlock"
    )]
    LockConflict { path: PathBuf },

    #[error(
        "Dependency resolution disabled (--nodeps) but missing input files detected:\n{}",
        files.join("\n")
    )]
    MissingDependency { files: Vec<String> },

    #[error("Incompatible execution mode: {0}")]
    IncompatibleMode(String),

    #[error("Environment variable error: {0}")]
    EnvironmentVariable(String),

    /// Generic workflow-level failure, optionally tied to a rule.
    #[error("{}{message}", rule.as_ref().map(|r| format!("Error in rule '{}': ", r)).unwrap_or_default())]
    Workflow {
        rule: Option<String>,
        message: String,
    },

    #[error("Rules {rules:?} are ambiguous for the file '{file}'. Consider a ruleorder or priority.")]
    AmbiguousRule { file: String, rules: Vec<String> },

    #[error("Missing input files for rule '{rule}': {}", files.join(", "))]
    MissingInput { rule: String, files: Vec<String> },

    #[error("No rule to produce '{0}' (and the file does not exist)")]
    MissingRuleForTarget(String),

    #[error("Cyclic dependency detected for '{0}'")]
    CyclicDependency(String),

    #[error("Job '{job}' failed: {message}")]
    Job { job: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn rule_definition(
        rule: impl Into<String>,
        directive: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RuleDefinition {
            rule: rule.into(),
            directive: directive.into(),
            message: message.into(),
        }
    }

    pub fn workflow(message: impl Into<String>) -> Self {
        Self::Workflow {
            rule: None,
            message: message.into(),
        }
    }

    pub fn workflow_in_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Workflow {
            rule: Some(rule.into()),
            message: message.into(),
        }
    }

    pub fn unknown_rule(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownRule {
            name: name.into(),
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_definition_display() {
        let err = Error::rule_definition("align", "threads", "must be an integer");
        let text = err.to_string();
        assert!(text.contains("align"));
        assert!(text.contains("threads"));
        assert!(text.contains("must be an integer"));
    }

    #[test]
    fn test_workflow_error_with_and_without_rule() {
        assert_eq!(Error::workflow("boom").to_string(), "boom");
        assert_eq!(
            Error::workflow_in_rule("a", "boom").to_string(),
            "Error in rule 'a': boom"
        );
    }

    #[test]
    fn test_missing_dependency_lists_files() {
        let err = Error::MissingDependency {
            files: vec!["a.txt".to_string(), "b.txt".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("a.txt\nb.txt"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
