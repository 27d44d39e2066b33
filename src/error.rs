//! Relab error types
//!
//! One enum for the whole library. Node-local failures (workspace setup,
//! execution) are handled inside the run loop by marking the node FAIL;
//! variants here surface everything that must abort a command instead.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelabError>;

/// Trait for errors that can provide fix suggestions
pub trait FixSuggestion {
    /// Get a fix suggestion for this error, if available
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum RelabError {
    /// A node was given both a command and code, or neither
    #[error("node '{description}': command and code are mutually exclusive")]
    CommandCodeConflict { description: String },

    /// The current directory is not inside a git repository
    #[error("not inside a git repository: {details}")]
    NoRepository { details: String },

    /// A git invocation failed
    #[error("git {operation} failed: {details}")]
    Git { operation: String, details: String },

    /// A persisted descriptor exists but cannot be parsed.
    ///
    /// Never folded into "absent": a corrupt store must be surfaced, not
    /// silently re-run over.
    #[error("corrupt descriptor for {hsh}: {source}")]
    CorruptDescriptor {
        hsh: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A `{...}` reference did not match any candidate
    #[error("could not match '{reference}'. Did you specify it as a dependency?")]
    UnmatchedReference { reference: String },

    /// A `[...]` or `{:...}` reference named an undeclared parameter
    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },

    /// The scratch workspace could not be prepared for a launch
    #[error("workspace error at {}: {details}", .path.display())]
    Workspace { path: PathBuf, details: String },

    /// A macro call failed to parse or evaluate
    #[error("macro error: {details}")]
    Macro { details: String },

    /// A task file failed to parse
    #[error("{file}:{line}: {details}")]
    TaskFile {
        file: String,
        line: usize,
        details: String,
    },

    /// A stored task id does not exist
    #[error("could not access task {task_id}")]
    TaskNotFound { task_id: String },

    /// No stored experiment matches a query argument
    #[error("no experiment matches '{query}'")]
    NoMatch { query: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FixSuggestion for RelabError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            RelabError::CommandCodeConflict { .. } => {
                Some("Give each node either a shell command or an @macro, not both")
            }
            RelabError::NoRepository { .. } => {
                Some("Run relab from inside a git working copy (results live at its root)")
            }
            RelabError::Git { .. } => {
                Some("Check that the commit expression resolves: git rev-parse <expr>")
            }
            RelabError::CorruptDescriptor { .. } => {
                Some("Inspect results/<hsh>/descr by hand, or purge the hash and re-run")
            }
            RelabError::UnmatchedReference { .. } => {
                Some("Declare the referenced experiment as a dependency of this one")
            }
            RelabError::UnknownParameter { .. } => {
                Some("Declare the parameter with --params name:value or a k = v line")
            }
            RelabError::Macro { .. } => {
                Some("Known macros: output_list, annotated_list, parameter_map, all_map, percentiles")
            }
            RelabError::TaskFile { .. } => {
                Some("Each group is: command, tab + \"description\", then optional commit/params/deps lines")
            }
            RelabError::TaskNotFound { .. } => Some("List archived tasks under .exp/tasks/"),
            RelabError::NoMatch { .. } => Some("Use `relab list` to see stored experiments"),
            RelabError::Workspace { .. } | RelabError::Io(_) | RelabError::Yaml(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_reference() {
        let err = RelabError::UnmatchedReference {
            reference: "trainer".into(),
        };
        assert!(err.to_string().contains("trainer"));
    }

    #[test]
    fn corrupt_descriptor_is_not_absent() {
        let bad: serde_yaml::Error = serde_yaml::from_str::<u32>("[oops").unwrap_err();
        let err = RelabError::CorruptDescriptor {
            hsh: "abc123".into(),
            source: bad,
        };
        assert!(err.to_string().contains("abc123"));
        assert!(err.fix_suggestion().is_some());
    }

    #[test]
    fn fatal_variants_have_suggestions() {
        let errors = vec![
            RelabError::CommandCodeConflict {
                description: "x".into(),
            },
            RelabError::NoRepository { details: "x".into() },
            RelabError::UnmatchedReference {
                reference: "x".into(),
            },
            RelabError::UnknownParameter { name: "x".into() },
            RelabError::Macro { details: "x".into() },
            RelabError::NoMatch { query: "x".into() },
        ];
        for error in errors {
            assert!(
                error.fix_suggestion().is_some(),
                "missing fix suggestion for: {:?}",
                error
            );
        }
    }
}
