//! Error handling module
//!
//! Provides the error taxonomy shared by every stage of a reconciliation run.
//! None of these errors are retryable: each one carries enough detail
//! (object names, phase index, offending statement) for the caller to act on.

use crate::config::ConfigError;
use crate::model::ObjectKind;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Malformed, unsupported or duplicate DDL in the declared schema
    #[error("Parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// Connectivity, privilege or unsupported-object failure while reading the catalog
    #[error("Introspection error: {message}")]
    Introspection { message: String },

    /// The same canonical name refers to different kinds of object
    #[error("Diff error: {name} is a {desired_kind} in the declared schema but a {live_kind} in the live database")]
    Diff {
        name: String,
        desired_kind: ObjectKind,
        live_kind: ObjectKind,
    },

    #[error("Circular dependency detected, cannot order: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Policy gate: the plan contains destructive operations and they were not allowed
    #[error("Destructive operations blocked ({} total): {}", .operations.len(), describe_blocked(.operations))]
    DestructiveOperationBlocked { operations: Vec<BlockedOperation> },

    /// A statement failed (or was cancelled) while applying a phase; that phase was rolled back
    #[error("Execution failed in phase {phase}{}: {message}", describe_statement(.rank, .statement))]
    Execution {
        phase: usize,
        rank: Option<usize>,
        statement: Option<String>,
        message: String,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(String),
}

/// Filesystem and numbering failures of the migration writer
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Cannot access migration path {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration number {number:04} was claimed concurrently in {}", .dir.display())]
    NumberCollision { number: u32, dir: PathBuf },
}

/// One operation rejected by the destructive-operation gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedOperation {
    pub target: String,
    pub statement: String,
    pub reason: String,
}

impl fmt::Display for BlockedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.target, self.reason)
    }
}

fn describe_blocked(operations: &[BlockedOperation]) -> String {
    operations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_statement(rank: &Option<usize>, statement: &Option<String>) -> String {
    match (rank, statement) {
        (Some(rank), Some(statement)) => format!(", operation {} `{}`", rank, statement),
        (Some(rank), None) => format!(", operation {}", rank),
        _ => String::new(),
    }
}

/// Result type alias used throughout the engine
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Helper function to create an introspection error
pub fn introspection_error(msg: impl Into<String>) -> ReconcileError {
    ReconcileError::Introspection {
        message: msg.into(),
    }
}

/// Helper function to create a parse error at a 1-based line and column
pub fn parse_error(line: usize, column: usize, msg: impl Into<String>) -> ReconcileError {
    ReconcileError::Parse {
        line,
        column,
        message: msg.into(),
    }
}

/// Strip credentials out of database error text before it reaches logs or callers.
///
/// Drivers occasionally echo the connection string back in their messages, so
/// any line mentioning a password is replaced wholesale.
pub fn sanitize_db_error(error: &impl fmt::Display) -> String {
    error
        .to_string()
        .lines()
        .map(|line| {
            if line.to_ascii_lowercase().contains("password") {
                "Database connection failed (credentials redacted)"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
