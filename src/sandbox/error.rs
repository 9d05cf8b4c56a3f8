//! Sandbox error types

use serde::Serialize;

/// Terminal outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    SecurityViolation,
    SyntaxError,
    ResourceExceeded,
    RuntimeError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SecurityViolation => "security_violation",
            Self::SyntaxError => "syntax_error",
            Self::ResourceExceeded => "resource_exceeded",
            Self::RuntimeError => "runtime_error",
        }
    }
}

/// Everything that can stop submitted code. None of these escape the
/// execution boundary: each becomes an `ExecutionRecord`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("syntax error at line {line}, column {col}: {message}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("security violation: {0}")]
    Security(String),

    #[error("unknown function: '{0}'")]
    UnknownFunction(String),

    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl SandboxError {
    pub fn syntax(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            col,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Syntax { .. } => ExecutionStatus::SyntaxError,
            // Only registry names are legal call targets
            Self::Security(_) | Self::UnknownFunction(_) => ExecutionStatus::SecurityViolation,
            Self::ResourceExceeded(_) => ExecutionStatus::ResourceExceeded,
            Self::Runtime(_) => ExecutionStatus::RuntimeError,
        }
    }
}

/// Result type alias for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;
