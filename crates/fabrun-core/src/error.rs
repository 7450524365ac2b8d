//! Errors raised while executing a task run.

use std::fmt;

use thiserror::Error;

use crate::result::{ResultCode, TaskResult};

/// Raised when a task run hits a condition serious enough to end the run:
/// the wrapper could not be located or started, the startup script could not
/// be written, or the results file could not be read.
///
/// The summary reported to the Control Center is the display form of this
/// error, so causes are folded into the message at construction time.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskRunError {
    message: String,
}

impl TaskRunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Create an error whose message carries the underlying cause.
    pub fn with_source(message: impl Into<String>, source: impl fmt::Display) -> Self {
        Self {
            message: format!("{}: {}", message.into(), source),
        }
    }

    /// Convert into a reportable result with code `error`.
    pub fn to_result(&self) -> TaskResult {
        TaskResult::new(ResultCode::Error, Some(self.to_string()))
    }

    /// Convert into a result that suppresses reporting to the Control Center.
    pub fn to_ignored_result(&self) -> TaskResult {
        TaskResult::new(ResultCode::Ignore, Some(self.to_string()))
    }
}

/// Outcome of driving a run to completion: either the run was aborted on
/// request of the Control Center, or it failed on its own.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error("Aborted by request of the Control Center")]
    Aborted,

    #[error(transparent)]
    Task(#[from] TaskRunError),
}

impl RunError {
    /// Convert into the result reported for the run.
    pub fn to_result(&self) -> TaskResult {
        match self {
            RunError::Aborted => TaskResult::new(ResultCode::Error, Some(self.to_string())),
            RunError::Task(e) => e.to_result(),
        }
    }
}
