//! Test error types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Expected/actual pair carried by assertion failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionCause {
    pub expected: String,
    pub actual: String,
    pub not: bool,
}

impl AssertionCause {
    pub fn new(expected: impl Into<String>, actual: impl Into<String>, not: bool) -> Self {
        Self {
            expected: expected.into(),
            actual: actual.into(),
            not,
        }
    }
}

/// Test error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TestError {
    pub kind: TestErrorKind,
    pub message: String,
    pub cause: Option<AssertionCause>,
}

impl TestError {
    pub fn new(kind: TestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: AssertionCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Configuration, message)
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Assertion, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Timeout, message)
    }

    pub fn cleanup(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Cleanup, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TestErrorKind::Cancelled, message)
    }

    /// Prefix the message with a step tag, as reported to test output
    #[must_use]
    pub fn tagged(mut self, step_tag: &str) -> Self {
        if !step_tag.is_empty() {
            self.message = format!("{step_tag}: {}", self.message);
        }
        self
    }

    /// Structured context for downstream reporting: `{"cause": {...}}`
    pub fn context(&self) -> Option<Value> {
        self.cause.as_ref().map(|cause| json!({ "cause": cause }))
    }
}

/// Error classification for retry and propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestErrorKind {
    /// Malformed template, wrong argument count, unknown mode - never retried
    Configuration,
    /// Expected condition not met - never retried
    Assertion,
    /// Request could not complete - retryable
    Transport,
    /// Poll, debounce or wait window elapsed with nothing qualifying
    Timeout,
    /// Stop-phase failure, logged only
    Cleanup,
    /// Test case aborted from outside
    Cancelled,
}

impl TestErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport)
    }

    /// Transport failures that survive retries take the whole session down
    pub fn aborts_session(self) -> bool {
        matches!(self, Self::Transport | Self::Cancelled)
    }
}

pub type TestResult<T> = Result<T, TestError>;
