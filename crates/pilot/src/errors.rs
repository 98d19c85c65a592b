//! Pipeline error taxonomy and exit-code mapping.
//!
//! Every stage has its own error enum; this module aggregates them and
//! assigns each error a class that drives retry behavior and the CLI
//! exit code:
//!
//! | Class       | Retried                         | Exit code |
//! |-------------|---------------------------------|-----------|
//! | Transient   | yes, exponential backoff        | 1         |
//! | RateLimited | yes, after the specified delay  | 1         |
//! | Permanent   | never                           | 2         |
//! | Timeout     | no, its own budget was exhausted| 3         |

use std::time::Duration;

use thiserror::Error;

use crate::activate::ActivateError;
use crate::dns::DnsProviderError;
use crate::issuer::IssueError;
use crate::propagate::PropagateError;
use crate::state::StateError;
use crate::store::StoreError;

/// Failure class. Drives both retry behavior and operator-facing exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with exponential backoff (network blips, API hiccups)
    Transient,
    /// Retry after the delay the remote authority asked for
    RateLimited(Duration),
    /// Retrying cannot help (bad config, auth failure, malformed domain)
    Permanent,
    /// A bounded wait was exhausted; the stage's own budget already retried
    Timeout,
}

impl ErrorClass {
    /// Whether a retry loop should attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimited(_))
    }

    /// Category-coded process exit code: 1 transient, 2 permanent, 3 timeout.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorClass::Transient | ErrorClass::RateLimited(_) => 1,
            ErrorClass::Permanent => 2,
            ErrorClass::Timeout => 3,
        }
    }
}

/// Classification of an error into retry/exit categories.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Any error a pipeline cycle can terminate with.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] certpilot_config::ConfigError),

    #[error(transparent)]
    Dns(#[from] DnsProviderError),

    #[error(transparent)]
    Issue(#[from] IssueError),

    #[error(transparent)]
    Propagate(#[from] PropagateError),

    #[error(transparent)]
    Activate(#[from] ActivateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Config(_) => ErrorClass::Permanent,
            PipelineError::Dns(e) => e.class(),
            PipelineError::Issue(e) => e.class(),
            PipelineError::Propagate(e) => e.class(),
            PipelineError::Activate(e) => e.class(),
            PipelineError::Store(e) => e.class(),
            PipelineError::State(e) => e.class(),
        }
    }
}

impl PipelineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorClass::Transient.exit_code(), 1);
        assert_eq!(
            ErrorClass::RateLimited(Duration::from_secs(60)).exit_code(),
            1
        );
        assert_eq!(ErrorClass::Permanent.exit_code(), 2);
        assert_eq!(ErrorClass::Timeout.exit_code(), 3);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::RateLimited(Duration::from_secs(1)).is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
        assert!(!ErrorClass::Timeout.is_retryable());
    }
}
