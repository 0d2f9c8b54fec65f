//! Named failure conditions surfaced to the harness.
//!
//! Every variant carries the identifier it concerns (container name, image
//! path, ...) so callers never see a bare "operation failed".

use std::fmt;
use std::path::PathBuf;

use crate::sandbox::runtime::RuntimeError;

/// One candidate the reaper could not remove.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReapFailure {
    pub container: String,
    pub cause: String,
}

impl fmt::Display for ReapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.container, self.cause)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Missing host path, device or source image. Fixed by the operator, never retried.
    #[error("precondition failed for {subject}: {reason}")]
    Precondition { subject: String, reason: String },

    /// The runtime rejected the create/start request.
    #[error("launch of container '{container}' failed: {cause}")]
    Launch { container: String, cause: String },

    #[error("sandbox '{container}' was not reachable after {attempts} attempts")]
    ReadinessTimeout { container: String, attempts: u32 },

    #[error("disk image {} is locked by another process", path.display())]
    ImageLocked { path: PathBuf },

    #[error(
        "{} of {total} containers could not be reaped: {}",
        failures.len(),
        failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    PartialReap {
        total: usize,
        failures: Vec<ReapFailure>,
    },

    #[error("container runtime '{runtime}' is unreachable: {cause}")]
    RuntimeUnreachable { runtime: String, cause: String },

    #[error("proxy injection into {target} failed: {cause}")]
    Injection { target: String, cause: String },
}

impl LifecycleError {
    pub fn precondition(subject: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Precondition {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }

    pub fn injection(target: impl fmt::Display, cause: impl fmt::Display) -> Self {
        Self::Injection {
            target: target.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Map a runtime failure observed while working on `container`.
    ///
    /// Unreachable runtimes stay cross-cutting; anything else is a launch
    /// failure of that container.
    pub fn from_runtime(container: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable { runtime, cause } => {
                Self::RuntimeUnreachable { runtime, cause }
            }
            other => Self::Launch {
                container: container.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_reap_lists_every_failure() {
        let err = LifecycleError::PartialReap {
            total: 3,
            failures: vec![
                ReapFailure {
                    container: "abc".into(),
                    cause: "device busy".into(),
                },
                ReapFailure {
                    container: "def".into(),
                    cause: "permission denied".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 of 3 containers"));
        assert!(msg.contains("abc: device busy"));
        assert!(msg.contains("def: permission denied"));
    }

    #[test]
    fn test_from_runtime_keeps_unreachable_cross_cutting() {
        let err = LifecycleError::from_runtime(
            "eval-1",
            RuntimeError::Unreachable {
                runtime: "docker".into(),
                cause: "daemon down".into(),
            },
        );
        assert!(matches!(err, LifecycleError::RuntimeUnreachable { .. }));

        let err = LifecycleError::from_runtime(
            "eval-1",
            RuntimeError::Rejected {
                runtime: "docker".into(),
                cause: "no such image".into(),
            },
        );
        match err {
            LifecycleError::Launch { container, cause } => {
                assert_eq!(container, "eval-1");
                assert!(cause.contains("no such image"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
