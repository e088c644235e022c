//! Failure taxonomy for image builds.
//!
//! Components return `anyhow::Result` and attach context as they go; the
//! typed [`BuildError`] sits at the bottom of the chain so the orchestrator
//! and the binary can decide between "fail before touching anything",
//! "tear down then fail" and "tear down then exit cleanly".

use thiserror::Error;

/// Typed build failures, classified by how the orchestrator reacts to them.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing or invalid profile fields, unsupported enum values, missing
    /// packages file. Raised before any device or filesystem action.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No free device handle, kernel module load failure.
    #[error("resource acquisition failed: {0}")]
    ResourceAcquisition(String),

    /// An external formatting/partitioning/copy command failed.
    #[error("{program} failed ({status}){}", detail_suffix(.detail))]
    ToolInvocation {
        program: String,
        status: String,
        detail: String,
    },

    /// A permission-fixup path resolved outside the target root.
    #[error("security invariant violated: {0}")]
    SecurityInvariant(String),

    /// Termination signal received; cleanup has been attempted.
    #[error("interrupted by termination signal")]
    Interrupted,
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

impl BuildError {
    /// Shorthand for a [`BuildError::Configuration`] wrapped in `anyhow`.
    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        BuildError::Configuration(msg.into()).into()
    }

    /// Find the typed failure anywhere in an error chain.
    pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
        err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
    }

    /// Process exit code for this failure.
    ///
    /// Interrupts exit cleanly once best-effort cleanup has run.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Interrupted => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_finds_typed_error_under_context() {
        let err = Err::<(), _>(BuildError::config("img-name is empty"))
            .context("loading profile")
            .unwrap_err();
        assert!(matches!(
            BuildError::classify(&err),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn test_classify_untyped_error() {
        let err = anyhow::anyhow!("plain failure");
        assert!(BuildError::classify(&err).is_none());
    }

    #[test]
    fn test_interrupt_exits_zero() {
        assert_eq!(BuildError::Interrupted.exit_code(), 0);
        assert_eq!(BuildError::Configuration("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_tool_invocation_message() {
        let err = BuildError::ToolInvocation {
            program: "parted".into(),
            status: "exit status: 1".into(),
            detail: "Error: Can't have overlapping partitions.".into(),
        };
        assert_eq!(
            err.to_string(),
            "parted failed (exit status: 1): Error: Can't have overlapping partitions."
        );
    }
}
