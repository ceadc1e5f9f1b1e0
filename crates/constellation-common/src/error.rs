//! Error taxonomy for the lifecycle engine
//!
//! Every public operation surfaces exactly one of the variants below. Lower
//! level causes are folded into the `message` field so the CLI can print a
//! single line and map the failure to a documented exit code.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::provider::CloudProvider;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for any failure without a more specific code
pub const EXIT_GENERIC: i32 = 1;
/// Exit code for rejected configuration
pub const EXIT_CONFIG: i32 = 2;
/// Exit code when another invocation holds the workspace lock
pub const EXIT_WORKSPACE_BUSY: i32 = 3;
/// Exit code when the cluster already runs an upgrade
pub const EXIT_UPGRADE_IN_PROGRESS: i32 = 4;
/// Exit code for signature, transparency-log or PCR-shape failures
pub const EXIT_VERIFICATION: i32 = 5;

/// Step of the IaC lifecycle an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendStep {
    /// Copying templates and writing variables
    Prepare,
    /// Backend initialisation (provider download, state setup)
    Init,
    /// Computing the diff against current state
    Plan,
    /// Rendering a saved plan
    Show,
    /// Applying a plan
    Apply,
    /// Reading outputs after apply
    Output,
    /// Tearing down all resources
    Destroy,
    /// Removing the workspace directory
    Cleanup,
    /// Restoring a workspace from its backup
    Restore,
}

impl fmt::Display for BackendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepare => "prepare",
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Show => "show",
            Self::Apply => "apply",
            Self::Output => "output",
            Self::Destroy => "destroy",
            Self::Cleanup => "cleanup",
            Self::Restore => "restore",
        };
        f.write_str(s)
    }
}

/// Coarse classification of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input rejected; no side effects
    ConfigValidation,
    /// Lock contention on the workspace
    WorkspaceBusy,
    /// Transient network failure
    Transport,
    /// Signature, transparency-log or PCR-shape failure
    VerificationFailed,
    /// Remote resource does not exist
    NotFound,
    /// Remote document does not match the expected schema
    Malformed,
    /// IaC backend or cloud API failure
    CloudBackend,
    /// The cluster is already upgrading
    UpgradeInProgress,
    /// Version ordering violation
    InvalidUpgrade,
    /// Readback did not reflect the write
    ApplyDivergence,
    /// Writing the attestation config to the cluster failed
    AttestationUpdate,
    /// Cooperative cancellation
    Cancelled,
    /// Invariant violation
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected before any side effect
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodeGroups.worker.initialCount")
        field: Option<String>,
    },

    /// Workspace lock is held by another invocation
    #[error("workspace {} is busy: {message}", path.display())]
    WorkspaceBusy {
        /// Workspace root
        path: PathBuf,
        /// Description of the contention
        message: String,
    },

    /// Retryable network failure
    #[error("transport error [{target}]: {message}")]
    Transport {
        /// URL or object the request was addressed to
        target: String,
        /// Description of what failed
        message: String,
        /// HTTP status code if one was received
        status: Option<u16>,
    },

    /// Signature, transparency-log, or measurement shape check failed
    #[error("verification failed [{subject}]: {message}")]
    VerificationFailed {
        /// What was being verified (e.g., "measurements signature")
        subject: String,
        /// Description of the mismatch
        message: String,
    },

    /// Remote resource was not found
    #[error("{resource} not found: {message}")]
    NotFound {
        /// Resource that was requested
        resource: String,
        /// Additional detail
        message: String,
    },

    /// Remote document could not be parsed
    #[error("malformed {resource}: {message}")]
    Malformed {
        /// Resource that was parsed
        resource: String,
        /// Parser message
        message: String,
    },

    /// IaC backend or cloud API failure
    #[error("{step} failed for {provider}: {message}")]
    CloudBackend {
        /// Lifecycle step that failed
        step: BackendStep,
        /// Cloud provider of the workspace
        provider: CloudProvider,
        /// Backend output or cause
        message: String,
    },

    /// An upgrade is already running in the cluster
    #[error("upgrade in progress: {message}")]
    UpgradeInProgress {
        /// Description of the observed state
        message: String,
    },

    /// Requested version is not a valid upgrade target
    #[error("invalid {component} upgrade from {from} to {to}: {message}")]
    InvalidUpgrade {
        /// Component being upgraded ("image", "kubernetes")
        component: String,
        /// Currently running version
        from: String,
        /// Requested version
        to: String,
        /// Rule that was violated
        message: String,
    },

    /// Readback of a written object did not match the request
    #[error("expected {resource} to contain {expected}, got {actual}")]
    ApplyDivergence {
        /// Object that was written
        resource: String,
        /// Value that was requested
        expected: String,
        /// Value that was read back
        actual: String,
    },

    /// Writing the attestation config to the cluster failed
    #[error("updating attestation config: {message}")]
    AttestationUpdate {
        /// Description of what failed
        message: String,
    },

    /// Operation was cancelled through its token
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was interrupted
        operation: String,
    },

    /// Invariant violation or local I/O failure
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Several errors collected in order (rollback, double invalid upgrade)
    #[error("{}", join_messages(errors))]
    Joined {
        /// Collected errors, primary first
        errors: Vec<Error>,
    },
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a configuration validation error
    pub fn config_validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration validation error for a specific field
    pub fn config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a workspace busy error
    pub fn workspace_busy(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::WorkspaceBusy {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error without status code
    pub fn transport(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create a transport error for an unexpected HTTP status
    pub fn transport_status(target: impl Into<String>, status: u16) -> Self {
        Self::Transport {
            target: target.into(),
            message: format!("unexpected status {}", status),
            status: Some(status),
        }
    }

    /// Create a verification error
    pub fn verification(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::VerificationFailed {
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed document error
    pub fn malformed(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Malformed {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a cloud backend error for the given step and provider
    pub fn cloud_backend(
        step: BackendStep,
        provider: CloudProvider,
        msg: impl Into<String>,
    ) -> Self {
        Self::CloudBackend {
            step,
            provider,
            message: msg.into(),
        }
    }

    /// Create an upgrade-in-progress error
    pub fn upgrade_in_progress(msg: impl Into<String>) -> Self {
        Self::UpgradeInProgress {
            message: msg.into(),
        }
    }

    /// Create an invalid upgrade error
    pub fn invalid_upgrade(
        component: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidUpgrade {
            component: component.into(),
            from: from.into(),
            to: to.into(),
            message: msg.into(),
        }
    }

    /// Create an apply divergence error
    pub fn apply_divergence(
        resource: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ApplyDivergence {
            resource: resource.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an attestation update error
    pub fn attestation_update(msg: impl Into<String>) -> Self {
        Self::AttestationUpdate {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// Create an internal error from an I/O failure on a path
    pub fn io(context: impl Into<String>, path: &std::path::Path, err: std::io::Error) -> Self {
        Self::internal_with_context(context, format!("{}: {}", path.display(), err))
    }

    /// Join a list of errors into one
    ///
    /// Returns `None` for an empty list and the error itself for a single
    /// element, so callers never observe a one-element `Joined`.
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined { errors }),
        }
    }

    /// Attach further errors (typically from rollback) behind this one
    pub fn with_followups(self, followups: Vec<Error>) -> Self {
        if followups.is_empty() {
            return self;
        }
        let mut errors = match self {
            Self::Joined { errors } => errors,
            other => vec![other],
        };
        errors.extend(followups);
        Self::Joined { errors }
    }

    /// Classification of this error; a joined error takes its first member's kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigValidation { .. } => ErrorKind::ConfigValidation,
            Self::WorkspaceBusy { .. } => ErrorKind::WorkspaceBusy,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Malformed { .. } => ErrorKind::Malformed,
            Self::CloudBackend { .. } => ErrorKind::CloudBackend,
            Self::UpgradeInProgress { .. } => ErrorKind::UpgradeInProgress,
            Self::InvalidUpgrade { .. } => ErrorKind::InvalidUpgrade,
            Self::ApplyDivergence { .. } => ErrorKind::ApplyDivergence,
            Self::AttestationUpdate { .. } => ErrorKind::AttestationUpdate,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Joined { errors } => errors
                .first()
                .map(Error::kind)
                .unwrap_or(ErrorKind::Internal),
        }
    }

    /// Whether the operation that produced this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport)
    }

    /// Process exit code the CLI reports for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ConfigValidation => EXIT_CONFIG,
            ErrorKind::WorkspaceBusy => EXIT_WORKSPACE_BUSY,
            ErrorKind::UpgradeInProgress => EXIT_UPGRADE_IN_PROGRESS,
            ErrorKind::VerificationFailed => EXIT_VERIFICATION,
            _ => EXIT_GENERIC,
        }
    }

    /// Members of a joined error, or this error alone
    pub fn members(&self) -> Vec<&Error> {
        match self {
            Self::Joined { errors } => errors.iter().collect(),
            other => vec![other],
        }
    }
}
