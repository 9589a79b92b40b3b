//! Error types for the cluster agent
//!
//! Every variant carries the step that failed (`context`) alongside a message,
//! so a single error surfaced to the caller names where the join, signing or
//! configuration sequence stopped.

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for cluster agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid, expired or missing token
    #[error("{context}: {message}")]
    Auth {
        /// Step that rejected the credential
        context: String,
        /// Description of the rejection
        message: String,
    },

    /// Malformed request, port mismatch or unknown upgrade phase
    #[error("{context}: {message}")]
    Validation {
        /// Step that rejected the request
        context: String,
        /// Description of what's invalid
        message: String,
    },

    /// Wrong cluster mode for this join variant, or node already a member
    #[error("{context}: {message}")]
    Conflict {
        /// Step that detected the conflict
        context: String,
        /// Description of the conflict
        message: String,
    },

    /// Credential or membership state unreadable or malformed
    #[error("{context}: {message}")]
    State {
        /// Step that touched the broken state
        context: String,
        /// Underlying cause
        message: String,
    },

    /// Process restart or CLI tool exited with a failure
    #[error("{context}: {message}")]
    ExternalCommand {
        /// Step that ran the command
        context: String,
        /// Command line and exit status
        message: String,
    },

    /// Membership convergence deadline exceeded
    #[error("{context}: {message}")]
    Timeout {
        /// Step that was waiting
        context: String,
        /// What never happened
        message: String,
    },

    /// Certificate signing failed
    #[error("{context}: {source}")]
    Signing {
        /// Step that called the signer
        context: String,
        /// The underlying PKI error
        #[source]
        source: PkiError,
    },
}

impl Error {
    /// Create an authentication error
    pub fn auth(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Auth {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a state error
    pub fn state(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::State {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an external command error
    pub fn external_command(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ExternalCommand {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Wrap a PKI failure with the step that triggered it
    pub fn signing(context: impl Into<String>, source: PkiError) -> Self {
        Self::Signing {
            context: context.into(),
            source,
        }
    }

    /// Re-wrap an error under an outer step, keeping its category.
    ///
    /// The outer context is prepended so the rendered message reads
    /// `outer: inner-context: message`.
    pub fn within(self, outer: &str) -> Self {
        let nest = |context: String| format!("{outer}: {context}");
        match self {
            Self::Auth { context, message } => Self::Auth {
                context: nest(context),
                message,
            },
            Self::Validation { context, message } => Self::Validation {
                context: nest(context),
                message,
            },
            Self::Conflict { context, message } => Self::Conflict {
                context: nest(context),
                message,
            },
            Self::State { context, message } => Self::State {
                context: nest(context),
                message,
            },
            Self::ExternalCommand { context, message } => Self::ExternalCommand {
                context: nest(context),
                message,
            },
            Self::Timeout { context, message } => Self::Timeout {
                context: nest(context),
                message,
            },
            Self::Signing { context, source } => Self::Signing {
                context: nest(context),
                source,
            },
        }
    }

    /// Stable category name, used for structured logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Validation { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::State { .. } => "state",
            Self::ExternalCommand { .. } => "external_command",
            Self::Timeout { .. } => "timeout",
            Self::Signing { .. } => "signing",
        }
    }
}

/// Turn an I/O failure on a state file into a `State` error
pub(crate) fn io_state(context: impl Into<String>, err: std::io::Error) -> Error {
    Error::state(context, err.to_string())
}
