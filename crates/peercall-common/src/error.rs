//! Centralized error types for peercall.
//!
//! Every failure a call can hit maps onto one [`CallError`] variant. None of
//! them is fatal to the process: the state machine decides per variant whether
//! the current call attempt survives, is rejected, or is torn down.

use std::fmt;

/// Core error type used across all peercall crates.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    // === Input errors ===
    /// A relay payload failed to decode or validate. Discarded, never transitions.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // === Negotiation errors ===
    /// The transport engine rejected an operation. Aborts the current attempt.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Local media could not be acquired. Aborts before any session exists.
    #[error("Media unavailable: {0}")]
    MediaAccess(String),

    // === Request errors ===
    /// The requested operation is not allowed in the current call state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The request was refused by call policy (self-call, busy).
    #[error("Rejected: {0}")]
    Policy(PolicyViolation),

    // === Infrastructure errors ===
    /// The relay connection is gone or refused a message.
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Why a call request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Target identity equals the local identity.
    SelfCall,
    /// An offer arrived while another call is in progress.
    Busy { from: String },
    /// Target identity is empty.
    EmptyTarget,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfCall => write!(f, "cannot call yourself"),
            Self::Busy { from } => write!(f, "busy, refused call from {from}"),
            Self::EmptyTarget => write!(f, "no call target given"),
        }
    }
}

impl CallError {
    pub fn malformed(msg: impl fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    pub fn engine(msg: impl fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    pub fn media(msg: impl fmt::Display) -> Self {
        Self::MediaAccess(msg.to_string())
    }

    pub fn invalid_state(msg: impl fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    pub fn relay(msg: impl fmt::Display) -> Self {
        Self::Relay(msg.to_string())
    }

    /// Error code string for programmatic handling by front-ends.
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::MediaAccess(_) => "MEDIA_ACCESS",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Policy(PolicyViolation::SelfCall) => "SELF_CALL",
            Self::Policy(PolicyViolation::Busy { .. }) => "BUSY",
            Self::Policy(PolicyViolation::EmptyTarget) => "EMPTY_TARGET",
            Self::Relay(_) => "RELAY_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error aborts the call attempt it happened in.
    pub fn aborts_call(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::MediaAccess(_) | Self::Internal(_))
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

/// Convenience type alias for Results using CallError.
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_codes_are_distinct() {
        let busy = CallError::Policy(PolicyViolation::Busy { from: "bob".into() });
        let selfcall = CallError::Policy(PolicyViolation::SelfCall);
        assert_eq!(busy.error_code(), "BUSY");
        assert_eq!(selfcall.error_code(), "SELF_CALL");
        assert_eq!(busy.to_string(), "Rejected: busy, refused call from bob");
    }

    #[test]
    fn only_engine_and_media_abort() {
        assert!(CallError::engine("no codec").aborts_call());
        assert!(CallError::media("no camera").aborts_call());
        assert!(!CallError::malformed("bad json").aborts_call());
        assert!(!CallError::invalid_state("idle").aborts_call());
    }

    #[test]
    fn json_errors_become_malformed() {
        let err: CallError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
    }
}
