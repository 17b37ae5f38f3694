//! Session orchestration error types.

use thiserror::Error;

use crate::gtp::cause;

/// Errors raised by the session store, the orchestrator and the charging
/// record generator. Two variants are discard signals rather than true
/// errors: `Retransmitted` (duplicate north-bound request) and
/// `UnknownSession` (late or duplicate south-bound response).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No UE, session or bearer matches the given key
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// Mandatory IE absent from a north-bound request
    #[error("mandatory IE missing: {0}")]
    MandatoryIeMissing(&'static str),

    /// Mandatory IE present but refers to the wrong context
    #[error("mandatory IE incorrect: {0}")]
    MandatoryIeIncorrect(&'static str),

    /// A bounded table (PDN, bearer, pool) is full
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A live context already owns this subscriber identity
    #[error("duplicate identity: IMSI[{0}]")]
    DuplicateIdentity(String),

    /// Retransmitted request, discard without side effects
    #[error("retransmitted request discarded")]
    Retransmitted,

    /// South-bound response for a session we no longer track, discard
    #[error("unknown session: SEID[0x{0:x}]")]
    UnknownSession(u64),

    /// EPS bearer id outside the valid range
    #[error("invalid bearer id: EBI[{0}]")]
    InvalidBearerId(u8),

    /// Serialized charging record exceeds the record buffer
    #[error("charging record too large: {size} > {max}")]
    RecordTooLarge { size: usize, max: usize },

    /// South-bound send failure or retry exhaustion
    #[error("system failure: {0}")]
    SystemFailure(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Map an error to the GTP cause value carried in the reply to the
    /// originating peer.
    pub fn gtp_cause(&self) -> u8 {
        match self {
            SessionError::ContextNotFound(_) => cause::CONTEXT_NOT_FOUND,
            SessionError::MandatoryIeMissing(_) => cause::MANDATORY_IE_MISSING,
            SessionError::MandatoryIeIncorrect(_) => cause::MANDATORY_IE_INCORRECT,
            SessionError::ResourceExhausted(_) => cause::NO_RESOURCES_AVAILABLE,
            SessionError::DuplicateIdentity(_) => cause::CONTEXT_NOT_FOUND,
            SessionError::InvalidBearerId(_) => cause::MANDATORY_IE_INCORRECT,
            SessionError::RecordTooLarge { .. } => cause::SYSTEM_FAILURE,
            SessionError::SystemFailure(_) => cause::SYSTEM_FAILURE,
            // Discard signals never reach a peer reply; map defensively
            SessionError::Retransmitted | SessionError::UnknownSession(_) => {
                cause::SYSTEM_FAILURE
            }
        }
    }

    /// True for the two discard signals that must not produce a peer reply.
    pub fn is_discard(&self) -> bool {
        matches!(
            self,
            SessionError::Retransmitted | SessionError::UnknownSession(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_mapping() {
        assert_eq!(
            SessionError::MandatoryIeMissing("IMSI").gtp_cause(),
            cause::MANDATORY_IE_MISSING
        );
        assert_eq!(
            SessionError::InvalidBearerId(3).gtp_cause(),
            cause::MANDATORY_IE_INCORRECT
        );
        assert_eq!(
            SessionError::ContextNotFound("x".into()).gtp_cause(),
            cause::CONTEXT_NOT_FOUND
        );
    }

    #[test]
    fn test_discard_signals() {
        assert!(SessionError::Retransmitted.is_discard());
        assert!(SessionError::UnknownSession(1).is_discard());
        assert!(!SessionError::SystemFailure("x".into()).is_discard());
    }
}
