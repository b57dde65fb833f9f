//! # Summary
//!
//! Failure modes surfaced by the log, the aggregates and the participants.
//! Stale or misaddressed protocol messages are not errors: the state machine
//! answers them with a `Nack` or drops them.

use thiserror::Error;

use crate::state::{NodeId, PipelineId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Another writer appended to the aggregate since it was read.
    #[error("concurrency conflict: expected version {expected}, log is at {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Aggregate has no recorded events.
    #[error("aggregate not found")]
    NotFound,

    /// Value requested before the instance resolved.
    #[error("value not resolved yet")]
    NotResolved,

    /// Proposal did not resolve locally within the caller's budget.
    #[error("proposal timed out")]
    Timeout,

    /// No participant with this id in the roster.
    #[error("unknown participant {0}")]
    UnknownParticipant(NodeId),

    /// Delivery task ended abnormally.
    #[error("participant task failed: {0}")]
    Stopped(String),

    /// Notification stream from `upstream` skipped a position.
    #[error("gap in pipeline {pipeline} from participant {upstream}: expected position {expected}, found {found}")]
    Gap {
        upstream: NodeId,
        pipeline: PipelineId,
        expected: u64,
        found: u64,
    },

    /// Protocol invariant broken. Never retried.
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    /// Recorded history is inconsistent with the participant reading it.
    #[error("corrupted log: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl Error {
    /// Errors that a retry with fresh state can clear.
    pub fn is_transient(&self) -> bool {
        match self {
        | Error::ConcurrencyConflict { .. }
        | Error::NotResolved
        | Error::Gap { .. } => true,
        | _ => false,
        }
    }

    /// Errors that must stop a participant.
    pub fn is_fatal(&self) -> bool {
        match self {
        | Error::SafetyViolation(_)
        | Error::Corrupted(_)
        | Error::Io(_)
        | Error::Codec(_)
        | Error::Stopped(_) => true,
        | _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_transient_and_log_faults_fatal() {
        let conflict = Error::ConcurrencyConflict { expected: 1, actual: 2 };
        assert!(conflict.is_transient() && !conflict.is_fatal());
        let gap = Error::Gap { upstream: 0, pipeline: 0, expected: 3, found: 5 };
        assert!(gap.is_transient());

        let corrupted = Error::Corrupted("frame 2".to_string());
        assert!(corrupted.is_fatal() && !corrupted.is_transient());
        assert!(!Error::Timeout.is_transient() && !Error::Timeout.is_fatal());
    }
}
