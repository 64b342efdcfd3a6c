//! Error taxonomy for the synthesis engine

use crate::events::ResourceKind;
use crate::resource::UtilStatus;
use crate::session::SessionStatus;
use thiserror::Error;

/// Errors produced by the synthesis engine.
///
/// Transition errors are recoverable: the offending event or reading is
/// dropped and the originating state machine stays usable. Configuration
/// and I/O errors abort the operation that raised them.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// A resource state machine observed a transition it cannot explain.
    #[error("unexpected {kind} state transition from {from} to {to} for pod {pod}")]
    UnexpectedResourceTransition {
        kind: ResourceKind,
        pod: String,
        from: UtilStatus,
        to: UtilStatus,
    },

    /// A session state machine observed an event that is not valid in its
    /// current state.
    #[error("unexpected session state transition: {event} while {status} for session {session}")]
    UnexpectedSessionTransition {
        session: String,
        status: SessionStatus,
        event: String,
    },

    /// A workload template violates a structural invariant. Raised before
    /// any event is produced.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An I/O failure while reading trace or mapping files.
    #[error("trace i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A trace record could not be parsed.
    #[error("failed to parse trace record: {0}")]
    Csv(#[from] csv::Error),
}

impl SynthesisError {
    /// True for the recoverable transition errors that leave the
    /// originating state machine usable.
    pub fn is_transition_error(&self) -> bool {
        matches!(
            self,
            SynthesisError::UnexpectedResourceTransition { .. }
                | SynthesisError::UnexpectedSessionTransition { .. }
        )
    }
}
