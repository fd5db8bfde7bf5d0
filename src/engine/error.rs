use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingState, Span};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Overlap with an existing booking; carries the conflicting booking id.
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("cycle detected at space: {0}")]
    CycleDetected(Ulid),
    #[error("cannot delete space {0}: has children")]
    HasChildren(Ulid),
    #[error("{0} is still referenced by a reservation unit or booking")]
    InUse(Ulid),
    #[error("invalid span [{}, {})", .0.start, .0.end)]
    InvalidSpan(Span),
    #[error("booking {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Ulid,
        from: BookingState,
        to: BookingState,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Structural data that cannot produce a well-defined AffectedSet index.
/// Aborts the rebuild only; the previous index keeps serving.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("space {space} has unknown parent {parent}")]
    DanglingParent { space: Ulid, parent: Ulid },
    #[error("space hierarchy contains a cycle through {0}")]
    Cycle(Ulid),
    #[error("space hierarchy deeper than {0} levels")]
    TooDeep(usize),
    #[error("reservation unit {unit} references unknown space {space}")]
    UnknownSpace { unit: Ulid, space: Ulid },
    #[error("reservation unit {unit} references unknown resource {resource}")]
    UnknownResource { unit: Ulid, resource: Ulid },
}
