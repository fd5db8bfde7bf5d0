//! The keyless-entry provider seam. Every remote code is keyed by the
//! owner's externally-stable UUID and a kind, never by an internal id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Reservation,
    Series,
    SeasonalBooking,
}

impl EntityKind {
    pub fn path_segment(self) -> &'static str {
        match self {
            EntityKind::Reservation => "reservation",
            EntityKind::Series => "series",
            EntityKind::SeasonalBooking => "seasonal-booking",
        }
    }
}

/// Provider-side identity of an access-code owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub uuid: Uuid,
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.path_segment(), self.uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// What the provider reports about a code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccessCode {
    pub code: String,
    pub generated_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub validity: Vec<ValidityWindow>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("access code not found")]
    NotFound,
    #[error("access code already exists")]
    Conflict,
    #[error("provider unavailable: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    Create,
    Get,
    Activate,
    Deactivate,
    Reschedule,
    Delete,
}

impl ProviderOp {
    pub const ALL: [ProviderOp; 6] = [
        ProviderOp::Create,
        ProviderOp::Get,
        ProviderOp::Activate,
        ProviderOp::Deactivate,
        ProviderOp::Reschedule,
        ProviderOp::Delete,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ProviderOp::Create => "create",
            ProviderOp::Get => "get",
            ProviderOp::Activate => "activate",
            ProviderOp::Deactivate => "deactivate",
            ProviderOp::Reschedule => "reschedule",
            ProviderOp::Delete => "delete",
        }
    }
}

/// Outcome label for metrics.
pub fn outcome_label<T>(result: &Result<T, ProviderError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(ProviderError::NotFound) => "not_found",
        Err(ProviderError::Conflict) => "conflict",
        Err(ProviderError::Transient(_)) => "transient",
    }
}

#[async_trait]
pub trait AccessCodeProvider: Send + Sync {
    async fn create(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
        is_active: bool,
    ) -> Result<RemoteAccessCode, ProviderError>;

    async fn get(&self, entity: &EntityRef) -> Result<RemoteAccessCode, ProviderError>;

    async fn activate(&self, entity: &EntityRef) -> Result<(), ProviderError>;

    async fn deactivate(&self, entity: &EntityRef) -> Result<(), ProviderError>;

    async fn reschedule(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
    ) -> Result<(), ProviderError>;

    async fn delete(&self, entity: &EntityRef) -> Result<(), ProviderError>;
}
