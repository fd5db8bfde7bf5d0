//! Access-code state machine: `NoCode`, `CodeInactive`, `CodeActive`.
//!
//! Local booking state is the source of truth. Every provider call is
//! bounded by a timeout and its outcome persisted through the engine;
//! failures surface as [`AccessCodeError`] for the caller to log, never to
//! undo the booking change that triggered them.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;

use super::entity::{AccessCodeDiagnostics, AccessCodeEntity};
use super::provider::*;

#[derive(Debug, Error)]
pub enum AccessCodeError {
    #[error("unknown access-code owner: {0}")]
    UnknownEntity(AccessCodeTarget),
    #[error("provider call failed for {entity}: {source}")]
    Provider {
        entity: EntityRef,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AccessCodeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AccessCodeError::Provider {
                source: ProviderError::Transient(_),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccessCodeConfig {
    /// Validity window starts this long before each booking.
    pub lead: Ms,
    /// Validity window ends this long after each booking.
    pub trail: Ms,
    pub provider_timeout: Duration,
    /// Concurrent provider calls during a sweep.
    pub sweep_concurrency: usize,
}

impl Default for AccessCodeConfig {
    fn default() -> Self {
        Self {
            lead: 10 * MINUTE_MS,
            trail: 5 * MINUTE_MS,
            provider_timeout: Duration::from_secs(10),
            sweep_concurrency: 8,
        }
    }
}

fn status_from_remote(remote: &RemoteAccessCode) -> AccessCodeStatus {
    AccessCodeStatus {
        generated_at: Some(remote.generated_at.timestamp_millis()),
        is_active: remote.is_active,
    }
}

pub struct AccessCodeMachine {
    pub(super) engine: Arc<Engine>,
    provider: Arc<dyn AccessCodeProvider>,
    pub(super) config: AccessCodeConfig,
}

impl AccessCodeMachine {
    pub fn new(engine: Arc<Engine>, provider: Arc<dyn AccessCodeProvider>, config: AccessCodeConfig) -> Self {
        Self {
            engine,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &AccessCodeConfig {
        &self.config
    }

    pub fn resolve(&self, target: AccessCodeTarget) -> Result<AccessCodeEntity, AccessCodeError> {
        AccessCodeEntity::resolve(&self.engine, target).ok_or(AccessCodeError::UnknownEntity(target))
    }

    /// Run one provider call under the configured timeout. An elapsed
    /// timeout is a transient failure like any other.
    async fn call<T, F>(&self, op: ProviderOp, entity: &EntityRef, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.provider_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "timed out after {}ms",
                self.config.provider_timeout.as_millis()
            ))),
        };
        metrics::counter!(
            crate::observability::PROVIDER_CALLS_TOTAL,
            "op" => op.label(),
            "outcome" => outcome_label(&result),
        )
        .increment(1);
        metrics::histogram!(crate::observability::PROVIDER_CALL_DURATION_SECONDS, "op" => op.label())
            .record(started.elapsed().as_secs_f64());
        if let Err(ProviderError::Transient(reason)) = &result {
            error!(%entity, op = op.label(), "access-code provider failure: {reason}");
        }
        result
    }

    async fn record(&self, target: AccessCodeTarget, status: AccessCodeStatus) -> Result<AccessCodeStatus, AccessCodeError> {
        self.engine.record_access_code(target, status).await?;
        Ok(status)
    }

    fn provider_error(entity: &AccessCodeEntity, source: ProviderError) -> AccessCodeError {
        AccessCodeError::Provider {
            entity: entity.remote,
            source,
        }
    }

    /// Mint a code. If the provider already holds one for this owner, adopt
    /// its state instead of failing.
    pub async fn create_access_code(
        &self,
        target: AccessCodeTarget,
        is_active: bool,
    ) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        let windows = entity.validity_windows(self.config.lead, self.config.trail, now_ms());
        let created = self
            .call(
                ProviderOp::Create,
                &entity.remote,
                self.provider.create(&entity.remote, &windows, is_active),
            )
            .await;
        match created {
            Ok(remote) => {
                info!(target = %entity.target, is_active, "access code created");
                self.record(entity.target, status_from_remote(&remote)).await
            }
            Err(ProviderError::Conflict) => {
                debug!(target = %entity.target, "access code already exists, adopting remote state");
                self.get_access_code(entity.target).await
            }
            Err(e) => Err(Self::provider_error(&entity, e)),
        }
    }

    /// Fetch the provider's state and store it locally. A missing code
    /// resets the owner to `NoCode`.
    pub async fn get_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        match self
            .call(ProviderOp::Get, &entity.remote, self.provider.get(&entity.remote))
            .await
        {
            Ok(remote) => self.record(entity.target, status_from_remote(&remote)).await,
            Err(ProviderError::NotFound) => self.record(entity.target, AccessCodeStatus::NONE).await,
            Err(e) => Err(Self::provider_error(&entity, e)),
        }
    }

    pub async fn activate_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        self.set_active(target, true).await
    }

    /// Deactivation of a grouped booking applies to the whole group, since
    /// all members share one remote record.
    pub async fn deactivate_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        self.set_active(target, false).await
    }

    async fn set_active(&self, target: AccessCodeTarget, is_active: bool) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        let (op, result) = if is_active {
            let r = self
                .call(ProviderOp::Activate, &entity.remote, self.provider.activate(&entity.remote))
                .await;
            (ProviderOp::Activate, r)
        } else {
            let r = self
                .call(ProviderOp::Deactivate, &entity.remote, self.provider.deactivate(&entity.remote))
                .await;
            (ProviderOp::Deactivate, r)
        };
        match result {
            Ok(()) => {
                let status = AccessCodeStatus {
                    generated_at: entity.status.generated_at.or(Some(now_ms())),
                    is_active,
                };
                debug!(target = %entity.target, op = op.label(), "access code updated");
                self.record(entity.target, status).await
            }
            // The code is gone; nothing left to correct.
            Err(ProviderError::NotFound) => {
                info!(target = %entity.target, op = op.label(), "access code missing at provider, resetting");
                self.record(entity.target, AccessCodeStatus::NONE).await
            }
            Err(e) => Err(Self::provider_error(&entity, e)),
        }
    }

    /// Send recomputed validity windows. Falls back to creating the code
    /// when the provider has none.
    pub async fn reschedule_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        let now = now_ms();
        let windows = entity.validity_windows(self.config.lead, self.config.trail, now);
        match self
            .call(
                ProviderOp::Reschedule,
                &entity.remote,
                self.provider.reschedule(&entity.remote, &windows),
            )
            .await
        {
            Ok(()) => Ok(entity.status),
            Err(ProviderError::NotFound) => {
                self.create_access_code(entity.target, entity.should_be_active(now)).await
            }
            Err(e) => Err(Self::provider_error(&entity, e)),
        }
    }

    /// Follow-up to a booking time change: update the windows of an existing
    /// code without touching its active flag. Owners without a code are left
    /// alone; the sweep creates codes that should exist.
    pub async fn sync_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        if entity.status.state() == AccessCodeState::NoCode {
            return Ok(entity.status);
        }
        self.reschedule_access_code(entity.target).await
    }

    /// Remove the remote code. A code already gone counts as removed.
    pub async fn delete_access_code(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        match self
            .call(ProviderOp::Delete, &entity.remote, self.provider.delete(&entity.remote))
            .await
        {
            Ok(()) | Err(ProviderError::NotFound) => {
                info!(target = %entity.target, "access code deleted");
                self.record(entity.target, AccessCodeStatus::NONE).await
            }
            Err(e) => Err(Self::provider_error(&entity, e)),
        }
    }

    pub fn access_code_diagnostics(&self, target: AccessCodeTarget) -> Result<AccessCodeDiagnostics, AccessCodeError> {
        Ok(self.resolve(target)?.diagnostics(now_ms()))
    }

    /// Bring one owner's remote code in line with its desired state:
    /// delete codes nobody uses, create missing ones, flip the active flag.
    /// Returns the resulting local status.
    pub async fn converge(&self, target: AccessCodeTarget) -> Result<AccessCodeStatus, AccessCodeError> {
        let entity = self.resolve(target)?;
        let now = now_ms();
        let should_be_active = entity.should_be_active(now);
        match entity.status.state() {
            AccessCodeState::NoCode if should_be_active => {
                self.create_access_code(entity.target, true).await
            }
            AccessCodeState::NoCode => Ok(entity.status),
            _ if !entity.uses_access_codes(now) => self.delete_access_code(entity.target).await,
            _ if entity.status.is_active != should_be_active => {
                self.set_active(entity.target, should_be_active).await
            }
            _ => Ok(entity.status),
        }
    }

    /// Best-effort access-code step after a committed booking change.
    /// `previous` is the booking before the change, `None` for a new one.
    pub async fn after_booking_change(
        &self,
        previous: Option<&Booking>,
        current: &Booking,
    ) -> Result<(), AccessCodeError> {
        let target = AccessCodeTarget::for_booking(current);
        let moved = previous.is_some_and(|p| p.span != current.span);

        if let Some(prev) = previous
            && prev.group != current.group
            && prev.group.is_some()
        {
            // Left a group: the old group's windows lost this member.
            let old = AccessCodeTarget::for_booking(prev);
            self.refresh_group(old).await?;
        }

        if current.group.is_some() {
            let joined = previous.is_none_or(|p| p.group != current.group);
            let eligibility_changed = previous.is_some_and(|p| {
                p.state != current.state || p.access_type != current.access_type || p.kind != current.kind
            });
            if joined || moved || eligibility_changed {
                self.refresh_group(target).await?;
            }
            return Ok(());
        }

        if moved {
            self.sync_access_code(target).await?;
        }
        if !current.is_occupying() && current.access_code.state() != AccessCodeState::NoCode {
            self.delete_access_code(target).await?;
            return Ok(());
        }
        self.converge(target).await?;
        Ok(())
    }

    /// Membership or eligibility of a group changed: resend its windows if
    /// it has a code, then converge its active flag.
    async fn refresh_group(&self, target: AccessCodeTarget) -> Result<(), AccessCodeError> {
        let entity = self.resolve(target)?;
        if entity.status.state() != AccessCodeState::NoCode && entity.uses_access_codes(now_ms()) {
            self.reschedule_access_code(target).await?;
        }
        self.converge(target).await?;
        Ok(())
    }
}
