use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::provider::*;

/// In-process provider for tests and for running without a provider URL.
/// Counts calls per operation and can be told to fail.
#[derive(Default)]
pub struct MemoryProvider {
    codes: DashMap<EntityRef, RemoteAccessCode>,
    calls: DashMap<ProviderOp, AtomicU64>,
    failures: Mutex<VecDeque<(ProviderOp, ProviderError)>>,
    latency: Mutex<Option<Duration>>,
    next_code: AtomicU64,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made for `op`, including failed ones.
    pub fn calls(&self, op: ProviderOp) -> u64 {
        self.calls
            .get(&op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        ProviderOp::ALL.iter().map(|op| self.calls(*op)).sum()
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
    }

    /// Make the next call of `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: ProviderOp, error: ProviderError) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.push_back((op, error));
        }
    }

    /// Delay every call, e.g. to trip a caller-side timeout.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    pub fn remote(&self, entity: &EntityRef) -> Option<RemoteAccessCode> {
        self.codes.get(entity).map(|e| e.value().clone())
    }

    /// Seed a code as if another system had created it.
    pub fn insert_remote(&self, entity: EntityRef, code: RemoteAccessCode) {
        self.codes.insert(entity, code);
    }

    /// Drop a code as if it had expired provider-side.
    pub fn forget(&self, entity: &EntityRef) {
        self.codes.remove(entity);
    }

    async fn enter(&self, op: ProviderOp) -> Result<(), ProviderError> {
        self.calls
            .entry(op)
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
        let latency = self.latency.lock().ok().and_then(|g| *g);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self.failures.lock().ok().and_then(|mut queue| {
            let pos = queue.iter().position(|(o, _)| *o == op)?;
            queue.remove(pos).map(|(_, e)| e)
        });
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn set_active(&self, entity: &EntityRef, is_active: bool) -> Result<(), ProviderError> {
        let mut code = self.codes.get_mut(entity).ok_or(ProviderError::NotFound)?;
        code.is_active = is_active;
        Ok(())
    }
}

#[async_trait]
impl AccessCodeProvider for MemoryProvider {
    async fn create(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
        is_active: bool,
    ) -> Result<RemoteAccessCode, ProviderError> {
        self.enter(ProviderOp::Create).await?;
        if self.codes.contains_key(entity) {
            return Err(ProviderError::Conflict);
        }
        let n = self.next_code.fetch_add(1, Ordering::SeqCst);
        let code = RemoteAccessCode {
            code: format!("{:06}", 100_000 + n),
            generated_at: Utc::now(),
            is_active,
            validity: validity.to_vec(),
        };
        self.codes.insert(*entity, code.clone());
        Ok(code)
    }

    async fn get(&self, entity: &EntityRef) -> Result<RemoteAccessCode, ProviderError> {
        self.enter(ProviderOp::Get).await?;
        self.remote(entity).ok_or(ProviderError::NotFound)
    }

    async fn activate(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Activate).await?;
        self.set_active(entity, true)
    }

    async fn deactivate(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Deactivate).await?;
        self.set_active(entity, false)
    }

    async fn reschedule(
        &self,
        entity: &EntityRef,
        validity: &[ValidityWindow],
    ) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Reschedule).await?;
        let mut code = self.codes.get_mut(entity).ok_or(ProviderError::NotFound)?;
        code.validity = validity.to_vec();
        Ok(())
    }

    async fn delete(&self, entity: &EntityRef) -> Result<(), ProviderError> {
        self.enter(ProviderOp::Delete).await?;
        self.codes
            .remove(entity)
            .map(|_| ())
            .ok_or(ProviderError::NotFound)
    }
}
