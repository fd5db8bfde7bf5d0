//! The booking-mutation seam: validate, commit, recheck-and-compensate, then
//! the best-effort access-code step.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};
use ulid::Ulid;

use crate::access::AccessCodeMachine;
use crate::engine::{Engine, EngineError, NewBooking};
use crate::model::*;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The booking overlaps `0`; nothing was committed (or it was retracted).
    #[error("conflicts with booking {0}")]
    Conflict(Ulid),
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict(id) => ServiceError::Conflict(id),
            other => ServiceError::Engine(other),
        }
    }
}

pub struct BookingService {
    engine: Arc<Engine>,
    access: Arc<AccessCodeMachine>,
}

impl BookingService {
    pub fn new(engine: Arc<Engine>, access: Arc<AccessCodeMachine>) -> Self {
        Self { engine, access }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn access(&self) -> &Arc<AccessCodeMachine> {
        &self.access
    }

    /// Reserve `span` on one unit.
    pub async fn validate_and_reserve(
        &self,
        unit_id: Ulid,
        span: Span,
        kind: BookingKind,
        access_type: AccessType,
    ) -> Result<Ulid, ServiceError> {
        self.reserve(NewBooking::new(unit_id, span).kind(kind).access_type(access_type))
            .await
    }

    /// Validate, commit, then recheck against the index now that the booking
    /// is visible to others. A conflict found by the recheck retracts the
    /// booking again. This is a compensating action, not a lock: two
    /// overlapping requests racing each other may both end up retracted.
    pub async fn reserve(&self, request: NewBooking) -> Result<Ulid, ServiceError> {
        let booking = self.engine.prepare_booking(request).await?;
        let id = booking.id;
        self.engine.commit_booking(booking.clone()).await?;

        if let Err(e) = self.engine.recheck_committed(id).await {
            self.compensate(id, None).await;
            return Err(e.into());
        }
        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "op" => "reserve").increment(1);

        self.access_step(None, &booking).await;
        Ok(id)
    }

    /// Move a booking. On a post-commit conflict the previous times are
    /// restored.
    pub async fn adjust_time(&self, booking_id: Ulid, span: Span) -> Result<(), ServiceError> {
        self.update(booking_id, "adjust_time", |b| b.span = span).await
    }

    pub async fn confirm(&self, booking_id: Ulid) -> Result<(), ServiceError> {
        self.update(booking_id, "state", |b| b.state = BookingState::Confirmed)
            .await
    }

    pub async fn cancel(&self, booking_id: Ulid) -> Result<(), ServiceError> {
        self.update(booking_id, "state", |b| b.state = BookingState::Cancelled)
            .await
    }

    pub async fn deny(&self, booking_id: Ulid) -> Result<(), ServiceError> {
        self.update(booking_id, "state", |b| b.state = BookingState::Denied)
            .await
    }

    pub async fn change_access_type(&self, booking_id: Ulid, access_type: AccessType) -> Result<(), ServiceError> {
        self.update(booking_id, "access_type", |b| b.access_type = access_type)
            .await
    }

    pub async fn change_kind(&self, booking_id: Ulid, kind: BookingKind) -> Result<(), ServiceError> {
        self.update(booking_id, "kind", |b| b.kind = kind).await
    }

    async fn update<F>(&self, booking_id: Ulid, op: &'static str, change: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Booking),
    {
        let previous = self
            .engine
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let next = self.engine.prepare_update(booking_id, change).await?;
        self.engine.commit_booking(next.clone()).await?;

        if next.is_occupying()
            && let Err(e) = self.engine.recheck_committed(booking_id).await
        {
            self.compensate(booking_id, Some(previous)).await;
            return Err(e.into());
        }
        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "op" => op).increment(1);

        self.access_step(Some(&previous), &next).await;
        Ok(())
    }

    /// Undo a commit that the recheck rejected: drop a new booking, or put
    /// an updated one back the way it was.
    async fn compensate(&self, booking_id: Ulid, previous: Option<Booking>) {
        metrics::counter!(crate::observability::RETRACTIONS_TOTAL).increment(1);
        let result = match previous {
            None => self.engine.retract_booking(booking_id).await,
            Some(previous) => match self.engine.restore_booking(previous.clone()).await {
                Ok(Some(_)) => {
                    // Restored but flagged: its code must follow the new state.
                    self.access_step(Some(&previous), &previous).await;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
        };
        match result {
            Ok(()) => warn!(booking = %booking_id, "post-commit recheck found a conflict, change undone"),
            Err(e) => error!(booking = %booking_id, "failed to undo conflicting booking change: {e}"),
        }
    }

    /// Provider trouble never fails the booking change; the sweep picks up
    /// whatever this leaves inconsistent.
    async fn access_step(&self, previous: Option<&Booking>, committed: &Booking) {
        let current = match self.engine.get_booking(&committed.id) {
            Some(current) => current,
            None => return,
        };
        if let Err(e) = self.access.after_booking_change(previous, &current).await {
            error!(booking = %committed.id, "access-code update deferred to sweep: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessCodeConfig, MemoryProvider, ProviderError, ProviderOp};
    use crate::engine::BufferCalculator;
    use std::path::PathBuf;

    /// 2090-01-02T00:00:00Z
    const DAY: Ms = 3_786_998_400_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("resv_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn service(name: &str) -> (BookingService, Arc<MemoryProvider>, Ulid, Ulid) {
        let engine = Arc::new(
            Engine::new(test_wal_path(name), BufferCalculator::new(chrono_tz::UTC)).unwrap(),
        );
        let (hall, room) = (Ulid::new(), Ulid::new());
        engine.create_space(hall, None, None).await.unwrap();
        engine.create_space(room, Some(hall), None).await.unwrap();
        let hall_unit = ReservationUnit::new(Ulid::new()).with_spaces(vec![hall]);
        let room_unit = ReservationUnit::new(Ulid::new()).with_spaces(vec![room]);
        let ids = (hall_unit.id, room_unit.id);
        engine.save_unit(hall_unit).await.unwrap();
        engine.save_unit(room_unit).await.unwrap();
        engine.rebuild_affected_sets().await.unwrap();

        let provider = Arc::new(MemoryProvider::new());
        let access = Arc::new(AccessCodeMachine::new(
            engine.clone(),
            provider.clone(),
            AccessCodeConfig::default(),
        ));
        (BookingService::new(engine, access), provider, ids.0, ids.1)
    }

    fn hours(from: Ms, to: Ms) -> Span {
        Span::new(DAY + from * HOUR_MS, DAY + to * HOUR_MS)
    }

    #[tokio::test]
    async fn reserve_and_conflict() {
        let (svc, _, hall, room) = service("reserve_conflict.wal").await;
        let id = svc
            .validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap();
        let err = svc
            .validate_and_reserve(hall, hours(10, 12), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(c) if c == id));
        assert_eq!(svc.engine().booking_count(), 1);
    }

    #[tokio::test]
    async fn adjust_time_into_conflict_is_rejected() {
        let (svc, _, hall, room) = service("adjust_conflict.wal").await;
        let a = svc
            .validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap();
        let b = svc
            .validate_and_reserve(hall, hours(12, 13), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap();
        assert!(matches!(
            svc.adjust_time(b, hours(10, 12)).await,
            Err(ServiceError::Conflict(c)) if c == a
        ));
        assert_eq!(svc.engine().get_booking(&b).unwrap().span, hours(12, 13));
        svc.adjust_time(b, hours(11, 12)).await.unwrap();
    }

    #[tokio::test]
    async fn provider_outage_does_not_fail_confirmation() {
        let (svc, provider, _, room) = service("outage.wal").await;
        let id = svc
            .validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::AccessCode)
            .await
            .unwrap();
        provider.fail_next(ProviderOp::Create, ProviderError::Transient("down".into()));

        svc.confirm(id).await.unwrap();
        let booking = svc.engine().get_booking(&id).unwrap();
        assert_eq!(booking.state, BookingState::Confirmed);
        assert_eq!(booking.access_code, AccessCodeStatus::NONE);

        let report = svc.access().update_access_code_is_active().await;
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn lifecycle_drives_access_code() {
        let (svc, provider, _, room) = service("lifecycle.wal").await;
        let id = svc
            .validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::AccessCode)
            .await
            .unwrap();
        assert_eq!(provider.total_calls(), 0);

        svc.confirm(id).await.unwrap();
        let target = AccessCodeTarget::Booking(id);
        assert_eq!(
            svc.engine().access_code_status(&target).unwrap().state(),
            AccessCodeState::CodeActive
        );

        svc.change_kind(id, BookingKind::Blocked).await.unwrap();
        assert_eq!(
            svc.engine().access_code_status(&target).unwrap().state(),
            AccessCodeState::CodeInactive
        );

        svc.change_kind(id, BookingKind::Normal).await.unwrap();
        svc.change_access_type(id, AccessType::Unrestricted).await.unwrap();
        assert_eq!(svc.engine().access_code_status(&target).unwrap(), AccessCodeStatus::NONE);
        assert_eq!(provider.calls(ProviderOp::Delete), 1);
    }

    #[tokio::test]
    async fn cancelled_booking_cannot_be_confirmed() {
        let (svc, _, _, room) = service("cancel_final.wal").await;
        let id = svc
            .validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap();
        svc.cancel(id).await.unwrap();
        assert!(matches!(
            svc.confirm(id).await,
            Err(ServiceError::Engine(EngineError::InvalidTransition { .. }))
        ));
        svc.validate_and_reserve(room, hours(10, 11), BookingKind::Normal, AccessType::Unrestricted)
            .await
            .unwrap();
    }
}
