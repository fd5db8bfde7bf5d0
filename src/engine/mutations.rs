use std::collections::HashSet;

use tokio::sync::oneshot;
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError, WalCommand};

/// A booking request before buffers are resolved.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub ext_uuid: Uuid,
    pub unit_ids: Vec<Ulid>,
    pub span: Span,
    pub state: BookingState,
    pub kind: BookingKind,
    pub access_type: AccessType,
    pub group: Option<BookingGroup>,
}

impl NewBooking {
    pub fn new(unit_id: Ulid, span: Span) -> Self {
        Self {
            id: Ulid::new(),
            ext_uuid: Uuid::new_v4(),
            unit_ids: vec![unit_id],
            span,
            state: BookingState::Created,
            kind: BookingKind::Normal,
            access_type: AccessType::Unrestricted,
            group: None,
        }
    }

    pub fn kind(mut self, kind: BookingKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn state(mut self, state: BookingState) -> Self {
        self.state = state;
        self
    }

    pub fn access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }

    pub fn group(mut self, group: BookingGroup) -> Self {
        self.group = Some(group);
        self
    }
}

fn check_name(name: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Cancelled and denied bookings are final.
fn check_transition(booking: &Booking, to: BookingState) -> Result<(), EngineError> {
    if booking.state != to && !booking.state.is_occupying() {
        return Err(EngineError::InvalidTransition {
            id: booking.id,
            from: booking.state,
            to,
        });
    }
    Ok(())
}

impl Engine {
    // ── Structure ────────────────────────────────────────────

    pub async fn create_space(
        &self,
        id: Ulid,
        parent_id: Option<Ulid>,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        check_name(&name, "space name too long")?;
        if self.store.contains_space(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(pid) = parent_id {
            if pid == id {
                return Err(EngineError::CycleDetected(id));
            }
            let mut depth = 0usize;
            let mut current = Some(pid);
            while let Some(cid) = current {
                depth += 1;
                if depth > MAX_HIERARCHY_DEPTH {
                    return Err(EngineError::LimitExceeded("hierarchy too deep"));
                }
                let space = self.store.get_space(&cid).ok_or(EngineError::NotFound(cid))?;
                current = space.parent_id;
            }
        }
        self.persist(&Event::SpaceCreated { id, parent_id, name }).await
    }

    pub async fn delete_space(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_space(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.has_children(&id) {
            return Err(EngineError::HasChildren(id));
        }
        let holds_resource = self.store.resources().iter().any(|r| r.space_id == Some(id));
        if holds_resource || self.store.is_assigned(&id) {
            return Err(EngineError::InUse(id));
        }
        self.persist(&Event::SpaceDeleted { id }).await
    }

    pub async fn create_resource(
        &self,
        id: Ulid,
        space_id: Option<Ulid>,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        check_name(&name, "resource name too long")?;
        if self.store.contains_resource(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(sid) = space_id
            && !self.store.contains_space(&sid)
        {
            return Err(EngineError::NotFound(sid));
        }
        self.persist(&Event::ResourceCreated { id, space_id, name }).await
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_resource(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.is_assigned(&id) {
            return Err(EngineError::InUse(id));
        }
        self.persist(&Event::ResourceDeleted { id }).await
    }

    /// Create or replace a reservation unit. Its AffectedSet follows at the
    /// next index rebuild.
    pub async fn save_unit(&self, unit: ReservationUnit) -> Result<(), EngineError> {
        check_name(&unit.name, "unit name too long")?;
        if unit.space_ids.len() > MAX_SPACES_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many spaces on unit"));
        }
        if unit.resource_ids.len() > MAX_RESOURCES_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many resources on unit"));
        }
        if !(0..=MAX_BUFFER_MS).contains(&unit.buffer_before)
            || !(0..=MAX_BUFFER_MS).contains(&unit.buffer_after)
        {
            return Err(EngineError::LimitExceeded("buffer out of range"));
        }
        if let Some(missing) = unit.space_ids.iter().find(|s| !self.store.contains_space(s)) {
            return Err(EngineError::NotFound(*missing));
        }
        if let Some(missing) = unit
            .resource_ids
            .iter()
            .find(|r| !self.store.contains_resource(r))
        {
            return Err(EngineError::NotFound(*missing));
        }
        self.persist(&Event::UnitSaved { unit }).await
    }

    pub async fn delete_unit(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.store.contains_unit(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.unit_has_occupying_bookings(&id) {
            return Err(EngineError::InUse(id));
        }
        self.persist(&Event::UnitDeleted { id }).await
    }

    pub async fn create_series(&self, series: RecurringSeries) -> Result<(), EngineError> {
        check_name(&series.name, "series name too long")?;
        if self.store.contains_series(&series.id) {
            return Err(EngineError::AlreadyExists(series.id));
        }
        self.persist(&Event::SeriesCreated { series }).await
    }

    pub async fn create_allocation(&self, allocation: SeasonalAllocation) -> Result<(), EngineError> {
        check_name(&allocation.name, "allocation name too long")?;
        if self.store.contains_allocation(&allocation.id) {
            return Err(EngineError::AlreadyExists(allocation.id));
        }
        self.persist(&Event::AllocationCreated { allocation }).await
    }

    // ── Bookings: validate ───────────────────────────────────

    fn resolve_units(&self, unit_ids: &[Ulid]) -> Result<Vec<ReservationUnit>, EngineError> {
        if unit_ids.is_empty() {
            return Err(EngineError::LimitExceeded("booking has no reservation unit"));
        }
        if unit_ids.len() > MAX_UNITS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many units on booking"));
        }
        unit_ids
            .iter()
            .map(|id| self.store.get_unit(id).ok_or(EngineError::NotFound(*id)))
            .collect()
    }

    /// Resolve buffers for `request` and check it against the index. Nothing
    /// is written; the returned booking is ready for [`Engine::commit_booking`].
    pub async fn prepare_booking(&self, request: NewBooking) -> Result<Booking, EngineError> {
        validate_span(&request.span)?;
        if self.store.get_booking(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if let Some(group) = request.group
            && !self.store.contains_group(&group)
        {
            return Err(EngineError::NotFound(match group {
                BookingGroup::Series(id) | BookingGroup::Allocation(id) => id,
            }));
        }
        let units = self.resolve_units(&request.unit_ids)?;
        let (buffer_before, buffer_after) =
            self.buffers.effective_buffers(&units, &request.span, request.kind);

        let booking = Booking {
            id: request.id,
            ext_uuid: request.ext_uuid,
            unit_ids: request.unit_ids,
            span: request.span,
            buffer_before,
            buffer_after,
            state: request.state,
            kind: request.kind,
            access_type: request.access_type,
            group: request.group,
            access_code: AccessCodeStatus::NONE,
        };
        self.check_candidate(&booking, &[]).await?;
        Ok(booking)
    }

    /// Apply `change` to a copy of a committed booking and validate the
    /// result. Buffers are re-resolved when time, units, or kind change; the
    /// conflict check runs only when the occupied footprint can have grown.
    pub async fn prepare_update<F>(&self, id: Ulid, change: F) -> Result<Booking, EngineError>
    where
        F: FnOnce(&mut Booking),
    {
        let current = self.store.get_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut next = current.clone();
        change(&mut next);
        next.id = current.id;
        next.ext_uuid = current.ext_uuid;
        check_transition(&current, next.state)?;
        validate_span(&next.span)?;

        let footprint_changed = next.span != current.span
            || next.unit_ids != current.unit_ids
            || next.kind != current.kind;
        if footprint_changed {
            let units = self.resolve_units(&next.unit_ids)?;
            let (before, after) = self.buffers.effective_buffers(&units, &next.span, next.kind);
            next.buffer_before = before;
            next.buffer_after = after;
        }
        if next.is_occupying() && (footprint_changed || !current.is_occupying()) {
            self.check_candidate(&next, &[id]).await?;
        }
        Ok(next)
    }

    // ── Bookings: commit and compensate ──────────────────────

    /// Durably write a booking (insert or update) and refresh its index rows.
    pub async fn commit_booking(&self, booking: Booking) -> Result<(), EngineError> {
        validate_span(&booking.span)?;
        let id = booking.id;
        self.persist(&Event::BookingSaved { booking }).await?;
        self.refresh_affecting_time_spans(id).await;
        Ok(())
    }

    /// Remove a booking written by [`Engine::commit_booking`]. Used as the
    /// compensating action when the post-commit recheck finds a conflict.
    pub async fn retract_booking(&self, id: Ulid) -> Result<(), EngineError> {
        if self.store.get_booking(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist(&Event::BookingRetracted { id }).await?;
        self.refresh_affecting_time_spans(id).await;
        Ok(())
    }

    /// Put a booking back the way it was before an update the recheck
    /// rejected. Its old slot may have been taken while it was away; then
    /// the booking is restored as `RequiresHandling` and the booking now
    /// holding the slot is returned.
    pub async fn restore_booking(&self, previous: Booking) -> Result<Option<Ulid>, EngineError> {
        let id = previous.id;
        let occupying = previous.is_occupying();
        self.commit_booking(previous).await?;
        if !occupying {
            return Ok(None);
        }
        match self.recheck_committed(id).await {
            Ok(()) => Ok(None),
            Err(EngineError::Conflict(holder)) => {
                let mut flagged = self.store.get_booking(&id).ok_or(EngineError::NotFound(id))?;
                flagged.state = BookingState::RequiresHandling;
                self.commit_booking(flagged).await?;
                metrics::counter!(crate::observability::RESTORE_CONFLICTS_TOTAL).increment(1);
                tracing::warn!(booking = %id, %holder, "old slot taken during rejected update, booking needs handling");
                Ok(Some(holder))
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the provider's last reported state for an access-code owner.
    /// Group records cascade to every member booking.
    pub async fn record_access_code(
        &self,
        target: AccessCodeTarget,
        status: AccessCodeStatus,
    ) -> Result<(), EngineError> {
        let exists = match target {
            AccessCodeTarget::Booking(id) => self.store.get_booking(&id).is_some(),
            AccessCodeTarget::Series(id) => self.store.contains_series(&id),
            AccessCodeTarget::Allocation(id) => self.store.contains_allocation(&id),
        };
        if !exists {
            return Err(EngineError::NotFound(target.id()));
        }
        self.persist(&Event::AccessCodeRecorded { target, status }).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with the minimal events that recreate current state:
    /// spaces parent-first, then resources, units, groups, bookings.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let spaces = self.store.spaces();
        let mut events = Vec::with_capacity(spaces.len() + self.store.booking_count());

        let mut emitted = HashSet::new();
        for space in &spaces {
            let mut chain = Vec::new();
            let mut current = Some(space.clone());
            while let Some(s) = current {
                if emitted.contains(&s.id) || chain.iter().any(|c: &Space| c.id == s.id) {
                    break;
                }
                current = s.parent_id.and_then(|pid| self.store.get_space(&pid));
                chain.push(s);
            }
            for s in chain.into_iter().rev() {
                emitted.insert(s.id);
                events.push(Event::SpaceCreated {
                    id: s.id,
                    parent_id: s.parent_id,
                    name: s.name,
                });
            }
        }
        for r in self.store.resources() {
            events.push(Event::ResourceCreated {
                id: r.id,
                space_id: r.space_id,
                name: r.name,
            });
        }
        for unit in self.store.units() {
            events.push(Event::UnitSaved { unit });
        }
        for series in self.store.series_ids().iter().filter_map(|id| self.store.get_series(id)) {
            events.push(Event::SeriesCreated { series });
        }
        for allocation in self
            .store
            .allocation_ids()
            .iter()
            .filter_map(|id| self.store.get_allocation(id))
        {
            events.push(Event::AllocationCreated { allocation });
        }
        for booking in self.store.bookings() {
            events.push(Event::BookingSaved { booking });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
