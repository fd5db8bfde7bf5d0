use ulid::Ulid;

use crate::model::*;

use super::Engine;
use super::conflict::now_ms;

impl Engine {
    pub fn get_space(&self, id: &Ulid) -> Option<Space> {
        self.store.get_space(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<Resource> {
        self.store.get_resource(id)
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<ReservationUnit> {
        self.store.get_unit(id)
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.store.get_booking(id)
    }

    pub fn get_series(&self, id: &Ulid) -> Option<RecurringSeries> {
        self.store.get_series(id)
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<SeasonalAllocation> {
        self.store.get_allocation(id)
    }

    pub fn booking_count(&self) -> usize {
        self.store.booking_count()
    }

    /// Member bookings of a series or allocation, in every state.
    pub fn group_members(&self, group: &BookingGroup) -> Vec<Booking> {
        self.store.members(group)
    }

    /// Cached provider state of an access-code owner; `None` if the owner
    /// does not exist.
    pub fn access_code_status(&self, target: &AccessCodeTarget) -> Option<AccessCodeStatus> {
        match target {
            AccessCodeTarget::Booking(id) => self.store.get_booking(id).map(|b| b.access_code),
            AccessCodeTarget::Series(id) => self.store.get_series(id).map(|s| s.access_code),
            AccessCodeTarget::Allocation(id) => {
                self.store.get_allocation(id).map(|a| a.access_code)
            }
        }
    }

    /// Externally-stable reference of an access-code owner.
    pub fn ext_uuid(&self, target: &AccessCodeTarget) -> Option<uuid::Uuid> {
        match target {
            AccessCodeTarget::Booking(id) => self.store.get_booking(id).map(|b| b.ext_uuid),
            AccessCodeTarget::Series(id) => self.store.get_series(id).map(|s| s.ext_uuid),
            AccessCodeTarget::Allocation(id) => self.store.get_allocation(id).map(|a| a.ext_uuid),
        }
    }

    /// Every entity the reconciliation sweep has to look at: each series and
    /// allocation, plus each ungrouped booking that either uses access codes
    /// or still has a remote code on record.
    pub fn access_code_targets(&self) -> Vec<AccessCodeTarget> {
        let now = now_ms();
        let mut targets: Vec<AccessCodeTarget> = self
            .store
            .series_ids()
            .into_iter()
            .map(AccessCodeTarget::Series)
            .collect();
        targets.extend(
            self.store
                .allocation_ids()
                .into_iter()
                .map(AccessCodeTarget::Allocation),
        );
        targets.extend(
            self.store
                .bookings()
                .into_iter()
                .filter(|b| b.group.is_none())
                // Finished bookings without a code have nothing left to converge.
                .filter(|b| {
                    b.access_code.generated_at.is_some()
                        || (b.access_type == AccessType::AccessCode && b.span.end > now)
                })
                .map(|b| AccessCodeTarget::Booking(b.id)),
        );
        targets
    }

    /// Units whose bookings occupy the same capacity as `unit_id`, as seen
    /// by the index currently serving reads.
    pub async fn affected_set(&self, unit_id: &Ulid) -> Vec<Ulid> {
        let mut members = self.affected_index().await.members(unit_id);
        members.sort();
        members
    }

    pub async fn affecting_time_spans(&self, unit_id: &Ulid) -> Vec<AffectingTimeSpan> {
        self.spans.rows_for_unit(unit_id).await
    }

    pub fn affecting_span_units(&self, booking_id: &Ulid) -> Vec<Ulid> {
        self.spans.units_for_booking(booking_id)
    }

    pub fn affecting_span_rows(&self) -> usize {
        self.spans.row_count()
    }
}
