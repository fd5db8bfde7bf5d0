use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::hierarchy::Structure;

/// Source-of-truth tables. Derived indexes live beside it in the engine.
pub struct InMemoryStore {
    spaces: DashMap<Ulid, Space>,
    children: DashMap<Ulid, Vec<Ulid>>,
    resources: DashMap<Ulid, Resource>,
    units: DashMap<Ulid, ReservationUnit>,
    bookings: DashMap<Ulid, Booking>,
    series: DashMap<Ulid, RecurringSeries>,
    allocations: DashMap<Ulid, SeasonalAllocation>,
    /// Group → member booking ids.
    members: DashMap<BookingGroup, Vec<Ulid>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            spaces: DashMap::new(),
            children: DashMap::new(),
            resources: DashMap::new(),
            units: DashMap::new(),
            bookings: DashMap::new(),
            series: DashMap::new(),
            allocations: DashMap::new(),
            members: DashMap::new(),
        }
    }

    // ── Structure ────────────────────────────────────────────

    pub fn get_space(&self, id: &Ulid) -> Option<Space> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn contains_space(&self, id: &Ulid) -> bool {
        self.spaces.contains_key(id)
    }

    pub fn has_children(&self, id: &Ulid) -> bool {
        self.children.get(id).is_some_and(|kids| !kids.is_empty())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<Resource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<ReservationUnit> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub fn contains_unit(&self, id: &Ulid) -> bool {
        self.units.contains_key(id)
    }

    pub fn units(&self) -> Vec<ReservationUnit> {
        self.units.iter().map(|e| e.value().clone()).collect()
    }

    pub fn spaces(&self) -> Vec<Space> {
        self.spaces.iter().map(|e| e.value().clone()).collect()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    /// Any unit that lists the space or resource `id`.
    pub fn is_assigned(&self, id: &Ulid) -> bool {
        self.units
            .iter()
            .any(|u| u.space_ids.contains(id) || u.resource_ids.contains(id))
    }

    /// Point-in-time copy of everything the AffectedSet builder reads.
    pub fn structure(&self) -> Structure {
        Structure {
            spaces: self.spaces(),
            resources: self.resources(),
            units: self.units(),
        }
    }

    // ── Bookings and groups ──────────────────────────────────

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.bookings.iter().map(|e| e.value().clone()).collect()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn get_series(&self, id: &Ulid) -> Option<RecurringSeries> {
        self.series.get(id).map(|e| e.value().clone())
    }

    pub fn contains_series(&self, id: &Ulid) -> bool {
        self.series.contains_key(id)
    }

    pub fn series_ids(&self) -> Vec<Ulid> {
        self.series.iter().map(|e| *e.key()).collect()
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<SeasonalAllocation> {
        self.allocations.get(id).map(|e| e.value().clone())
    }

    pub fn contains_allocation(&self, id: &Ulid) -> bool {
        self.allocations.contains_key(id)
    }

    pub fn allocation_ids(&self) -> Vec<Ulid> {
        self.allocations.iter().map(|e| *e.key()).collect()
    }

    pub fn contains_group(&self, group: &BookingGroup) -> bool {
        match group {
            BookingGroup::Series(id) => self.contains_series(id),
            BookingGroup::Allocation(id) => self.contains_allocation(id),
        }
    }

    pub fn group_access_code(&self, group: &BookingGroup) -> Option<AccessCodeStatus> {
        match group {
            BookingGroup::Series(id) => self.series.get(id).map(|s| s.access_code),
            BookingGroup::Allocation(id) => self.allocations.get(id).map(|a| a.access_code),
        }
    }

    /// Current member bookings of a group (all states).
    pub fn members(&self, group: &BookingGroup) -> Vec<Booking> {
        let ids = self
            .members
            .get(group)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get_booking(id)).collect()
    }

    pub fn unit_has_occupying_bookings(&self, unit_id: &Ulid) -> bool {
        self.bookings
            .iter()
            .any(|b| b.is_occupying() && b.unit_ids.contains(unit_id))
    }

    fn add_member(&self, group: BookingGroup, booking_id: Ulid) {
        let mut ids = self.members.entry(group).or_default();
        if !ids.contains(&booking_id) {
            ids.push(booking_id);
        }
    }

    fn remove_member(&self, group: &BookingGroup, booking_id: &Ulid) {
        if let Some(mut ids) = self.members.get_mut(group) {
            ids.retain(|id| id != booking_id);
        }
    }

    fn record_access_code(&self, target: &AccessCodeTarget, status: AccessCodeStatus) {
        let group = match target {
            AccessCodeTarget::Booking(id) => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.access_code = status;
                }
                return;
            }
            AccessCodeTarget::Series(id) => {
                if let Some(mut s) = self.series.get_mut(id) {
                    s.access_code = status;
                }
                BookingGroup::Series(*id)
            }
            AccessCodeTarget::Allocation(id) => {
                if let Some(mut a) = self.allocations.get_mut(id) {
                    a.access_code = status;
                }
                BookingGroup::Allocation(*id)
            }
        };
        // Members share the group's remote record.
        let ids = self
            .members
            .get(&group)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(mut b) = self.bookings.get_mut(&id) {
                b.access_code = status;
            }
        }
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::SpaceCreated { id, parent_id, name } => {
                self.spaces.insert(
                    *id,
                    Space {
                        id: *id,
                        parent_id: *parent_id,
                        name: name.clone(),
                    },
                );
                if let Some(pid) = parent_id {
                    self.children.entry(*pid).or_default().push(*id);
                }
            }
            Event::SpaceDeleted { id } => {
                if let Some((_, space)) = self.spaces.remove(id)
                    && let Some(pid) = space.parent_id
                    && let Some(mut kids) = self.children.get_mut(&pid)
                {
                    kids.retain(|c| c != id);
                }
                self.children.remove(id);
            }
            Event::ResourceCreated { id, space_id, name } => {
                self.resources.insert(
                    *id,
                    Resource {
                        id: *id,
                        space_id: *space_id,
                        name: name.clone(),
                    },
                );
            }
            Event::ResourceDeleted { id } => {
                self.resources.remove(id);
            }
            Event::UnitSaved { unit } => {
                self.units.insert(unit.id, unit.clone());
            }
            Event::UnitDeleted { id } => {
                self.units.remove(id);
            }
            Event::SeriesCreated { series } => {
                self.series.insert(series.id, series.clone());
            }
            Event::AllocationCreated { allocation } => {
                self.allocations.insert(allocation.id, allocation.clone());
            }
            Event::BookingSaved { booking } => {
                let previous_group = self.bookings.get(&booking.id).and_then(|b| b.group);
                if let Some(old) = previous_group
                    && Some(old) != booking.group
                {
                    self.remove_member(&old, &booking.id);
                }
                let mut booking = booking.clone();
                if let Some(group) = booking.group {
                    self.add_member(group, booking.id);
                    // Members mirror the group's remote record.
                    if let Some(status) = self.group_access_code(&group) {
                        booking.access_code = status;
                    }
                }
                self.bookings.insert(booking.id, booking);
            }
            Event::BookingRetracted { id } => {
                if let Some((_, booking)) = self.bookings.remove(id)
                    && let Some(group) = booking.group
                {
                    self.remove_member(&group, id);
                }
            }
            Event::AccessCodeRecorded { target, status } => {
                self.record_access_code(target, *status);
            }
        }
    }
}
