//! Access-code owners resolved once at the call boundary: a single booking,
//! a recurring series, or a seasonal allocation, with the member bookings
//! that decide its desired state.

use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::model::*;

use super::provider::{EntityKind, EntityRef, ValidityWindow};

#[derive(Debug, Clone)]
pub struct AccessCodeEntity {
    pub target: AccessCodeTarget,
    pub remote: EntityRef,
    /// Last known provider state.
    pub status: AccessCodeStatus,
    /// The booking itself for a single booking; current members for a group.
    pub members: Vec<Booking>,
}

/// Separately reported signals; the sweep logs these but never folds them
/// into `should_be_active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCodeDiagnostics {
    pub should_be_active: bool,
    pub remote_is_active: bool,
    pub is_access_code_is_active_correct: bool,
    /// Some relevant members qualify for an active code and some do not.
    pub mixed: bool,
}

impl AccessCodeEntity {
    /// Load the owner of `target`. A grouped booking resolves to its group,
    /// since members share the group's remote record.
    pub fn resolve(engine: &Engine, target: AccessCodeTarget) -> Option<Self> {
        let target = match target {
            AccessCodeTarget::Booking(id) => AccessCodeTarget::for_booking(&engine.get_booking(&id)?),
            other => other,
        };
        let (kind, uuid, status, members) = match target {
            AccessCodeTarget::Booking(id) => {
                let booking = engine.get_booking(&id)?;
                (EntityKind::Reservation, booking.ext_uuid, booking.access_code, vec![booking])
            }
            AccessCodeTarget::Series(id) => {
                let series = engine.get_series(&id)?;
                let members = engine.group_members(&BookingGroup::Series(id));
                (EntityKind::Series, series.ext_uuid, series.access_code, members)
            }
            AccessCodeTarget::Allocation(id) => {
                let allocation = engine.get_allocation(&id)?;
                let members = engine.group_members(&BookingGroup::Allocation(id));
                (EntityKind::SeasonalBooking, allocation.ext_uuid, allocation.access_code, members)
            }
        };
        Some(Self {
            target,
            remote: EntityRef { kind, uuid },
            status,
            members,
        })
    }

    pub fn is_group(&self) -> bool {
        !matches!(self.target, AccessCodeTarget::Booking(_))
    }

    /// Members that count toward the desired state. Groups only consider
    /// occupying occurrences that have not ended yet.
    fn relevant_members(&self, now: Ms) -> impl Iterator<Item = &Booking> {
        let is_group = self.is_group();
        self.members
            .iter()
            .filter(move |b| !is_group || (b.is_occupying() && b.span.end > now))
    }

    /// Derived, never stored. A booking needs an active code when it is a
    /// confirmed, non-blocked access-code booking; a group when any relevant
    /// member does.
    pub fn should_be_active(&self, now: Ms) -> bool {
        self.relevant_members(now).any(|b| b.qualifies_for_access_code())
    }

    /// Whether any relevant member still uses access codes at all. When none
    /// does, an existing remote code has no owner left.
    pub fn uses_access_codes(&self, now: Ms) -> bool {
        self.relevant_members(now)
            .any(|b| b.access_type == AccessType::AccessCode && b.is_occupying())
    }

    pub fn is_mixed(&self, now: Ms) -> bool {
        if !self.is_group() {
            return false;
        }
        let (mut qualifying, mut other) = (false, false);
        for b in self.relevant_members(now) {
            if b.qualifies_for_access_code() {
                qualifying = true;
            } else {
                other = true;
            }
        }
        qualifying && other
    }

    pub fn diagnostics(&self, now: Ms) -> AccessCodeDiagnostics {
        let should_be_active = self.should_be_active(now);
        let remote_is_active = self.status.is_active;
        AccessCodeDiagnostics {
            should_be_active,
            remote_is_active,
            is_access_code_is_active_correct: should_be_active == remote_is_active,
            mixed: self.is_mixed(now),
        }
    }

    /// Windows the code is valid in: each access-code member's
    /// `[begin - lead, end + trail]`, sorted and merged.
    pub fn validity_windows(&self, lead: Ms, trail: Ms, now: Ms) -> Vec<ValidityWindow> {
        let mut spans: Vec<Span> = self
            .relevant_members(now)
            .filter(|b| b.access_type == AccessType::AccessCode && b.is_occupying())
            .map(|b| b.span.widen(lead, trail))
            .collect();
        spans.sort_by_key(|s| s.start);
        merge_overlapping(&spans)
            .into_iter()
            .filter_map(|s| {
                Some(ValidityWindow {
                    begin: DateTime::<Utc>::from_timestamp_millis(s.start)?,
                    end: DateTime::<Utc>::from_timestamp_millis(s.end)?,
                })
            })
            .collect()
    }
}
