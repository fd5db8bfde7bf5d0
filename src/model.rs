use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// `start < end` is the caller's responsibility (debug builds assert
    /// it). Bounds from outside go through `engine::checked_span`.
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen by the given margins: `[start - before, end + after)`.
    pub fn widen(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(*span),
        }
    }
    merged
}

// ── Structure ────────────────────────────────────────────────────

/// A physical area. Spaces form a forest through `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Ulid,
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
}

/// A bookable physical thing, optionally placed in a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub space_id: Option<Ulid>,
    pub name: Option<String>,
}

/// The bookable entity exposed to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationUnit {
    pub id: Ulid,
    pub name: Option<String>,
    pub space_ids: Vec<Ulid>,
    pub resource_ids: Vec<Ulid>,
    /// Default margin reserved before each booking.
    pub buffer_before: Ms,
    /// Default margin reserved after each booking (e.g. cleaning time).
    pub buffer_after: Ms,
    /// Bookings occupy the rest of their calendar day(s).
    pub block_whole_day: bool,
}

impl ReservationUnit {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            name: None,
            space_ids: Vec::new(),
            resource_ids: Vec::new(),
            buffer_before: 0,
            buffer_after: 0,
            block_whole_day: false,
        }
    }

    pub fn with_spaces(mut self, space_ids: Vec<Ulid>) -> Self {
        self.space_ids = space_ids;
        self
    }

    pub fn with_resources(mut self, resource_ids: Vec<Ulid>) -> Self {
        self.resource_ids = resource_ids;
        self
    }

    pub fn with_buffers(mut self, before: Ms, after: Ms) -> Self {
        self.buffer_before = before;
        self.buffer_after = after;
        self
    }

    pub fn with_block_whole_day(mut self, block_whole_day: bool) -> Self {
        self.block_whole_day = block_whole_day;
        self
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    Created,
    Confirmed,
    WaitingForPayment,
    RequiresHandling,
    Cancelled,
    Denied,
}

impl BookingState {
    /// Whether a booking in this state holds capacity.
    pub fn is_occupying(self) -> bool {
        matches!(
            self,
            BookingState::Created
                | BookingState::Confirmed
                | BookingState::WaitingForPayment
                | BookingState::RequiresHandling
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingKind {
    Normal,
    /// Reserves the slot without a customer (maintenance, closures).
    Blocked,
    Staff,
    Behalf,
    Seasonal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    AccessCode,
    Unrestricted,
    PhysicalKey,
    OpenedByStaff,
}

/// Access-code grouping a booking belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingGroup {
    Series(Ulid),
    Allocation(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessCodeState {
    NoCode,
    CodeInactive,
    CodeActive,
}

/// Last known provider state, cached locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCodeStatus {
    pub generated_at: Option<Ms>,
    pub is_active: bool,
}

impl AccessCodeStatus {
    pub const NONE: AccessCodeStatus = AccessCodeStatus {
        generated_at: None,
        is_active: false,
    };

    pub fn state(&self) -> AccessCodeState {
        match (self.generated_at, self.is_active) {
            (None, _) => AccessCodeState::NoCode,
            (Some(_), false) => AccessCodeState::CodeInactive,
            (Some(_), true) => AccessCodeState::CodeActive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Stable reference shared with external systems.
    pub ext_uuid: Uuid,
    pub unit_ids: Vec<Ulid>,
    pub span: Span,
    pub buffer_before: Ms,
    pub buffer_after: Ms,
    pub state: BookingState,
    pub kind: BookingKind,
    pub access_type: AccessType,
    pub group: Option<BookingGroup>,
    pub access_code: AccessCodeStatus,
}

impl Booking {
    /// `[begin - buffer_before, end + buffer_after)`.
    pub fn buffered_span(&self) -> Span {
        self.span.widen(self.buffer_before, self.buffer_after)
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == BookingKind::Blocked
    }

    pub fn is_occupying(&self) -> bool {
        self.state.is_occupying()
    }

    /// Whether this booking on its own calls for an active access code.
    pub fn qualifies_for_access_code(&self) -> bool {
        self.access_type == AccessType::AccessCode
            && self.state == BookingState::Confirmed
            && self.kind != BookingKind::Blocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: Ulid,
    pub ext_uuid: Uuid,
    pub name: Option<String>,
    pub access_code: AccessCodeStatus,
}

/// An application-round time slot grouping many bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalAllocation {
    pub id: Ulid,
    pub ext_uuid: Uuid,
    pub name: Option<String>,
    pub access_code: AccessCodeStatus,
}

/// Anything that can own a remote access code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessCodeTarget {
    Booking(Ulid),
    Series(Ulid),
    Allocation(Ulid),
}

impl AccessCodeTarget {
    pub fn id(&self) -> Ulid {
        match self {
            AccessCodeTarget::Booking(id)
            | AccessCodeTarget::Series(id)
            | AccessCodeTarget::Allocation(id) => *id,
        }
    }

    /// The code owner for a booking: its group if it has one.
    pub fn for_booking(booking: &Booking) -> Self {
        match booking.group {
            Some(BookingGroup::Series(id)) => AccessCodeTarget::Series(id),
            Some(BookingGroup::Allocation(id)) => AccessCodeTarget::Allocation(id),
            None => AccessCodeTarget::Booking(booking.id),
        }
    }
}

impl std::fmt::Display for AccessCodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessCodeTarget::Booking(id) => write!(f, "booking {id}"),
            AccessCodeTarget::Series(id) => write!(f, "series {id}"),
            AccessCodeTarget::Allocation(id) => write!(f, "allocation {id}"),
        }
    }
}

/// One row of the affecting-time-span index: booking `booking_id` occupies
/// capacity on `unit_id` during `buffered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffectingTimeSpan {
    pub booking_id: Ulid,
    pub unit_id: Ulid,
    pub span: Span,
    pub buffered: Span,
    pub is_blocking: bool,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        id: Ulid,
        parent_id: Option<Ulid>,
        name: Option<String>,
    },
    SpaceDeleted {
        id: Ulid,
    },
    ResourceCreated {
        id: Ulid,
        space_id: Option<Ulid>,
        name: Option<String>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    UnitSaved {
        unit: ReservationUnit,
    },
    UnitDeleted {
        id: Ulid,
    },
    SeriesCreated {
        series: RecurringSeries,
    },
    AllocationCreated {
        allocation: SeasonalAllocation,
    },
    BookingSaved {
        booking: Booking,
    },
    BookingRetracted {
        id: Ulid,
    },
    AccessCodeRecorded {
        target: AccessCodeTarget,
        status: AccessCodeStatus,
    },
}

impl Event {
    /// Whether applying this event can change AffectedSets.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Event::SpaceCreated { .. }
                | Event::SpaceDeleted { .. }
                | Event::ResourceCreated { .. }
                | Event::ResourceDeleted { .. }
                | Event::UnitSaved { .. }
                | Event::UnitDeleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(kind: BookingKind, state: BookingState, access_type: AccessType) -> Booking {
        Booking {
            id: Ulid::new(),
            ext_uuid: Uuid::new_v4(),
            unit_ids: vec![Ulid::new()],
            span: Span::new(10 * HOUR_MS, 11 * HOUR_MS),
            buffer_before: 15 * MINUTE_MS,
            buffer_after: 30 * MINUTE_MS,
            state,
            kind,
            access_type,
            group: None,
            access_code: AccessCodeStatus::NONE,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_widen() {
        let s = Span::new(1000, 2000).widen(100, 300);
        assert_eq!(s, Span::new(900, 2300));
        assert_eq!(s.duration_ms(), 1400);
    }

    #[test]
    fn merge_joins_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[
            Span::new(0, 10),
            Span::new(10, 20),
            Span::new(15, 30),
            Span::new(40, 50),
        ]);
        assert_eq!(merged, vec![Span::new(0, 30), Span::new(40, 50)]);
    }

    #[test]
    fn occupying_states() {
        assert!(BookingState::Created.is_occupying());
        assert!(BookingState::Confirmed.is_occupying());
        assert!(BookingState::WaitingForPayment.is_occupying());
        assert!(BookingState::RequiresHandling.is_occupying());
        assert!(!BookingState::Cancelled.is_occupying());
        assert!(!BookingState::Denied.is_occupying());
    }

    #[test]
    fn buffered_span_includes_both_buffers() {
        let b = booking(BookingKind::Normal, BookingState::Confirmed, AccessType::AccessCode);
        assert_eq!(
            b.buffered_span(),
            Span::new(10 * HOUR_MS - 15 * MINUTE_MS, 11 * HOUR_MS + 30 * MINUTE_MS)
        );
    }

    #[test]
    fn access_code_qualification() {
        assert!(booking(BookingKind::Normal, BookingState::Confirmed, AccessType::AccessCode)
            .qualifies_for_access_code());
        assert!(!booking(BookingKind::Blocked, BookingState::Confirmed, AccessType::AccessCode)
            .qualifies_for_access_code());
        assert!(!booking(BookingKind::Normal, BookingState::Created, AccessType::AccessCode)
            .qualifies_for_access_code());
        assert!(!booking(BookingKind::Normal, BookingState::Confirmed, AccessType::Unrestricted)
            .qualifies_for_access_code());
    }

    #[test]
    fn access_code_state_from_status() {
        assert_eq!(AccessCodeStatus::NONE.state(), AccessCodeState::NoCode);
        let inactive = AccessCodeStatus { generated_at: Some(5), is_active: false };
        assert_eq!(inactive.state(), AccessCodeState::CodeInactive);
        let active = AccessCodeStatus { generated_at: Some(5), is_active: true };
        assert_eq!(active.state(), AccessCodeState::CodeActive);
    }

    #[test]
    fn target_for_grouped_booking_is_the_group() {
        let mut b = booking(BookingKind::Seasonal, BookingState::Confirmed, AccessType::AccessCode);
        assert_eq!(AccessCodeTarget::for_booking(&b), AccessCodeTarget::Booking(b.id));
        let series = Ulid::new();
        b.group = Some(BookingGroup::Series(series));
        assert_eq!(AccessCodeTarget::for_booking(&b), AccessCodeTarget::Series(series));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingSaved {
            booking: booking(BookingKind::Normal, BookingState::Created, AccessType::Unrestricted),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
