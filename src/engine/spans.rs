//! Affecting-time-span index: one row per (occupying booking, unit in the
//! AffectedSet of one of its units), carrying the buffered interval.
//!
//! Rows are pre-expanded through the AffectedSet, so a conflict query for a
//! unit only reads that unit's own row list.
//!
//! Maintenance (incremental refresh, full rebuild, pruning) is serialized by
//! one mutex so a full rebuild never overwrites a refresh that raced it.
//! Readers never take that mutex; they read per-unit lists under a shared
//! lock and may observe the index between two refreshes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::hierarchy::AffectedSetIndex;

/// Rows for one unit, sorted by `buffered.start`.
#[derive(Debug, Default)]
pub struct UnitSpans {
    rows: Vec<AffectingTimeSpan>,
}

impl UnitSpans {
    pub fn insert(&mut self, row: AffectingTimeSpan) {
        let pos = self
            .rows
            .partition_point(|r| r.buffered.start <= row.buffered.start);
        self.rows.insert(pos, row);
    }

    pub fn remove_booking(&mut self, booking_id: &Ulid) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| r.booking_id != *booking_id);
        before - self.rows.len()
    }

    /// Rows whose buffered span overlaps `query`. Rows starting at or after
    /// `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &AffectingTimeSpan> {
        let right_bound = self.rows.partition_point(|r| r.buffered.start < query.end);
        self.rows[..right_bound]
            .iter()
            .filter(move |r| r.buffered.end > query.start)
    }

    /// Drop rows whose buffered end has passed; returns the dropped rows.
    pub fn prune(&mut self, now: Ms) -> Vec<AffectingTimeSpan> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.rows.drain(..).partition(|r| r.buffered.end <= now);
        self.rows = live;
        expired
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub type SharedUnitSpans = Arc<RwLock<UnitSpans>>;

/// Expand one booking into its index rows. Non-occupying and fully past
/// bookings expand to nothing.
pub fn expand_booking(
    booking: &Booking,
    affected: &AffectedSetIndex,
    now: Ms,
) -> Vec<AffectingTimeSpan> {
    let buffered = booking.buffered_span();
    if !booking.is_occupying() || buffered.end <= now {
        return Vec::new();
    }
    let mut units: HashSet<Ulid> = HashSet::new();
    for unit_id in &booking.unit_ids {
        units.extend(affected.members(unit_id));
    }
    units
        .into_iter()
        .map(|unit_id| AffectingTimeSpan {
            booking_id: booking.id,
            unit_id,
            span: booking.span,
            buffered,
            is_blocking: booking.is_blocking(),
        })
        .collect()
}

#[derive(Default)]
pub struct AffectingSpanIndex {
    units: DashMap<Ulid, SharedUnitSpans>,
    /// Booking → units currently holding one of its rows.
    by_booking: DashMap<Ulid, Vec<Ulid>>,
    maintenance: Mutex<()>,
}

impl AffectingSpanIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index directly from bookings. Only for construction, before
    /// the index is shared.
    pub fn build(bookings: &[Booking], affected: &AffectedSetIndex, now: Ms) -> Self {
        let index = Self::new();
        for booking in bookings {
            for row in expand_booking(booking, affected, now) {
                index.by_booking.entry(row.booking_id).or_default().push(row.unit_id);
                let unit = index.units.entry(row.unit_id).or_default().clone();
                if let Ok(mut guard) = unit.try_write() {
                    guard.insert(row);
                }
            }
        }
        index
    }

    fn unit(&self, unit_id: &Ulid) -> SharedUnitSpans {
        self.units.entry(*unit_id).or_default().clone()
    }

    async fn remove_rows(&self, booking_id: &Ulid) {
        let Some((_, unit_ids)) = self.by_booking.remove(booking_id) else {
            return;
        };
        for unit_id in unit_ids {
            if let Some(unit) = self.units.get(&unit_id).map(|e| e.value().clone()) {
                unit.write().await.remove_booking(booking_id);
            }
        }
    }

    async fn insert_rows(&self, rows: Vec<AffectingTimeSpan>) {
        for row in rows {
            self.by_booking.entry(row.booking_id).or_default().push(row.unit_id);
            let unit = self.unit(&row.unit_id);
            unit.write().await.insert(row);
        }
    }

    /// Recompute the rows of a single booking. `booking` is read after the
    /// maintenance lock is held, so it reflects the latest committed state.
    pub async fn refresh<F>(&self, booking_id: Ulid, booking: F, affected: &AffectedSetIndex, now: Ms) -> usize
    where
        F: FnOnce() -> Option<Booking>,
    {
        let _maintenance = self.maintenance.lock().await;
        self.remove_rows(&booking_id).await;
        let rows = match booking() {
            Some(b) => expand_booking(&b, affected, now),
            None => Vec::new(),
        };
        let count = rows.len();
        self.insert_rows(rows).await;
        count
    }

    /// Replace every row. `bookings` is snapshotted under the maintenance
    /// lock; each unit's list is swapped in one write.
    pub async fn rebuild<F>(&self, bookings: F, affected: &AffectedSetIndex, now: Ms) -> usize
    where
        F: FnOnce() -> Vec<Booking>,
    {
        let _maintenance = self.maintenance.lock().await;

        let mut fresh: HashMap<Ulid, UnitSpans> = HashMap::new();
        let mut fresh_by_booking: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        let mut total = 0;
        for booking in bookings() {
            for row in expand_booking(&booking, affected, now) {
                fresh_by_booking.entry(row.booking_id).or_default().push(row.unit_id);
                fresh.entry(row.unit_id).or_default().insert(row);
                total += 1;
            }
        }

        let stale_units: Vec<Ulid> = self
            .units
            .iter()
            .map(|e| *e.key())
            .filter(|id| !fresh.contains_key(id))
            .collect();
        for (unit_id, spans) in fresh {
            let unit = self.unit(&unit_id);
            *unit.write().await = spans;
        }
        for unit_id in stale_units {
            if let Some(unit) = self.units.get(&unit_id).map(|e| e.value().clone()) {
                *unit.write().await = UnitSpans::default();
            }
        }

        self.by_booking.clear();
        for (booking_id, unit_ids) in fresh_by_booking {
            self.by_booking.insert(booking_id, unit_ids);
        }
        total
    }

    /// Drop rows whose buffered end is at or before `now`.
    pub async fn prune(&self, now: Ms) -> usize {
        let _maintenance = self.maintenance.lock().await;
        let units: Vec<SharedUnitSpans> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut pruned = 0;
        for unit in units {
            let expired = unit.write().await.prune(now);
            pruned += expired.len();
            for row in expired {
                if let Some(mut ids) = self.by_booking.get_mut(&row.booking_id) {
                    ids.retain(|u| *u != row.unit_id);
                }
            }
        }
        self.by_booking.retain(|_, ids| !ids.is_empty());
        pruned
    }

    /// Rows on `unit_id` whose buffered span overlaps `query`.
    pub async fn overlapping(&self, unit_id: &Ulid, query: &Span) -> Vec<AffectingTimeSpan> {
        let Some(unit) = self.units.get(unit_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = unit.read().await;
        guard.overlapping(query).copied().collect()
    }

    pub async fn rows_for_unit(&self, unit_id: &Ulid) -> Vec<AffectingTimeSpan> {
        let Some(unit) = self.units.get(unit_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = unit.read().await;
        guard.rows.clone()
    }

    pub fn units_for_booking(&self, booking_id: &Ulid) -> Vec<Ulid> {
        self.by_booking
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self) -> usize {
        self.by_booking.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hierarchy::{rebuild_affected_sets, Structure};
    use uuid::Uuid;

    fn row(start: Ms, end: Ms) -> AffectingTimeSpan {
        AffectingTimeSpan {
            booking_id: Ulid::new(),
            unit_id: Ulid::new(),
            span: Span::new(start, end),
            buffered: Span::new(start, end),
            is_blocking: false,
        }
    }

    fn booking(unit_id: Ulid, start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            ext_uuid: Uuid::new_v4(),
            unit_ids: vec![unit_id],
            span: Span::new(start, end),
            buffer_before: 0,
            buffer_after: 0,
            state: BookingState::Confirmed,
            kind: BookingKind::Normal,
            access_type: AccessType::Unrestricted,
            group: None,
            access_code: AccessCodeStatus::NONE,
        }
    }

    /// parent space with one child; unit `outer` on the parent, `inner` on the child.
    fn nested_units() -> (AffectedSetIndex, Ulid, Ulid) {
        let parent = Space { id: Ulid::new(), parent_id: None, name: None };
        let child = Space { id: Ulid::new(), parent_id: Some(parent.id), name: None };
        let outer = ReservationUnit::new(Ulid::new()).with_spaces(vec![parent.id]);
        let inner = ReservationUnit::new(Ulid::new()).with_spaces(vec![child.id]);
        let (outer_id, inner_id) = (outer.id, inner.id);
        let structure = Structure {
            spaces: vec![parent, child],
            resources: Vec::new(),
            units: vec![outer, inner],
        };
        (rebuild_affected_sets(&structure, 1, 0).unwrap(), outer_id, inner_id)
    }

    #[test]
    fn unit_spans_stay_sorted() {
        let mut spans = UnitSpans::default();
        spans.insert(row(300, 400));
        spans.insert(row(100, 200));
        spans.insert(row(200, 300));
        let starts: Vec<Ms> = spans.rows.iter().map(|r| r.buffered.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut spans = UnitSpans::default();
        spans.insert(row(100, 200));
        spans.insert(row(450, 600));
        spans.insert(row(1000, 1100));
        let hits: Vec<_> = spans.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].buffered, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut spans = UnitSpans::default();
        spans.insert(row(100, 200));
        assert_eq!(spans.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn prune_drops_only_finished_rows() {
        let mut spans = UnitSpans::default();
        spans.insert(row(100, 200));
        spans.insert(row(150, 500));
        let expired = spans.prune(200);
        assert_eq!(expired.len(), 1);
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn expansion_covers_affected_set() {
        let (affected, outer, inner) = nested_units();
        let rows = expand_booking(&booking(inner, 1_000, 2_000), &affected, 0);
        let mut units: Vec<Ulid> = rows.iter().map(|r| r.unit_id).collect();
        units.sort();
        let mut expected = vec![outer, inner];
        expected.sort();
        assert_eq!(units, expected);
    }

    #[test]
    fn expansion_skips_cancelled_and_past() {
        let (affected, _, inner) = nested_units();
        let mut cancelled = booking(inner, 1_000, 2_000);
        cancelled.state = BookingState::Cancelled;
        assert!(expand_booking(&cancelled, &affected, 0).is_empty());

        let mut past = booking(inner, 1_000, 2_000);
        past.buffer_after = 500;
        assert!(expand_booking(&past, &affected, 2_500).is_empty());
        assert_eq!(expand_booking(&past, &affected, 2_499).len(), 2);
    }

    #[tokio::test]
    async fn refresh_replaces_rows_of_one_booking() {
        let (affected, outer, inner) = nested_units();
        let index = AffectingSpanIndex::new();
        let mut b = booking(inner, 1_000, 2_000);
        let snapshot = b.clone();
        assert_eq!(index.refresh(b.id, || Some(snapshot), &affected, 0).await, 2);
        assert_eq!(index.row_count(), 2);

        b.span = Span::new(5_000, 6_000);
        let moved = b.clone();
        index.refresh(b.id, || Some(moved), &affected, 0).await;
        assert!(index.overlapping(&outer, &Span::new(1_000, 2_000)).await.is_empty());
        assert_eq!(index.overlapping(&outer, &Span::new(5_500, 5_600)).await.len(), 1);

        index.refresh(b.id, || None, &affected, 0).await;
        assert_eq!(index.row_count(), 0);
        assert!(index.units_for_booking(&b.id).is_empty());
    }

    #[tokio::test]
    async fn rebuild_matches_incremental_state() {
        let (affected, outer, inner) = nested_units();
        let bookings = vec![booking(inner, 1_000, 2_000), booking(outer, 3_000, 4_000)];

        let incremental = AffectingSpanIndex::new();
        for b in &bookings {
            let snapshot = b.clone();
            incremental.refresh(b.id, || Some(snapshot), &affected, 0).await;
        }
        let rebuilt = AffectingSpanIndex::new();
        let snapshot = bookings.clone();
        let total = rebuilt.rebuild(|| snapshot, &affected, 0).await;

        assert_eq!(total, incremental.row_count());
        for unit in [outer, inner] {
            assert_eq!(
                rebuilt.rows_for_unit(&unit).await.len(),
                incremental.rows_for_unit(&unit).await.len()
            );
        }
    }

    #[tokio::test]
    async fn rebuild_clears_units_without_bookings() {
        let (affected, _, inner) = nested_units();
        let index = AffectingSpanIndex::build(&[booking(inner, 1_000, 2_000)], &affected, 0);
        assert_eq!(index.row_count(), 2);
        assert_eq!(index.rebuild(Vec::new, &affected, 0).await, 0);
        assert!(index.rows_for_unit(&inner).await.is_empty());
        assert_eq!(index.row_count(), 0);
    }

    #[tokio::test]
    async fn prune_updates_booking_lookup() {
        let (affected, _, inner) = nested_units();
        let b = booking(inner, 1_000, 2_000);
        let index = AffectingSpanIndex::build(std::slice::from_ref(&b), &affected, 0);
        assert_eq!(index.prune(2_000).await, 2);
        assert!(index.units_for_booking(&b.id).is_empty());
    }
}
