use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Build a span from untrusted bounds. Unlike [`Span::new`] this never
/// panics; bad input comes back as `InvalidSpan` or `LimitExceeded`.
pub fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span { start, end };
    validate_span(&span)?;
    Ok(span)
}

/// Does an existing row conflict with a candidate?
///
/// Blocking bookings stack freely on each other. Every other pairing
/// compares buffered spans, so a blocked booking can never sit inside a
/// normal booking's buffer and vice versa.
pub(crate) fn row_conflicts(row: &AffectingTimeSpan, buffered: &Span, is_blocking: bool) -> bool {
    if is_blocking && row.is_blocking {
        return false;
    }
    row.buffered.overlaps(buffered)
}

impl Engine {
    /// First booking in the index that conflicts with a candidate on `unit_id`.
    pub async fn find_overlapping_reservation(
        &self,
        unit_id: &Ulid,
        span: &Span,
        buffer_before: Ms,
        buffer_after: Ms,
        is_blocking: bool,
        ignore_ids: &[Ulid],
    ) -> Option<Ulid> {
        let buffered = span.widen(buffer_before, buffer_after);
        self.spans
            .overlapping(unit_id, &buffered)
            .await
            .iter()
            .filter(|row| !ignore_ids.contains(&row.booking_id))
            .find(|row| row_conflicts(row, &buffered, is_blocking))
            .map(|row| row.booking_id)
    }

    /// Whether any occupying booking on a unit in `unit_id`'s AffectedSet
    /// overlaps `[begin - buffer_before, end + buffer_after)`.
    ///
    /// Reads the affecting-time-span index without locking it against
    /// writers. A booking validated concurrently with another may pass this
    /// check before the other is indexed; callers close that window by
    /// calling [`Engine::recheck_committed`] after committing and retracting
    /// on conflict.
    pub async fn has_overlapping_reservations(
        &self,
        unit_id: &Ulid,
        span: &Span,
        buffer_before: Ms,
        buffer_after: Ms,
        is_blocking: bool,
        ignore_ids: &[Ulid],
    ) -> bool {
        self.find_overlapping_reservation(unit_id, span, buffer_before, buffer_after, is_blocking, ignore_ids)
            .await
            .is_some()
    }

    /// Validate a candidate booking against every unit it occupies.
    pub async fn check_candidate(&self, booking: &Booking, ignore_ids: &[Ulid]) -> Result<(), EngineError> {
        if !booking.is_occupying() {
            return Ok(());
        }
        for unit_id in &booking.unit_ids {
            if let Some(conflicting) = self
                .find_overlapping_reservation(
                    unit_id,
                    &booking.span,
                    booking.buffer_before,
                    booking.buffer_after,
                    booking.is_blocking(),
                    ignore_ids,
                )
                .await
            {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                tracing::debug!(booking = %booking.id, %conflicting, unit = %unit_id, "overlap detected");
                return Err(EngineError::Conflict(conflicting));
            }
        }
        Ok(())
    }

    /// Post-commit re-verification of an already indexed booking.
    pub async fn recheck_committed(&self, booking_id: Ulid) -> Result<(), EngineError> {
        let booking = self
            .store
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        self.check_candidate(&booking, &[booking_id]).await
    }
}
