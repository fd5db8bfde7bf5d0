use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::*;

/// Resolves effective before/after buffers from unit configuration.
///
/// With `block_whole_day` a booking also occupies the rest of its calendar
/// day(s): the before-buffer reaches back to the local midnight starting the
/// day of `begin`, the after-buffer forward to the midnight ending the day
/// of `end`. The larger of that distance and the configured buffer wins.
#[derive(Debug, Clone, Copy)]
pub struct BufferCalculator {
    tz: Tz,
}

impl BufferCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn get_actual_before_buffer(&self, unit: &ReservationUnit, moment: Ms) -> Ms {
        if !unit.block_whole_day {
            return unit.buffer_before;
        }
        match self.day_bounds(moment) {
            Some((day_start, _)) => unit.buffer_before.max(moment - day_start),
            None => unit.buffer_before,
        }
    }

    pub fn get_actual_after_buffer(&self, unit: &ReservationUnit, moment: Ms) -> Ms {
        if !unit.block_whole_day {
            return unit.buffer_after;
        }
        match self.day_bounds(moment) {
            // Ending exactly at midnight leaves nothing of the next day to block.
            Some((day_start, _)) if day_start == moment => unit.buffer_after,
            Some((_, next_day_start)) => unit.buffer_after.max(next_day_start - moment),
            None => unit.buffer_after,
        }
    }

    /// Buffers a booking of `kind` over `span` carries across all its units.
    /// Blocked bookings carry none.
    pub fn effective_buffers(
        &self,
        units: &[ReservationUnit],
        span: &Span,
        kind: BookingKind,
    ) -> (Ms, Ms) {
        if kind == BookingKind::Blocked {
            return (0, 0);
        }
        units.iter().fold((0, 0), |(before, after), unit| {
            (
                before.max(self.get_actual_before_buffer(unit, span.start)),
                after.max(self.get_actual_after_buffer(unit, span.end)),
            )
        })
    }

    /// `(start of local day, start of next local day)` containing `moment`.
    fn day_bounds(&self, moment: Ms) -> Option<(Ms, Ms)> {
        let local = Utc
            .timestamp_millis_opt(moment)
            .single()?
            .with_timezone(&self.tz);
        let date = local.date_naive();
        Some((self.local_midnight(date)?, self.local_midnight(date.succ_opt()?)?))
    }

    fn local_midnight(&self, date: NaiveDate) -> Option<Ms> {
        let naive = date.and_hms_opt(0, 0, 0)?;
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_millis())
    }
}
