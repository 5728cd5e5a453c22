//! Broadcast slot alignment: programs start on clean clock boundaries.

use chrono::{Days, NaiveDateTime, NaiveTime, TimeDelta, Timelike};

/// A program's time allocation: it starts at `start` and the next program
/// starts at `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub deadline: NaiveDateTime,
}

impl Slot {
    /// Total airtime of the slot, program plus breaks.
    pub fn block(&self) -> TimeDelta {
        self.deadline - self.start
    }
}

/// `marker`'s date shifted by `day_offset`, at `hour:minute:00`.
fn boundary(marker: NaiveDateTime, day_offset: u64, hour: u32, minute: u32) -> NaiveDateTime {
    let date = marker
        .date()
        .checked_add_days(Days::new(day_offset))
        .unwrap_or(marker.date());
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    date.and_time(time)
}

/// `minute` past the hour after `marker`'s hour; 23 rolls into tomorrow.
fn next_hour_at(marker: NaiveDateTime, minute: u32) -> NaiveDateTime {
    match marker.hour() {
        23 => boundary(marker, 1, 0, minute),
        h => boundary(marker, 0, h + 1, minute),
    }
}

/// Next boundary for a TV program starting at `marker`.
///
/// Short programs (< 30 min) get the next half-hour mark. Long programs
/// starting in the first half of the hour get the top of the next hour,
/// otherwise the next hour's half-past mark.
pub fn next_tv_boundary(marker: NaiveDateTime, runtime: TimeDelta) -> NaiveDateTime {
    let minute = marker.minute();
    if runtime < TimeDelta::minutes(30) {
        if minute < 30 {
            boundary(marker, 0, marker.hour(), 30)
        } else {
            next_hour_at(marker, 0)
        }
    } else if minute < 30 {
        next_hour_at(marker, 0)
    } else {
        next_hour_at(marker, 30)
    }
}

/// Next `:00` or `:30` strictly after the current half hour.
pub fn next_half_hour(marker: NaiveDateTime) -> NaiveDateTime {
    if marker.minute() < 30 {
        boundary(marker, 0, marker.hour(), 30)
    } else {
        next_hour_at(marker, 0)
    }
}

/// Next quarter-hour showtime leaving a 15-30 minute intermission.
pub fn next_quarter_showtime(marker: NaiveDateTime) -> NaiveDateTime {
    match marker.minute() {
        0..=15 => boundary(marker, 0, marker.hour(), 30),
        16..=30 => boundary(marker, 0, marker.hour(), 45),
        31..=45 => next_hour_at(marker, 0),
        _ => next_hour_at(marker, 15),
    }
}

/// Slot for a program of `runtime` starting at `marker`: the aligned boundary
/// pushed forward in half-hour steps until the program fits.
pub fn plan_slot(marker: NaiveDateTime, runtime: TimeDelta) -> Slot {
    let content_end = marker + runtime;
    let mut deadline = next_tv_boundary(marker, runtime);
    while deadline < content_end {
        deadline += TimeDelta::minutes(30);
    }
    Slot {
        start: marker,
        deadline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn next_day(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn short_program_rounds_to_half_hour() {
        let runtime = TimeDelta::minutes(22);
        assert_eq!(next_tv_boundary(at(20, 0, 0), runtime), at(20, 30, 0));
        assert_eq!(next_tv_boundary(at(20, 29, 59), runtime), at(20, 30, 0));
        assert_eq!(next_tv_boundary(at(20, 30, 0), runtime), at(21, 0, 0));
        assert_eq!(next_tv_boundary(at(20, 45, 10), runtime), at(21, 0, 0));
    }

    #[test]
    fn long_program_rounds_to_hour_or_half_past() {
        let runtime = TimeDelta::minutes(44);
        assert_eq!(next_tv_boundary(at(20, 0, 0), runtime), at(21, 0, 0));
        assert_eq!(next_tv_boundary(at(20, 31, 0), runtime), at(21, 30, 0));
    }

    #[test]
    fn hour_23_rolls_to_next_day() {
        assert_eq!(
            next_tv_boundary(at(23, 40, 0), TimeDelta::minutes(22)),
            next_day(0, 0)
        );
        assert_eq!(
            next_tv_boundary(at(23, 10, 0), TimeDelta::minutes(44)),
            next_day(0, 0)
        );
        assert_eq!(
            next_tv_boundary(at(23, 35, 0), TimeDelta::minutes(44)),
            next_day(0, 30)
        );
        assert_eq!(next_half_hour(at(23, 59, 59)), next_day(0, 0));
        assert_eq!(next_quarter_showtime(at(23, 50, 0)), next_day(0, 15));
    }

    #[test]
    fn quarter_showtime_table() {
        assert_eq!(next_quarter_showtime(at(10, 0, 0)), at(10, 30, 0));
        assert_eq!(next_quarter_showtime(at(10, 15, 59)), at(10, 30, 0));
        assert_eq!(next_quarter_showtime(at(10, 16, 0)), at(10, 45, 0));
        assert_eq!(next_quarter_showtime(at(10, 30, 0)), at(10, 45, 0));
        assert_eq!(next_quarter_showtime(at(10, 31, 0)), at(11, 0, 0));
        assert_eq!(next_quarter_showtime(at(10, 46, 0)), at(11, 15, 0));
    }

    #[test]
    fn plan_slot_pushes_deadline_past_long_content() {
        let slot = plan_slot(at(20, 0, 0), TimeDelta::minutes(95));
        assert_eq!(slot.deadline, at(21, 30, 0) + TimeDelta::minutes(30));
        assert!(slot.deadline >= slot.start + TimeDelta::minutes(95));
    }

    #[test]
    fn plan_slot_short_episode_gets_half_hour_block() {
        let slot = plan_slot(at(20, 0, 0), TimeDelta::minutes(22));
        assert_eq!(slot.deadline, at(20, 30, 0));
        assert_eq!(slot.block(), TimeDelta::minutes(30));
    }

    #[test]
    fn plan_slot_late_marker_still_fits() {
        // 25 minutes of content starting at :20 cannot end by :30
        let slot = plan_slot(at(20, 20, 0), TimeDelta::minutes(25));
        assert_eq!(slot.deadline, at(21, 0, 0));
    }
}
