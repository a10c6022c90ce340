//! Local wall-clock ↔ absolute instant conversion, candidate slot generation
//! and the lunch-break end-time rule.
//!
//! Everything that interprets business hours or the lunch window goes through
//! the tenant's IANA zone here; the rest of the engine only sees `Ms`.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::{MINUTE, Ms, Span};

use super::error::SlotRejection;
use super::settings::{TenantSettings, minute_of_day};

pub fn to_local(tz: Tz, t: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&tz).naive_local())
}

/// Ambiguous local times (DST fall-back) resolve to the earliest instant;
/// non-existent ones (spring-forward gap) yield `None`.
pub fn from_local(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

fn time_at_minute(minute: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(minute / 60, minute % 60, 0)
}

/// Instant of `minute` minutes after local midnight on `day`.
pub fn local_instant(settings: &TenantSettings, day: NaiveDate, minute: u32) -> Option<Ms> {
    from_local(settings.timezone, day.and_time(time_at_minute(minute)?))
}

pub fn local_date(settings: &TenantSettings, t: Ms) -> Option<NaiveDate> {
    to_local(settings.timezone, t).map(|dt| dt.date())
}

/// Absolute bounds of a local calendar day.
pub fn day_span(settings: &TenantSettings, day: NaiveDate) -> Option<Span> {
    let next = day.checked_add_days(Days::new(1))?;
    let start = start_of_day(settings.timezone, day)?;
    let end = start_of_day(settings.timezone, next)?;
    Some(Span::new(start, end))
}

fn start_of_day(tz: Tz, day: NaiveDate) -> Option<Ms> {
    // A few zones skip local midnight on DST day; the day then starts at 01:00.
    from_local(tz, day.and_time(time_at_minute(0)?))
        .or_else(|| from_local(tz, day.and_time(time_at_minute(60)?)))
}

/// Business hours of `day` as absolute instants `[opening, closing)`.
pub fn business_hours(settings: &TenantSettings, day: NaiveDate) -> Option<Span> {
    let open = local_instant(settings, day, settings.opening_minute())?;
    let close = local_instant(settings, day, settings.closing_minute())?;
    (open < close).then(|| Span::new(open, close))
}

/// Every candidate start on `day`: opening time inclusive, closing time
/// exclusive, one per slot interval. A trailing partial step is dropped.
pub fn generate(day: NaiveDate, settings: &TenantSettings) -> Vec<Ms> {
    let open = settings.opening_minute();
    let close = settings.closing_minute();
    let step = settings.slot_interval_minutes.max(1) as usize;
    (open..close)
        .step_by(step)
        .filter_map(|minute| local_instant(settings, day, minute))
        .collect()
}

/// True if `start` begins within the lunch window `[lunch_start, lunch_end)`.
pub fn starts_in_lunch(settings: &TenantSettings, start: Ms) -> bool {
    match to_local(settings.timezone, start) {
        Some(local) => {
            let minute = minute_of_day(local.time());
            minute >= settings.lunch_start_minute() && minute < settings.lunch_end_minute()
        }
        None => false,
    }
}

/// Real end of a job of `duration_minutes` starting at `start`.
///
/// A job that starts before the break and would run past its start absorbs
/// the whole break as dead time. Jobs cannot start inside the break.
pub fn real_end(
    settings: &TenantSettings,
    start: Ms,
    duration_minutes: u32,
) -> Result<Ms, SlotRejection> {
    let local = to_local(settings.timezone, start).ok_or(SlotRejection::OutsideBusinessHours)?;
    let start_minute = minute_of_day(local.time());
    let theoretical_end_minute = start_minute
        .checked_add(duration_minutes)
        .ok_or(SlotRejection::OutsideBusinessHours)?;
    let lunch_start = settings.lunch_start_minute();

    if start_minute >= lunch_start && start_minute < settings.lunch_end_minute() {
        return Err(SlotRejection::DuringLunch);
    }

    let theoretical_end = start + Ms::from(duration_minutes) * MINUTE;
    if start_minute < lunch_start && theoretical_end_minute > lunch_start {
        Ok(theoretical_end + Ms::from(settings.lunch_minutes()) * MINUTE)
    } else {
        Ok(theoretical_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;
    use proptest::prelude::*;

    fn settings(tz: Tz, open_h: u32, close_h: u32, interval: u32) -> TenantSettings {
        TenantSettings {
            opening_time: NaiveTime::from_hms_opt(open_h, 0, 0).unwrap(),
            closing_time: NaiveTime::from_hms_opt(close_h, 0, 0).unwrap(),
            slot_interval_minutes: interval,
            max_concurrent: 1,
            timezone: tz,
            lunch_start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            lunch_end: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    fn at(s: &TenantSettings, h: u32, m: u32) -> Ms {
        local_instant(s, day(), h * 60 + m).unwrap()
    }

    #[test]
    fn generate_steps_from_opening_to_closing() {
        let s = settings(Tz::UTC, 8, 10, 30);
        let slots = generate(day(), &s);
        assert_eq!(slots, vec![at(&s, 8, 0), at(&s, 8, 30), at(&s, 9, 0), at(&s, 9, 30)]);
    }

    #[test]
    fn generate_drops_trailing_partial_step() {
        let mut s = settings(Tz::UTC, 8, 9, 25);
        s.closing_time = NaiveTime::from_hms_opt(9, 10, 0).unwrap();
        let slots = generate(day(), &s);
        // 09:15 would be past closing
        assert_eq!(slots, vec![at(&s, 8, 0), at(&s, 8, 25), at(&s, 8, 50)]);
    }

    #[test]
    fn generate_uses_tenant_zone() {
        let s = settings(chrono_tz::America::Sao_Paulo, 8, 9, 60);
        let slots = generate(day(), &s);
        // São Paulo is UTC-3 with no DST in 2026.
        let expected = DateTime::parse_from_rfc3339("2026-03-10T11:00:00Z")
            .unwrap()
            .timestamp_millis();
        assert_eq!(slots, vec![expected]);
    }

    #[test]
    fn generate_skips_nonexistent_local_times() {
        // 2026-03-08 02:00–03:00 does not exist in New York.
        let s = settings(chrono_tz::America::New_York, 1, 4, 60);
        let dst_day = NaiveDate::from_ymd_opt(2026, 3, 8).unwrap();
        let slots = generate(dst_day, &s);
        assert_eq!(slots.len(), 2); // 01:00 and 03:00
        assert_eq!(slots[1] - slots[0], HOUR_MS);
    }

    const HOUR_MS: Ms = 60 * MINUTE;

    #[test]
    fn lunch_spanning_job_absorbs_break() {
        let s = settings(Tz::UTC, 8, 18, 30);
        let end = real_end(&s, at(&s, 8, 0), 360).unwrap();
        assert_eq!(end, at(&s, 15, 0));
    }

    #[test]
    fn job_before_lunch_unaffected() {
        let s = settings(Tz::UTC, 8, 18, 30);
        let end = real_end(&s, at(&s, 8, 0), 180).unwrap();
        assert_eq!(end, at(&s, 11, 0));
    }

    #[test]
    fn oversized_job_is_rejected_not_wrapped() {
        let s = settings(Tz::UTC, 8, 18, 30);
        assert_eq!(
            real_end(&s, at(&s, 8, 0), u32::MAX - 10),
            Err(SlotRejection::OutsideBusinessHours)
        );
    }

    #[test]
    fn job_ending_exactly_at_lunch_unaffected() {
        let s = settings(Tz::UTC, 8, 18, 30);
        let end = real_end(&s, at(&s, 11, 0), 60).unwrap();
        assert_eq!(end, at(&s, 12, 0));
    }

    #[test]
    fn job_starting_in_lunch_rejected() {
        let s = settings(Tz::UTC, 8, 18, 30);
        assert_eq!(real_end(&s, at(&s, 12, 0), 30), Err(SlotRejection::DuringLunch));
        assert_eq!(real_end(&s, at(&s, 12, 30), 30), Err(SlotRejection::DuringLunch));
        assert!(real_end(&s, at(&s, 13, 0), 30).is_ok());
        assert!(starts_in_lunch(&s, at(&s, 12, 59)));
        assert!(!starts_in_lunch(&s, at(&s, 13, 0)));
    }

    #[test]
    fn job_after_lunch_unaffected() {
        let s = settings(Tz::UTC, 8, 18, 30);
        let end = real_end(&s, at(&s, 13, 30), 90).unwrap();
        assert_eq!(end, at(&s, 15, 0));
    }

    #[test]
    fn day_span_is_local() {
        let s = settings(chrono_tz::America::Sao_Paulo, 8, 18, 30);
        let span = day_span(&s, day()).unwrap();
        assert_eq!(span.duration_ms(), 24 * HOUR_MS);
        assert_eq!(local_date(&s, span.start), Some(day()));
        assert_eq!(local_date(&s, span.end - 1), Some(day()));
    }

    #[test]
    fn business_hours_bounds() {
        let s = settings(Tz::UTC, 8, 18, 30);
        let hours = business_hours(&s, day()).unwrap();
        assert_eq!(hours, Span::new(at(&s, 8, 0), at(&s, 18, 0)));
    }

    proptest! {
        #[test]
        fn generated_slots_never_start_in_lunch_after_adjustment(
            open_h in 6u32..10,
            close_h in 14u32..22,
            interval in prop_oneof![Just(15u32), Just(20), Just(30), Just(45), Just(60)],
            duration in 15u32..480,
        ) {
            let s = settings(Tz::UTC, open_h, close_h, interval);
            let close = at(&s, close_h, 0);
            for start in generate(day(), &s) {
                prop_assert!(start < close);
                match real_end(&s, start, duration) {
                    Ok(end) => {
                        prop_assert!(!starts_in_lunch(&s, start));
                        prop_assert!(end >= start + Ms::from(duration) * MINUTE);
                    }
                    Err(r) => {
                        prop_assert_eq!(r, SlotRejection::DuringLunch);
                        prop_assert!(starts_in_lunch(&s, start));
                    }
                }
            }
        }
    }
}
