use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::error::SlotRejection;
use super::settings::TenantSettings;
use super::slots;
use super::store::Calendar;
use super::EngineError;

/// Write-time authority for one proposed start.
///
/// Re-derives the lunch-adjusted span and checks it against the calendar as
/// it is *now*. Callers hold the calendar write lock across this check and
/// the write that follows. `exclude` drops one appointment from the overlap
/// count (moving an appointment never collides with itself).
pub(crate) fn validate_booking(
    calendar: &Calendar,
    settings: &TenantSettings,
    start: Ms,
    duration_minutes: u32,
    exclude: Option<Ulid>,
    now: Ms,
) -> Result<Span, EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if duration_minutes == 0 {
        return Err(EngineError::InvalidRequest("booking has no duration".into()));
    }
    if start < now {
        return Err(SlotRejection::InPast.into());
    }

    let day = slots::local_date(settings, start).ok_or(SlotRejection::OutsideBusinessHours)?;
    let hours = slots::business_hours(settings, day).ok_or(SlotRejection::OutsideBusinessHours)?;
    if start < hours.start || start >= hours.end {
        return Err(SlotRejection::OutsideBusinessHours.into());
    }

    let end = slots::real_end(settings, start, duration_minutes)?;
    if end > hours.end {
        return Err(SlotRejection::OutsideBusinessHours.into());
    }

    let span = Span::new(start, end);
    if calendar.count_overlapping(&span, exclude) >= settings.max_concurrent as usize {
        return Err(EngineError::CapacityExceeded(settings.max_concurrent));
    }
    Ok(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn settings(max_concurrent: u32) -> TenantSettings {
        TenantSettings {
            opening_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            closing_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            slot_interval_minutes: 30,
            max_concurrent,
            timezone: chrono_tz::America::Sao_Paulo,
            lunch_start: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            lunch_end: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
        }
    }

    fn at(h: u32, m: u32) -> Ms {
        let day = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        slots::local_instant(&settings(1), day, h * 60 + m).unwrap()
    }

    fn booked(start: Ms, end: Ms, status: Status) -> Appointment {
        Appointment {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            car_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            lines: vec![],
            total_price: 0,
            notes: None,
            business_notes: None,
            confirmed_by_client_at: None,
            confirmed_by_business_at: None,
            advance_payment: None,
            created_at: 0,
            version: 1,
        }
    }

    fn rejection(r: Result<Span, EngineError>) -> Option<SlotRejection> {
        match r {
            Err(EngineError::SlotRejected(r)) => Some(r),
            _ => None,
        }
    }

    #[test]
    fn accepts_free_slot_with_lunch_adjusted_end() {
        let cal = Calendar::new();
        let span = validate_booking(&cal, &settings(1), at(8, 0), 360, None, 0).unwrap();
        assert_eq!(span, Span::new(at(8, 0), at(15, 0)));
    }

    #[test]
    fn rejects_past_start() {
        let cal = Calendar::new();
        let r = validate_booking(&cal, &settings(1), at(9, 0), 60, None, at(9, 1));
        assert_eq!(rejection(r), Some(SlotRejection::InPast));
    }

    #[test]
    fn rejects_lunch_start() {
        let cal = Calendar::new();
        let r = validate_booking(&cal, &settings(1), at(12, 0), 30, None, 0);
        assert_eq!(rejection(r), Some(SlotRejection::DuringLunch));
    }

    #[test]
    fn rejects_outside_hours() {
        let cal = Calendar::new();
        let s = settings(1);
        assert_eq!(
            rejection(validate_booking(&cal, &s, at(7, 30), 60, None, 0)),
            Some(SlotRejection::OutsideBusinessHours)
        );
        assert_eq!(
            rejection(validate_booking(&cal, &s, at(18, 0), 30, None, 0)),
            Some(SlotRejection::OutsideBusinessHours)
        );
        // Fits by raw duration, not after the lunch adjustment.
        assert_eq!(
            rejection(validate_booking(&cal, &s, at(9, 0), 540, None, 0)),
            Some(SlotRejection::OutsideBusinessHours)
        );
        assert!(validate_booking(&cal, &s, at(17, 0), 60, None, 0).is_ok());
    }

    #[test]
    fn capacity_counts_only_holding_statuses() {
        let mut cal = Calendar::new();
        cal.insert(booked(at(9, 0), at(10, 0), Status::Canceled));
        assert!(validate_booking(&cal, &settings(1), at(9, 0), 60, None, 0).is_ok());

        cal.insert(booked(at(9, 30), at(10, 30), Status::Pending));
        assert!(matches!(
            validate_booking(&cal, &settings(1), at(9, 0), 60, None, 0),
            Err(EngineError::CapacityExceeded(1))
        ));
        assert!(validate_booking(&cal, &settings(2), at(9, 0), 60, None, 0).is_ok());
    }

    #[test]
    fn back_to_back_is_legal() {
        let mut cal = Calendar::new();
        cal.insert(booked(at(9, 0), at(10, 0), Status::Confirmed));
        assert!(validate_booking(&cal, &settings(1), at(10, 0), 60, None, 0).is_ok());
    }

    #[test]
    fn exclude_ignores_the_moving_appointment() {
        let mut cal = Calendar::new();
        let mine = booked(at(9, 0), at(10, 0), Status::Confirmed);
        let id = mine.id;
        cal.insert(mine);
        assert!(validate_booking(&cal, &settings(1), at(9, 30), 60, None, 0).is_err());
        assert!(validate_booking(&cal, &settings(1), at(9, 30), 60, Some(id), 0).is_ok());
    }

    #[test]
    fn out_of_range_timestamp_rejected() {
        let cal = Calendar::new();
        assert!(matches!(
            validate_booking(&cal, &settings(1), 0, 60, None, 0),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
