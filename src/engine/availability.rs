use std::collections::HashSet;

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::MAX_SERVICES_PER_BOOKING;
use crate::model::*;

use super::settings::TenantSettings;
use super::slots::{self, to_local};
use super::store::Calendar;
use super::EngineError;

// ── Availability Algorithm ────────────────────────────────────────

/// Half-open interval intersection. Touching intervals do not overlap.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.start < b.end && a.end > b.start
}

/// The services of one booking request, resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelection {
    pub lines: Vec<ServiceLine>,
    pub total_duration_minutes: u32,
    pub total_price: Money,
}

/// Resolve requested service ids into priced lines.
///
/// Every id must name an active service; ids may not repeat and at most one
/// service per exclusivity group is allowed.
pub fn select_services(
    catalog: &DashMap<Ulid, Service>,
    ids: &[Ulid],
) -> Result<ServiceSelection, EngineError> {
    if ids.len() > MAX_SERVICES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many services in one booking"));
    }
    let mut seen = HashSet::new();
    let mut groups = HashSet::new();
    let mut lines = Vec::with_capacity(ids.len());
    let mut total_duration_minutes = 0u32;
    let mut total_price: Money = 0;

    for id in ids {
        if !seen.insert(*id) {
            return Err(EngineError::InvalidRequest(format!("service {id} requested twice")));
        }
        let service = catalog
            .get(id)
            .filter(|s| s.active)
            .ok_or(EngineError::UnknownService(*id))?;
        if let Some(group) = &service.exclusivity_group
            && !groups.insert(group.clone())
        {
            return Err(EngineError::InvalidRequest(format!(
                "only one service of group '{group}' may be booked"
            )));
        }
        total_duration_minutes = total_duration_minutes
            .checked_add(service.duration_minutes)
            .ok_or(EngineError::LimitExceeded("booking too long"))?;
        total_price += service.price;
        lines.push(ServiceLine {
            service_id: service.id,
            price: service.price,
            duration_minutes: service.duration_minutes,
        });
    }

    Ok(ServiceSelection {
        lines,
        total_duration_minutes,
        total_price,
    })
}

/// Offerable starts on `day` for a job of `duration_minutes`.
///
/// A candidate survives if it is not in the past, does not start in lunch,
/// its lunch-adjusted end is within closing time and fewer than
/// `max_concurrent` capacity-holding appointments of that day overlap it.
pub fn available_slots(
    calendar: &Calendar,
    settings: &TenantSettings,
    day: NaiveDate,
    duration_minutes: u32,
    now: Ms,
) -> Vec<Slot> {
    if duration_minutes == 0 {
        return Vec::new();
    }
    let (Some(hours), Some(day_bounds)) = (
        slots::business_hours(settings, day),
        slots::day_span(settings, day),
    ) else {
        return Vec::new();
    };

    let existing: Vec<Span> = calendar
        .starting_within(&day_bounds)
        .filter(|a| a.status.kind().holds_capacity())
        .map(|a| a.span)
        .collect();
    let capacity = settings.max_concurrent as usize;

    slots::generate(day, settings)
        .into_iter()
        .filter(|&start| start >= now)
        .filter(|&start| !slots::starts_in_lunch(settings, start))
        .filter_map(|start| {
            let end = slots::real_end(settings, start, duration_minutes).ok()?;
            if end > hours.end {
                return None;
            }
            let candidate = Span::new(start, end);
            let taken = existing.iter().filter(|s| overlaps(s, &candidate)).count();
            if taken >= capacity {
                return None;
            }
            let local_time = to_local(settings.timezone, start)?.time();
            Some(Slot { start, local_time })
        })
        .collect()
}
