use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;

use crate::model::SettingsRow;

use super::EngineError;

/// Validated business configuration. Only obtainable through [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct TenantSettings {
    pub opening_time: NaiveTime,
    pub closing_time: NaiveTime,
    pub slot_interval_minutes: u32,
    pub max_concurrent: u32,
    pub timezone: Tz,
    pub lunch_start: NaiveTime,
    pub lunch_end: NaiveTime,
}

impl TenantSettings {
    pub fn opening_minute(&self) -> u32 {
        minute_of_day(self.opening_time)
    }

    pub fn closing_minute(&self) -> u32 {
        minute_of_day(self.closing_time)
    }

    pub fn lunch_start_minute(&self) -> u32 {
        minute_of_day(self.lunch_start)
    }

    pub fn lunch_end_minute(&self) -> u32 {
        minute_of_day(self.lunch_end)
    }

    pub fn lunch_minutes(&self) -> u32 {
        self.lunch_end_minute() - self.lunch_start_minute()
    }
}

pub(crate) fn minute_of_day(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

/// Effective settings: the tenant row wins, then the global default row.
/// With neither there is nothing to compute availability from.
pub fn resolve(
    tenant: Option<&SettingsRow>,
    global: Option<&SettingsRow>,
) -> Result<TenantSettings, EngineError> {
    let row = tenant.or(global).ok_or(EngineError::ConfigurationMissing)?;
    validate(row)
}

fn validate(row: &SettingsRow) -> Result<TenantSettings, EngineError> {
    let invalid = |msg: &str| EngineError::InvalidSettings(msg.to_string());

    if minute_of_day(row.opening_time) >= minute_of_day(row.closing_time) {
        return Err(invalid("opening_time must be before closing_time"));
    }
    if row.slot_interval_minutes == 0 {
        return Err(invalid("slot_interval_minutes must be positive"));
    }
    if row.max_concurrent == 0 {
        return Err(invalid("max_concurrent must be at least 1"));
    }
    if minute_of_day(row.lunch_start) >= minute_of_day(row.lunch_end) {
        return Err(invalid("lunch_start must be before lunch_end"));
    }
    let timezone: Tz = row
        .timezone
        .parse()
        .map_err(|_| EngineError::InvalidSettings(format!("unknown timezone: {}", row.timezone)))?;

    Ok(TenantSettings {
        opening_time: row.opening_time,
        closing_time: row.closing_time,
        slot_interval_minutes: row.slot_interval_minutes,
        max_concurrent: row.max_concurrent,
        timezone,
        lunch_start: row.lunch_start,
        lunch_end: row.lunch_end,
    })
}
