use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::{MAX_SCAN_DAYS, MAX_SUGGESTED_DAYS};
use crate::model::*;

use super::availability::{ServiceSelection, available_slots, select_services};
use super::reputation;
use super::slots;
use super::{Book, Engine, EngineError, TenantSettings};

impl Engine {
    pub async fn settings(&self) -> Result<TenantSettings, EngineError> {
        let book = self.book.read().await;
        self.resolve_settings(&book)
    }

    pub async fn policy(&self) -> ReputationPolicy {
        self.book.read().await.policy.clone()
    }

    /// Offerable slots on `day` for `service_ids`. With `alternatives` set and
    /// nothing free that day, the next days with room are attached.
    pub async fn get_availability(
        &self,
        day: NaiveDate,
        service_ids: &[Ulid],
        alternatives: bool,
    ) -> Result<Availability, EngineError> {
        let book = self.book.read().await;
        let settings = self.resolve_settings(&book)?;
        let selection = if service_ids.is_empty() {
            ServiceSelection {
                lines: Vec::new(),
                total_duration_minutes: 0,
                total_price: 0,
            }
        } else {
            select_services(&self.services, service_ids)?
        };
        let now = self.now();
        let slots = available_slots(
            &book.calendar,
            &settings,
            day,
            selection.total_duration_minutes,
            now,
        );

        let alternatives = if slots.is_empty() && alternatives && selection.total_duration_minutes > 0 {
            day.checked_add_days(Days::new(1))
                .map(|from| {
                    scan_days(&book, &settings, from, selection.total_duration_minutes, MAX_SCAN_DAYS, now)
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Availability {
            day,
            slots,
            total_duration_minutes: selection.total_duration_minutes,
            total_price: selection.total_price,
            alternatives,
        })
    }

    /// Up to three days with room, scanning at most `max_days` (capped at 14)
    /// from `from_day` inclusive.
    pub async fn suggest_next_available(
        &self,
        from_day: NaiveDate,
        service_ids: &[Ulid],
        max_days: u32,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        let book = self.book.read().await;
        let settings = self.resolve_settings(&book)?;
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }
        let selection = select_services(&self.services, service_ids)?;
        Ok(scan_days(
            &book,
            &settings,
            from_day,
            selection.total_duration_minutes,
            max_days.min(MAX_SCAN_DAYS),
            self.now(),
        ))
    }

    pub async fn get_appointment(&self, actor: Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let book = self.book.read().await;
        let appt = book.calendar.get(&id).ok_or(EngineError::NotFound(id))?;
        match actor {
            Actor::Customer(c) if c != appt.customer_id => {
                Err(EngineError::Forbidden("appointment belongs to another customer"))
            }
            _ => Ok(appt.clone()),
        }
    }

    /// Appointments starting on local `day`. Customers only see their own.
    pub async fn list_appointments(
        &self,
        actor: Actor,
        day: NaiveDate,
    ) -> Result<Vec<Appointment>, EngineError> {
        let book = self.book.read().await;
        let settings = self.resolve_settings(&book)?;
        let Some(window) = slots::day_span(&settings, day) else {
            return Ok(Vec::new());
        };
        Ok(book
            .calendar
            .starting_within(&window)
            .filter(|a| match actor {
                Actor::Customer(c) => a.customer_id == c,
                Actor::Business | Actor::System => true,
            })
            .cloned()
            .collect())
    }

    pub async fn reputation(&self, actor: Actor, customer_id: Ulid) -> Result<ReputationInfo, EngineError> {
        if let Actor::Customer(c) = actor
            && c != customer_id
        {
            return Err(EngineError::Forbidden("reputation of another customer"));
        }
        let book = self.book.read().await;
        Ok(reputation::info(&book.reputation_of(customer_id), &book.policy))
    }

    /// The catalog, ordered by name.
    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    pub async fn appointment_count(&self) -> usize {
        self.book.read().await.calendar.len()
    }
}

fn scan_days(
    book: &Book,
    settings: &TenantSettings,
    from_day: NaiveDate,
    duration_minutes: u32,
    max_days: u32,
    now: Ms,
) -> Vec<DayAvailability> {
    let mut found = Vec::new();
    let mut day = from_day;
    for _ in 0..max_days {
        let slots = available_slots(&book.calendar, settings, day, duration_minutes, now);
        if !slots.is_empty() {
            found.push(DayAvailability { day, slots });
            if found.len() >= MAX_SUGGESTED_DAYS {
                break;
            }
        }
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    found
}
