use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{ServiceSelection, select_services};
use super::conflict::validate_booking;
use super::lifecycle::{self, Effect, Target, Transition};
use super::reputation;
use super::settings;
use super::{Book, Engine, EngineError, WalCommand};

/// A booking request.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub car_id: Ulid,
    pub start: Ms,
    pub service_ids: Vec<Ulid>,
    pub notes: Option<String>,
}

fn business_only(actor: Actor) -> Result<(), EngineError> {
    match actor {
        Actor::Business => Ok(()),
        _ => Err(EngineError::Forbidden("business only")),
    }
}

fn check_version(appt: &Appointment, expected: Option<u64>) -> Result<(), EngineError> {
    match expected {
        Some(expected) if expected != appt.version => Err(EngineError::StaleVersion {
            expected,
            actual: appt.version,
        }),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Boundary seeding ─────────────────────────────────

    pub async fn put_settings(&self, actor: Actor, row: SettingsRow) -> Result<(), EngineError> {
        business_only(actor)?;
        settings::resolve(Some(&row), None)?;
        let mut book = self.book.write().await;
        self.persist_and_apply(&mut book, &Event::SettingsUpdated { settings: row })
            .await?;
        tracing::info!("business settings updated");
        Ok(())
    }

    pub async fn put_policy(&self, actor: Actor, policy: ReputationPolicy) -> Result<(), EngineError> {
        business_only(actor)?;
        if policy.advance_percent > 100 {
            return Err(EngineError::InvalidRequest("advance_percent must be 0..=100".into()));
        }
        let mut book = self.book.write().await;
        self.persist_and_apply(&mut book, &Event::PolicyUpdated { policy })
            .await
    }

    pub async fn upsert_service(&self, actor: Actor, service: Service) -> Result<(), EngineError> {
        business_only(actor)?;
        if service.name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("service name is empty".into()));
        }
        if service.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if service.duration_minutes == 0 || service.price <= 0 {
            return Err(EngineError::InvalidRequest(
                "service duration and price must be positive".into(),
            ));
        }
        if service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        let mut book = self.book.write().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.persist_and_apply(&mut book, &Event::ServiceUpserted { service })
            .await
    }

    /// Soft-disable: the service stays referenced by past appointments.
    pub async fn deactivate_service(&self, actor: Actor, id: Ulid) -> Result<(), EngineError> {
        business_only(actor)?;
        let mut book = self.book.write().await;
        let mut service = self
            .services
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EngineError::NotFound(id))?;
        if !service.active {
            return Ok(());
        }
        service.active = false;
        self.persist_and_apply(&mut book, &Event::ServiceUpserted { service })
            .await
    }

    // ── Appointments ─────────────────────────────────────

    pub async fn create_appointment(
        &self,
        actor: Actor,
        req: NewAppointment,
    ) -> Result<Appointment, EngineError> {
        let status = match actor {
            Actor::Business => Status::Confirmed,
            Actor::Customer(c) if c == req.customer_id => Status::Pending,
            Actor::Customer(_) => {
                return Err(EngineError::Forbidden("customers can only book for themselves"));
            }
            Actor::System => return Err(EngineError::Forbidden("system cannot book")),
        };
        if req.service_ids.is_empty() {
            return Err(EngineError::InvalidRequest("at least one service is required".into()));
        }
        let notes = match req.notes.as_deref().map(str::trim) {
            Some(n) if n.len() > MAX_NOTES_LEN => {
                return Err(EngineError::LimitExceeded("notes too long"));
            }
            Some(n) if !n.is_empty() => Some(n.to_string()),
            _ => None,
        };

        let mut book = self.book.write().await;
        if book.calendar.get(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if book.calendar.len() >= MAX_APPOINTMENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many appointments"));
        }

        let now = self.now();
        let settings = self.resolve_settings(&book)?;
        let selection = select_services(&self.services, &req.service_ids)?;
        let span = validate_booking(
            &book.calendar,
            &settings,
            req.start,
            selection.total_duration_minutes,
            None,
            now,
        )
        .inspect_err(|e| {
            if matches!(e, EngineError::CapacityExceeded(_)) {
                metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
            }
        })?;

        let rep = book.reputation_of(req.customer_id);
        let advance_payment = reputation::advance_payment(&rep, &book.policy, selection.total_price);
        let appointment = Appointment {
            id: req.id,
            customer_id: req.customer_id,
            car_id: req.car_id,
            span,
            status,
            lines: selection.lines,
            total_price: selection.total_price,
            notes,
            business_notes: None,
            confirmed_by_client_at: None,
            confirmed_by_business_at: (status == Status::Confirmed).then_some(now),
            advance_payment,
            created_at: now,
            version: 1,
        };

        self.persist_and_apply(
            &mut book,
            &Event::AppointmentCreated {
                appointment: appointment.clone(),
            },
        )
        .await?;
        drop(book);

        metrics::counter!(crate::observability::APPOINTMENTS_CREATED_TOTAL).increment(1);
        tracing::info!(
            appointment = %appointment.id,
            customer = %appointment.customer_id,
            status = %appointment.status.kind(),
            advance = appointment.advance_payment.is_some(),
            "appointment created"
        );
        self.announce(&appointment);
        Ok(appointment)
    }

    /// Apply one lifecycle transition requested by `actor`.
    pub async fn update_status(
        &self,
        actor: Actor,
        id: Ulid,
        target: Target,
        expected_version: Option<u64>,
    ) -> Result<Appointment, EngineError> {
        let mut book = self.book.write().await;
        let current = book.calendar.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        check_version(&current, expected_version)?;
        let now = self.now();
        self.commit_transition(&mut book, &current, actor, target, now)
            .await
    }

    /// Runs the transition, its side effects and the write as one unit.
    /// Caller holds the write lock.
    async fn commit_transition(
        &self,
        book: &mut Book,
        current: &Appointment,
        actor: Actor,
        target: Target,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        let Transition { mut next, effects } = lifecycle::transition(current, actor, target, now)?;

        let mut reputation = None;
        let mut notify = false;
        for effect in effects {
            match effect {
                Effect::ValidateSuggestion { start } => {
                    let settings = self.resolve_settings(book)?;
                    let selection = self.booked_selection(current)?;
                    validate_booking(
                        &book.calendar,
                        &settings,
                        start,
                        selection.total_duration_minutes,
                        Some(current.id),
                        now,
                    )?;
                }
                Effect::Revalidate { start } => {
                    let settings = self.resolve_settings(book)?;
                    let selection = self.booked_selection(current)?;
                    next.span = validate_booking(
                        &book.calendar,
                        &settings,
                        start,
                        selection.total_duration_minutes,
                        Some(current.id),
                        now,
                    )?;
                    next.lines = selection.lines;
                }
                Effect::Reputation(outcome) => {
                    let rep = book.reputation_of(current.customer_id);
                    reputation = reputation::on_transition(&rep, &book.policy, outcome);
                }
                Effect::Notify(_) => notify = true,
            }
        }

        let event = Event::AppointmentUpdated {
            appointment: next.clone(),
            reputation: reputation.clone(),
        };
        self.persist_and_apply(book, &event).await?;

        let to = next.status.kind();
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "status" => to.as_str())
            .increment(1);
        tracing::info!(
            appointment = %next.id,
            from = %current.status.kind(),
            to = %to,
            actor = ?actor,
            "appointment transition"
        );
        if let Some(rep) = &reputation {
            tracing::info!(
                customer = %rep.customer_id,
                rating = %rep.rating,
                no_shows = rep.no_show_count,
                "reputation updated"
            );
        }
        if notify {
            self.announce(&next);
        }
        Ok(next)
    }

    /// The appointment's booked lines with durations refreshed from the
    /// catalog. Prices stay frozen. Deactivated services still count.
    fn booked_selection(&self, appt: &Appointment) -> Result<ServiceSelection, EngineError> {
        let lines: Vec<ServiceLine> = appt
            .lines
            .iter()
            .map(|line| ServiceLine {
                duration_minutes: self
                    .services
                    .get(&line.service_id)
                    .map_or(line.duration_minutes, |s| s.duration_minutes),
                ..line.clone()
            })
            .collect();
        let total_duration_minutes = lines
            .iter()
            .try_fold(0u32, |acc, l| acc.checked_add(l.duration_minutes))
            .ok_or(EngineError::LimitExceeded("booking too long"))?;
        let total_price: Money = lines.iter().map(|l| l.price).sum();
        Ok(ServiceSelection {
            lines,
            total_duration_minutes,
            total_price,
        })
    }

    /// Business move of an appointment that has not started. Status stays.
    /// New services re-take the price snapshot; otherwise prices stay frozen.
    pub async fn reschedule(
        &self,
        actor: Actor,
        id: Ulid,
        start: Ms,
        service_ids: Option<Vec<Ulid>>,
        expected_version: Option<u64>,
    ) -> Result<Appointment, EngineError> {
        business_only(actor)?;
        let mut book = self.book.write().await;
        let current = book.calendar.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        check_version(&current, expected_version)?;

        let from = current.status.kind();
        if !matches!(
            from,
            StatusKind::Pending | StatusKind::ConfirmedByClient | StatusKind::Confirmed
        ) {
            return Err(EngineError::InvalidTransition {
                from,
                to: from,
                reason: "only appointments that have not started can be moved",
            });
        }

        let now = self.now();
        let settings = self.resolve_settings(&book)?;
        let (selection, repriced) = match service_ids {
            Some(ids) if !ids.is_empty() => (select_services(&self.services, &ids)?, true),
            Some(_) => {
                return Err(EngineError::InvalidRequest("at least one service is required".into()));
            }
            None => (self.booked_selection(&current)?, false),
        };
        let span = validate_booking(
            &book.calendar,
            &settings,
            start,
            selection.total_duration_minutes,
            Some(id),
            now,
        )?;

        let mut next = current.clone();
        next.span = span;
        next.version += 1;
        if repriced {
            next.total_price = selection.total_price;
            next.lines = selection.lines;
            next.advance_payment = current.advance_payment.map(|adv| AdvancePayment {
                percent: adv.percent,
                amount: (next.total_price * Money::from(adv.percent) + 50) / 100,
            });
        } else {
            next.lines = selection.lines;
        }

        let event = Event::AppointmentUpdated {
            appointment: next.clone(),
            reputation: None,
        };
        self.persist_and_apply(&mut book, &event).await?;
        drop(book);

        tracing::info!(appointment = %id, start = next.span.start, "appointment moved");
        self.announce(&next);
        Ok(next)
    }

    /// Hard delete. Completed appointments are history and stay.
    pub async fn delete_appointment(&self, actor: Actor, id: Ulid) -> Result<(), EngineError> {
        business_only(actor)?;
        let mut book = self.book.write().await;
        let current = book.calendar.get(&id).ok_or(EngineError::NotFound(id))?;
        if current.status == Status::Completed {
            return Err(EngineError::Forbidden("completed appointments cannot be deleted"));
        }
        self.persist_and_apply(&mut book, &Event::AppointmentDeleted { id })
            .await?;
        tracing::info!(appointment = %id, "appointment deleted");
        Ok(())
    }

    // ── Automatic transitions ────────────────────────────

    /// Appointments due for an automatic transition at `now`, with the
    /// status they were seen in.
    pub async fn collect_due_transitions(&self, now: Ms) -> Vec<(Ulid, StatusKind, Target)> {
        let book = self.book.read().await;
        book.calendar
            .iter()
            .take_while(|a| a.span.start <= now)
            .filter_map(|a| {
                lifecycle::due_transition(a, now).map(|t| (a.id, a.status.kind(), t))
            })
            .collect()
    }

    /// One scan tick: re-checks every due appointment under the write lock
    /// and applies the transition only if it is still in the status it was
    /// collected in. Returns how many were applied.
    pub async fn apply_due_transitions(&self) -> usize {
        let now = self.now();
        let due = self.collect_due_transitions(now).await;
        let mut applied = 0;
        for (id, seen, target) in due {
            let mut book = self.book.write().await;
            let Some(current) = book.calendar.get(&id).cloned() else {
                continue;
            };
            if current.status.kind() != seen {
                tracing::debug!(appointment = %id, "status changed since scan, skipping");
                continue;
            }
            match self
                .commit_transition(&mut book, &current, Actor::System, target, now)
                .await
            {
                Ok(_) => {
                    applied += 1;
                    metrics::counter!(crate::observability::AUTO_TRANSITIONS_TOTAL).increment(1);
                }
                Err(e) => tracing::debug!(appointment = %id, error = %e, "automatic transition skipped"),
            }
        }
        applied
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    /// Holds the write lock so no append can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let book = self.book.write().await;
        let mut events = Vec::with_capacity(self.services.len() + book.calendar.len() + 2);
        if let Some(settings) = &book.settings {
            events.push(Event::SettingsUpdated {
                settings: settings.clone(),
            });
        }
        events.push(Event::PolicyUpdated {
            policy: book.policy.clone(),
        });
        for service in self.services.iter() {
            events.push(Event::ServiceUpserted {
                service: service.value().clone(),
            });
        }
        for reputation in book.reputations.values() {
            events.push(Event::ReputationRestored {
                reputation: reputation.clone(),
            });
        }
        for appointment in book.calendar.iter() {
            events.push(Event::AppointmentCreated {
                appointment: appointment.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
