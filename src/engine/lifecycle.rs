//! Appointment state machine.
//!
//! `transition` is pure: it decides whether `actor` may move an appointment to
//! `target` at `now`, builds the next record and lists the side effects the
//! engine must run before persisting it. Nothing here touches the calendar.

use crate::limits::MAX_NOTES_LEN;
use crate::model::*;

use super::reputation::Outcome;
use super::EngineError;

/// Client confirmation opens this long before the appointment starts.
pub const CONFIRMATION_WINDOW_MS: Ms = 24 * HOUR;

/// Requested next state, with the payload that state needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    ConfirmedByClient,
    Confirmed,
    Rescheduled {
        suggested_start: Ms,
        business_notes: String,
    },
    InProgress,
    Completed,
    Canceled {
        reason: String,
    },
    NoShow,
}

impl Target {
    pub fn kind(&self) -> StatusKind {
        match self {
            Target::ConfirmedByClient => StatusKind::ConfirmedByClient,
            Target::Confirmed => StatusKind::Confirmed,
            Target::Rescheduled { .. } => StatusKind::Rescheduled,
            Target::InProgress => StatusKind::InProgress,
            Target::Completed => StatusKind::Completed,
            Target::Canceled { .. } => StatusKind::Canceled,
            Target::NoShow => StatusKind::NoShow,
        }
    }
}

/// Work the engine performs for a transition, under the same write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The proposed start must pass the booking validator, excluding self.
    ValidateSuggestion { start: Ms },
    /// Recompute the span from `start` and the booked services, excluding self.
    Revalidate { start: Ms },
    Reputation(Outcome),
    Notify(StatusKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Appointment,
    pub effects: Vec<Effect>,
}

pub fn transition(
    appt: &Appointment,
    actor: Actor,
    target: Target,
    now: Ms,
) -> Result<Transition, EngineError> {
    let from = appt.status.kind();
    let to = target.kind();
    let invalid = |reason: &'static str| EngineError::InvalidTransition { from, to, reason };

    if from.is_terminal() {
        return Err(invalid("appointment is closed"));
    }
    if let Actor::Customer(customer) = actor
        && customer != appt.customer_id
    {
        return Err(EngineError::Forbidden("appointment belongs to another customer"));
    }

    let mut next = appt.clone();
    next.version += 1;
    let mut effects = Vec::new();

    use StatusKind as S;
    match (from, target) {
        (S::Pending, Target::ConfirmedByClient) => {
            customer_only(actor)?;
            let lead = appt.span.start - now;
            if lead <= 0 || lead > CONFIRMATION_WINDOW_MS {
                return Err(invalid("confirmation is only open during the 24h before start"));
            }
            next.status = Status::ConfirmedByClient;
            next.confirmed_by_client_at = Some(now);
        }
        (S::Rescheduled, Target::ConfirmedByClient) => {
            customer_only(actor)?;
            let start = appt
                .suggested_start()
                .ok_or_else(|| invalid("no suggested start to accept"))?;
            next.status = Status::ConfirmedByClient;
            next.confirmed_by_client_at = Some(now);
            effects.push(Effect::Revalidate { start });
        }
        (S::ConfirmedByClient, Target::Confirmed) => {
            business_only(actor)?;
            next.status = Status::Confirmed;
            next.confirmed_by_business_at = Some(now);
        }
        (
            S::Pending | S::ConfirmedByClient | S::Confirmed,
            Target::Rescheduled {
                suggested_start,
                business_notes,
            },
        ) => {
            business_only(actor)?;
            next.business_notes = Some(note(business_notes, "reschedule needs a note for the customer")?);
            next.status = Status::Rescheduled { suggested_start };
            effects.push(Effect::ValidateSuggestion {
                start: suggested_start,
            });
        }
        (S::Confirmed, Target::InProgress) => {
            match actor {
                Actor::System if !appt.span.contains_instant(now) => {
                    return Err(invalid("outside the appointment window"));
                }
                Actor::System | Actor::Business => {}
                Actor::Customer(_) => return Err(EngineError::Forbidden("only the business starts work")),
            }
            next.status = Status::InProgress;
        }
        (S::InProgress, Target::Completed) => {
            match actor {
                Actor::System if now < appt.span.end => {
                    return Err(invalid("appointment has not ended yet"));
                }
                Actor::System | Actor::Business => {}
                Actor::Customer(_) => return Err(EngineError::Forbidden("only the business completes work")),
            }
            next.status = Status::Completed;
            effects.push(Effect::Reputation(Outcome::Completed));
        }
        (from, Target::Canceled { reason }) => {
            let reason = note(reason, "cancellation needs a reason")?;
            match actor {
                Actor::Customer(_) => {
                    if !matches!(from, S::Pending | S::ConfirmedByClient) {
                        return Err(invalid("customers can only cancel before business confirmation"));
                    }
                    next.notes = Some(reason);
                }
                Actor::Business => next.business_notes = Some(reason),
                Actor::System => return Err(EngineError::Forbidden("cancellation needs a person")),
            }
            next.status = Status::Canceled;
        }
        (S::Pending | S::ConfirmedByClient | S::Confirmed | S::InProgress, Target::NoShow) => {
            business_only(actor)?;
            if now < appt.span.start {
                return Err(invalid("appointment has not started yet"));
            }
            next.status = Status::NoShow;
            effects.push(Effect::Reputation(Outcome::NoShow));
        }
        _ => return Err(invalid("not reachable from the current status")),
    }

    if to.notifies() {
        effects.push(Effect::Notify(to));
    }
    Ok(Transition { next, effects })
}

/// The automatic transition `appt` is due for at `now`, if any.
pub fn due_transition(appt: &Appointment, now: Ms) -> Option<Target> {
    match appt.status {
        Status::Confirmed if appt.span.contains_instant(now) => Some(Target::InProgress),
        Status::InProgress if now >= appt.span.end => Some(Target::Completed),
        _ => None,
    }
}

fn customer_only(actor: Actor) -> Result<(), EngineError> {
    match actor {
        Actor::Customer(_) => Ok(()),
        _ => Err(EngineError::Forbidden("only the customer can do this")),
    }
}

fn business_only(actor: Actor) -> Result<(), EngineError> {
    match actor {
        Actor::Business => Ok(()),
        _ => Err(EngineError::Forbidden("only the business can do this")),
    }
}

fn note(text: String, missing: &str) -> Result<String, EngineError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidRequest(missing.to_string()));
    }
    if trimmed.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(trimmed.to_string())
}
