mod availability;
mod clock;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod reputation;
mod settings;
mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{ServiceSelection, available_slots, overlaps, select_services};
pub use clock::{SystemClock, TestClock, TimeSource};
pub use error::{EngineError, SlotRejection};
pub use lifecycle::{CONFIRMATION_WINDOW_MS, Target};
pub use mutations::NewAppointment;
pub use reputation::Outcome;
pub use settings::{TenantSettings, resolve};
pub use store::Calendar;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Every append already queued when the first one arrives rides the same
/// fsync; non-append commands flush the batch before they run.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(path = %wal.path().display(), error = %e, "WAL flush failed");
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Tenant state ─────────────────────────────────────────

/// Everything a booking decision reads, behind one lock so an appointment
/// change and the reputation change it causes are seen together.
#[derive(Debug, Default)]
pub struct Book {
    pub calendar: Calendar,
    pub reputations: HashMap<Ulid, CustomerReputation>,
    pub settings: Option<SettingsRow>,
    pub policy: ReputationPolicy,
}

impl Book {
    pub fn reputation_of(&self, customer_id: Ulid) -> CustomerReputation {
        self.reputations
            .get(&customer_id)
            .cloned()
            .unwrap_or_else(|| CustomerReputation::new(customer_id))
    }
}

/// Booking engine of one tenant.
pub struct Engine {
    pub(super) book: RwLock<Book>,
    /// Catalog. Written only while holding the `book` write lock so WAL order
    /// matches apply order.
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) global: Option<Arc<SettingsRow>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn TimeSource>,
}

fn apply(book: &mut Book, services: &DashMap<Ulid, Service>, event: &Event) {
    match event {
        Event::SettingsUpdated { settings } => book.settings = Some(settings.clone()),
        Event::PolicyUpdated { policy } => book.policy = policy.clone(),
        Event::ServiceUpserted { service } => {
            services.insert(service.id, service.clone());
        }
        Event::AppointmentCreated { appointment } => book.calendar.insert(appointment.clone()),
        Event::AppointmentUpdated {
            appointment,
            reputation,
        } => {
            book.calendar.upsert(appointment.clone());
            if let Some(rep) = reputation {
                book.reputations.insert(rep.customer_id, rep.clone());
            }
        }
        Event::AppointmentDeleted { id } => {
            book.calendar.remove(id);
        }
        Event::ReputationRestored { reputation } => {
            book.reputations
                .insert(reputation.customer_id, reputation.clone());
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        global: Option<Arc<SettingsRow>>,
    ) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, global, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        global: Option<Arc<SettingsRow>>,
        clock: Arc<dyn TimeSource>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;

        let mut book = Book::default();
        let services = DashMap::new();
        for event in &events {
            apply(&mut book, &services, event);
        }
        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            appointments = book.calendar.len(),
            "replayed WAL"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            book: RwLock::new(book),
            services,
            global,
            wal_tx,
            notify,
            clock,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Effective settings for this tenant.
    pub(super) fn resolve_settings(&self, book: &Book) -> Result<TenantSettings, EngineError> {
        settings::resolve(book.settings.as_ref(), self.global.as_deref())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably log `event`, then apply it. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        book: &mut Book,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply(book, &self.services, event);
        Ok(())
    }

    pub(super) fn announce(&self, appt: &Appointment) {
        if appt.status.kind().notifies() {
            self.notify.publish(&Notice::for_appointment(appt));
        }
    }
}
