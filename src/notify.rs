use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Appointment, Ms, StatusKind};

const CHANNEL_CAPACITY: usize = 256;

/// Who a notice is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Customer(Ulid),
    Business,
}

/// A lifecycle notice. Delivery and templating live outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub status: StatusKind,
    pub start: Ms,
    pub suggested_start: Option<Ms>,
}

impl Notice {
    pub fn for_appointment(appt: &Appointment) -> Self {
        Self {
            appointment_id: appt.id,
            customer_id: appt.customer_id,
            status: appt.status.kind(),
            start: appt.span.start,
            suggested_start: appt.suggested_start(),
        }
    }
}

/// Fire-and-forget broadcast of lifecycle notices per audience.
pub struct NotifyHub {
    channels: DashMap<Audience, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an audience. Creates the channel if needed.
    pub fn subscribe(&self, audience: Audience) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(audience)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to the owning customer and to the business. No-op without listeners.
    pub fn publish(&self, notice: &Notice) {
        for audience in [Audience::Customer(notice.customer_id), Audience::Business] {
            if let Some(sender) = self.channels.get(&audience) {
                let _ = sender.send(notice.clone());
            }
        }
    }
}

/// Log every notice sent to the business until the hub goes away.
pub async fn run_log_dispatcher(mut rx: broadcast::Receiver<Notice>, tenant: String) {
    loop {
        match rx.recv().await {
            Ok(notice) => tracing::info!(
                tenant = %tenant,
                appointment = %notice.appointment_id,
                customer = %notice.customer_id,
                status = %notice.status,
                "appointment notice"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(tenant = %tenant, skipped, "notice dispatcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
