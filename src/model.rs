use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every absolute instant uses this.
pub type Ms = i64;

/// Minor currency units (cents).
pub type Money = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Customer trust score in tenths of a point, `0..=50`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rating(u16);

impl Rating {
    pub const MAX: Rating = Rating(50);

    pub fn from_tenths(tenths: u16) -> Self {
        Rating(tenths.min(Self::MAX.0))
    }

    /// Parse a decimal rating such as `2.5`. Values outside `0.0..=5.0` are rejected.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || !(0.0..=5.0).contains(&value) {
            return None;
        }
        Some(Rating((value * 10.0).round() as u16))
    }

    pub fn tenths(self) -> u16 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 10.0
    }

    pub fn saturating_add_tenths(self, tenths: u16) -> Self {
        Self::from_tenths(self.0.saturating_add(tenths))
    }
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

// ── Appointment status ───────────────────────────────────────────

/// Status discriminant without payload. Used on the wire and in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Pending,
    ConfirmedByClient,
    Confirmed,
    Rescheduled,
    InProgress,
    Completed,
    Canceled,
    NoShow,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Pending => "pending",
            StatusKind::ConfirmedByClient => "confirmed_by_client",
            StatusKind::Confirmed => "confirmed",
            StatusKind::Rescheduled => "rescheduled",
            StatusKind::InProgress => "in_progress",
            StatusKind::Completed => "completed",
            StatusKind::Canceled => "canceled",
            StatusKind::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "pending" => StatusKind::Pending,
            "confirmed_by_client" => StatusKind::ConfirmedByClient,
            "confirmed" => StatusKind::Confirmed,
            "rescheduled" => StatusKind::Rescheduled,
            "in_progress" => StatusKind::InProgress,
            "completed" => StatusKind::Completed,
            "canceled" | "cancelled" => StatusKind::Canceled,
            "no_show" => StatusKind::NoShow,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StatusKind::Completed | StatusKind::Canceled | StatusKind::NoShow)
    }

    /// Whether an appointment in this state occupies calendar capacity.
    pub fn holds_capacity(self) -> bool {
        !matches!(self, StatusKind::Canceled | StatusKind::NoShow)
    }

    /// Whether entering this state is announced to the notification hub.
    pub fn notifies(self) -> bool {
        !matches!(self, StatusKind::InProgress)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appointment status. The suggested start only exists while rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    ConfirmedByClient,
    Confirmed,
    Rescheduled { suggested_start: Ms },
    InProgress,
    Completed,
    Canceled,
    NoShow,
}

impl Status {
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::Pending => StatusKind::Pending,
            Status::ConfirmedByClient => StatusKind::ConfirmedByClient,
            Status::Confirmed => StatusKind::Confirmed,
            Status::Rescheduled { .. } => StatusKind::Rescheduled,
            Status::InProgress => StatusKind::InProgress,
            Status::Completed => StatusKind::Completed,
            Status::Canceled => StatusKind::Canceled,
            Status::NoShow => StatusKind::NoShow,
        }
    }
}

/// Who is asking. Resolved from the connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer(Ulid),
    Business,
    /// The lifecycle scanner.
    System,
}

// ── Catalog & booking records ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price: Money,
    pub active: bool,
    /// Services sharing a group cannot be booked together.
    pub exclusivity_group: Option<String>,
}

/// One booked service with its price frozen at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub service_id: Ulid,
    pub price: Money,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancePayment {
    pub percent: u8,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub car_id: Ulid,
    pub span: Span,
    pub status: Status,
    pub lines: Vec<ServiceLine>,
    pub total_price: Money,
    pub notes: Option<String>,
    pub business_notes: Option<String>,
    pub confirmed_by_client_at: Option<Ms>,
    pub confirmed_by_business_at: Option<Ms>,
    pub advance_payment: Option<AdvancePayment>,
    pub created_at: Ms,
    pub version: u64,
}

impl Appointment {
    pub fn service_ids(&self) -> Vec<Ulid> {
        self.lines.iter().map(|l| l.service_id).collect()
    }

    pub fn suggested_start(&self) -> Option<Ms> {
        match self.status {
            Status::Rescheduled { suggested_start } => Some(suggested_start),
            _ => None,
        }
    }
}

/// Stored business configuration. Validated into `TenantSettings` on resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsRow {
    pub opening_time: NaiveTime,
    pub closing_time: NaiveTime,
    pub slot_interval_minutes: u32,
    pub max_concurrent: u32,
    pub timezone: String,
    #[serde(default = "default_lunch_start")]
    pub lunch_start: NaiveTime,
    #[serde(default = "default_lunch_end")]
    pub lunch_end: NaiveTime,
}

pub fn default_lunch_start() -> NaiveTime {
    NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()
}

pub fn default_lunch_end() -> NaiveTime {
    NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerReputation {
    pub customer_id: Ulid,
    pub rating: Rating,
    pub no_show_count: u32,
    pub completed_count: u32,
}

impl CustomerReputation {
    pub fn new(customer_id: Ulid) -> Self {
        Self {
            customer_id,
            rating: Rating::MAX,
            no_show_count: 0,
            completed_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationPolicy {
    pub enabled: bool,
    pub no_show_penalty_rating: Rating,
    pub min_rating_for_no_advance: Rating,
    pub advance_percent: u8,
    /// Completing a booking while below threshold restores full rating.
    pub recover_on_show: bool,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            no_show_penalty_rating: Rating::from_tenths(20),
            min_rating_for_no_advance: Rating::from_tenths(30),
            advance_percent: 30,
            recover_on_show: true,
        }
    }
}

/// WAL record format. Flat, no nesting.
///
/// An appointment update and the reputation change it causes travel in one
/// record so they are persisted and replayed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: SettingsRow,
    },
    PolicyUpdated {
        policy: ReputationPolicy,
    },
    ServiceUpserted {
        service: Service,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentUpdated {
        appointment: Appointment,
        reputation: Option<CustomerReputation>,
    },
    AppointmentDeleted {
        id: Ulid,
    },
    /// Emitted by compaction only.
    ReputationRestored {
        reputation: CustomerReputation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub local_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub day: NaiveDate,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub day: NaiveDate,
    pub slots: Vec<Slot>,
    pub total_duration_minutes: u32,
    pub total_price: Money,
    /// Filled only when no slot was found and alternatives were requested.
    pub alternatives: Vec<DayAvailability>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationInfo {
    pub customer_id: Ulid,
    pub rating: Rating,
    pub no_show_count: u32,
    pub completed_count: u32,
    pub requires_advance_payment: bool,
    pub advance_percent: u8,
}
