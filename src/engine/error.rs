use thiserror::Error;
use ulid::Ulid;

use crate::model::StatusKind;

/// Why a proposed start time cannot be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotRejection {
    #[error("start time is in the past")]
    InPast,
    #[error("services cannot start during the lunch break")]
    DuringLunch,
    #[error("outside business hours")]
    OutsideBusinessHours,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no business settings configured for this tenant and no global default")]
    ConfigurationMissing,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("unknown or inactive service: {0}")]
    UnknownService(Ulid),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("slot rejected: {0}")]
    SlotRejected(#[from] SlotRejection),
    #[error("capacity {0} exceeded: all slots occupied")]
    CapacityExceeded(u32),
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: StatusKind,
        to: StatusKind,
        reason: &'static str,
    },
    #[error("unauthorized: unknown identity")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("stale version: expected {expected}, current {actual}")]
    StaleVersion { expected: u64, actual: u64 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
