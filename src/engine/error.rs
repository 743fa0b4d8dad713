use ulid::Ulid;

use crate::catalog::TargetError;
use crate::ledger::LedgerError;
use crate::reservation::TransitionError;
use crate::restock::RestockError;
use crate::schedule::ScheduleError;
use crate::transfer::TransferError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InsufficientStock {
        requested: u32,
        available: u32,
    },
    BelowReserved {
        stock: u32,
        reserved: u32,
    },
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        action: &'static str,
    },
    Forbidden(&'static str),
    InvalidTarget(TargetError),
    /// An open request already holds the slot; carries its id.
    DuplicatePending(Ulid),
    LimitExceeded(&'static str),
    Invalid(String),
    InvariantViolation(String),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InsufficientStock { requested, available } => {
                write!(f, "insufficient stock: requested {requested}, available {available}")
            }
            EngineError::BelowReserved { stock, reserved } => {
                write!(f, "cannot set stock to {stock}: {reserved} units are reserved")
            }
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "invalid transition: cannot {action} {id} while {from}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidTarget(e) => write!(f, "invalid target: {e}"),
            EngineError::DuplicatePending(id) => {
                write!(f, "a pending request already exists: {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::InvariantViolation(msg) => write!(f, "ledger invariant violated: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::BelowReserved { .. } => "below_reserved",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidTarget(_) => "invalid_target",
            EngineError::DuplicatePending(_) => "duplicate_pending",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Invalid(_) => "invalid",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientStock { requested, available } => {
                EngineError::InsufficientStock { requested, available }
            }
            LedgerError::BelowReserved { stock, reserved } => EngineError::BelowReserved { stock, reserved },
            LedgerError::InvariantViolation(msg) => EngineError::InvariantViolation(msg),
            LedgerError::Invalid(msg) => EngineError::Invalid(msg.to_string()),
        }
    }
}

impl From<TargetError> for EngineError {
    fn from(e: TargetError) -> Self {
        EngineError::InvalidTarget(e)
    }
}

impl EngineError {
    pub(super) fn from_transition(id: Ulid, e: TransitionError) -> Self {
        match e {
            TransitionError::InvalidTransition { from, action } => EngineError::InvalidTransition {
                id,
                from: from.as_str(),
                action: action.as_str(),
            },
            TransitionError::Forbidden(msg) => EngineError::Forbidden(msg),
        }
    }

    pub(super) fn from_schedule(id: Ulid, action: &'static str, e: ScheduleError) -> Self {
        match e {
            ScheduleError::NotRequester => {
                EngineError::Forbidden("only staff or optometrists may request changes, and only for themselves")
            }
            ScheduleError::NotReviewer => EngineError::Forbidden("only an admin may review schedule changes"),
            ScheduleError::AlreadyReviewed(status) => EngineError::InvalidTransition {
                id,
                from: status.as_str(),
                action,
            },
            ScheduleError::ReasonTooLong => EngineError::LimitExceeded("reason too long"),
            other => EngineError::Invalid(other.to_string()),
        }
    }

    pub(super) fn from_transfer(id: Ulid, e: TransferError) -> Self {
        match e {
            TransferError::InvalidTransition { from, action } => EngineError::InvalidTransition {
                id,
                from: from.as_str(),
                action: action.as_str(),
            },
            TransferError::Forbidden(msg) => EngineError::Forbidden(msg),
        }
    }

    pub(super) fn from_restock(id: Ulid, e: RestockError) -> Self {
        match e {
            RestockError::InvalidTransition { from, action } => EngineError::InvalidTransition {
                id,
                from: from.as_str(),
                action: action.as_str(),
            },
            RestockError::Forbidden(msg) => EngineError::Forbidden(msg),
        }
    }
}
