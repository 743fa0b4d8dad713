use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::BranchStock;
use crate::reservation::Action;
use crate::restock::{RestockAction, RestockRequest};
use crate::schedule::{MinuteOfDay, ScheduleChangeRequest, ScheduleStatus};
use crate::transfer::{StockTransfer, TransferAction};

/// Unix milliseconds.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Identity of one ledger row. Unique per (product, branch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub product_id: Ulid,
    pub branch_id: Ulid,
}

impl StockKey {
    pub fn new(product_id: Ulid, branch_id: Ulid) -> Self {
        Self { product_id, branch_id }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product_id, self.branch_id)
    }
}

// ── Roles and actors ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Staff,
    Optometrist,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Optometrist => "optometrist",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "staff" => Ok(Role::Staff),
            "optometrist" => Ok(Role::Optometrist),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Pre-authenticated caller: identity plus role and branch-scope claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
    pub branch_ids: Vec<Ulid>,
}

impl Actor {
    pub fn new(user_id: Ulid, role: Role, branch_ids: Vec<Ulid>) -> Self {
        Self { user_id, role, branch_ids }
    }

    pub fn customer(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Customer, Vec::new())
    }

    pub fn staff(user_id: Ulid, branch_ids: Vec<Ulid>) -> Self {
        Self::new(user_id, Role::Staff, branch_ids)
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Admin, Vec::new())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins manage every branch; staff only the branches in their claim.
    pub fn can_manage_branch(&self, branch_id: Ulid) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Staff => self.branch_ids.contains(&branch_id),
            Role::Customer | Role::Optometrist => false,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Fulfilled | ReservationStatus::Rejected | ReservationStatus::Cancelled
        )
    }

    /// Pending and approved reservations still hold units on the ledger.
    pub fn holds_stock(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "approved" => Ok(ReservationStatus::Approved),
            // "completed" is what the storefront calls a handed-over reservation
            "fulfilled" | "completed" => Ok(ReservationStatus::Fulfilled),
            "rejected" => Ok(ReservationStatus::Rejected),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub product_id: Ulid,
    pub branch_id: Ulid,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub admin_notes: Option<String>,
    pub reserved_at: Ms,
    pub approved_at: Option<Ms>,
    pub rejected_at: Option<Ms>,
    /// Set when the reservation reaches fulfilled or cancelled.
    pub closed_at: Option<Ms>,
    /// Last actor to move the reservation out of its previous status.
    pub last_actor: Option<Ulid>,
}

impl Reservation {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.branch_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub status: Option<ReservationStatus>,
    pub branch_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.status.is_none_or(|s| s == r.status)
            && self.branch_id.is_none_or(|b| b == r.branch_id)
            && self.user_id.is_none_or(|u| u == r.user_id)
    }
}

// ── Directory mirror ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: Ulid,
    pub name: String,
    pub category: Option<String>,
    pub price_cents: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub id: Ulid,
    pub code: String,
    pub name: String,
    pub active: bool,
}

/// WAL record format. Flat, no nesting beyond the compaction snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProductRegistered {
        id: Ulid,
        name: String,
        category: Option<String>,
        price_cents: i64,
        active: bool,
    },
    ProductActiveSet {
        id: Ulid,
        active: bool,
    },
    BranchRegistered {
        id: Ulid,
        code: String,
        name: String,
        active: bool,
    },
    BranchActiveSet {
        id: Ulid,
        active: bool,
    },
    StockRowOpened {
        key: StockKey,
    },
    StockSet {
        key: StockKey,
        stock_quantity: u32,
    },
    ThresholdSet {
        key: StockKey,
        threshold: u32,
    },
    /// One product at many branches, logged as a single record.
    StockBulkSet {
        product_id: Ulid,
        entries: Vec<(Ulid, u32)>,
    },
    ReservationCreated {
        id: Ulid,
        user_id: Ulid,
        key: StockKey,
        quantity: u32,
        notes: Option<String>,
        at: Ms,
    },
    ReservationTransitioned {
        id: Ulid,
        key: StockKey,
        action: Action,
        actor_id: Ulid,
        admin_notes: Option<String>,
        at: Ms,
    },
    /// New quantity of a pending reservation.
    ReservationQuantityChanged {
        id: Ulid,
        key: StockKey,
        quantity: u32,
        actor_id: Ulid,
        at: Ms,
    },
    ScheduleChangeRequested {
        id: Ulid,
        requester_id: Ulid,
        role: Role,
        branch_id: Option<Ulid>,
        day_of_week: u8,
        start_time: Option<MinuteOfDay>,
        end_time: Option<MinuteOfDay>,
        reason: String,
        at: Ms,
    },
    ScheduleChangeReviewed {
        id: Ulid,
        decision: ScheduleStatus,
        reviewer_id: Ulid,
        admin_notes: Option<String>,
        at: Ms,
    },
    TransferRequested {
        transfer: StockTransfer,
    },
    /// Completion carries the stock move of the transfer.
    TransferTransitioned {
        id: Ulid,
        action: TransferAction,
        actor_id: Ulid,
        at: Ms,
    },
    RestockRequested {
        request: RestockRequest,
    },
    /// Fulfilment carries the stock increase of the request.
    RestockTransitioned {
        id: Ulid,
        action: RestockAction,
        actor_id: Ulid,
        at: Ms,
    },
    // ── Compaction snapshots ──
    RowSnapshot {
        key: StockKey,
        stock_quantity: u32,
        reserved_quantity: u32,
        threshold: u32,
    },
    ReservationRestored {
        reservation: Reservation,
    },
    ScheduleChangeRestored {
        request: ScheduleChangeRequest,
    },
    TransferRestored {
        transfer: StockTransfer,
    },
    RestockRestored {
        request: RestockRequest,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockInfo {
    pub product_id: Ulid,
    pub branch_id: Ulid,
    pub stock_quantity: u32,
    pub reserved_quantity: u32,
    pub available_quantity: u32,
    pub low_stock_threshold: u32,
}

impl From<&BranchStock> for StockInfo {
    fn from(row: &BranchStock) -> Self {
        Self {
            product_id: row.product_id,
            branch_id: row.branch_id,
            stock_quantity: row.stock_quantity,
            reserved_quantity: row.reserved_quantity,
            available_quantity: row.available(),
            low_stock_threshold: row.low_stock_threshold,
        }
    }
}
