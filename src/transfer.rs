//! Stock moving between two branches of the same product.
//!
//! A transfer is requested by staff of either branch, approved by an admin,
//! and completed by an admin. Completion is the only step that touches the
//! ledger: the source row gives up units from its available quantity and the
//! destination row receives them, in one logged event.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Actor, Ms, StockKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Approved,
    Completed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Approved => "approved",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    /// Open transfers block another one on the same route.
    pub fn is_open(&self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Approved)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "approved" => Ok(TransferStatus::Approved),
            "completed" => Ok(TransferStatus::Completed),
            "cancelled" | "canceled" => Ok(TransferStatus::Cancelled),
            other => Err(format!("unknown transfer status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferAction {
    Approve,
    Reject,
    Complete,
    Cancel,
}

impl TransferAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAction::Approve => "approve",
            TransferAction::Reject => "reject",
            TransferAction::Complete => "complete",
            TransferAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(TransferAction::Approve),
            "reject" => Ok(TransferAction::Reject),
            "complete" => Ok(TransferAction::Complete),
            "cancel" => Ok(TransferAction::Cancel),
            other => Err(format!("unknown transfer action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    pub id: Ulid,
    pub product_id: Ulid,
    pub from_branch_id: Ulid,
    pub to_branch_id: Ulid,
    pub quantity: u32,
    pub reason: Option<String>,
    pub status: TransferStatus,
    pub requested_by: Ulid,
    /// Admin who approved or rejected the request.
    pub approved_by: Option<Ulid>,
    pub requested_at: Ms,
    pub approved_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
}

/// (product, source, destination). At most one open transfer per route.
pub type Route = (Ulid, Ulid, Ulid);

impl StockTransfer {
    pub fn source(&self) -> StockKey {
        StockKey::new(self.product_id, self.from_branch_id)
    }

    pub fn destination(&self) -> StockKey {
        StockKey::new(self.product_id, self.to_branch_id)
    }

    pub fn route(&self) -> Route {
        (self.product_id, self.from_branch_id, self.to_branch_id)
    }

    pub fn involves(&self, branch_id: Ulid) -> bool {
        self.from_branch_id == branch_id || self.to_branch_id == branch_id
    }

    /// Signed stock shifts `action` applies to ledger rows.
    pub fn stock_shifts(&self, action: TransferAction) -> Vec<(StockKey, i64)> {
        match action {
            TransferAction::Complete => vec![
                (self.source(), -i64::from(self.quantity)),
                (self.destination(), i64::from(self.quantity)),
            ],
            TransferAction::Approve | TransferAction::Reject | TransferAction::Cancel => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    InvalidTransition {
        from: TransferStatus,
        action: TransferAction,
    },
    Forbidden(&'static str),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a {from} transfer")
            }
            TransferError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Every (status, action) pair, so a new one fails to compile until placed.
pub fn plan(status: TransferStatus, action: TransferAction) -> Result<TransferStatus, TransferError> {
    use TransferAction::*;
    use TransferStatus::*;

    match (status, action) {
        (Pending, Approve) => Ok(Approved),
        (Pending, Reject) | (Pending, Cancel) | (Approved, Cancel) => Ok(Cancelled),
        (Approved, Complete) => Ok(Completed),
        (Pending, Complete) | (Approved, Approve) | (Approved, Reject) | (Completed, _) | (Cancelled, _) => {
            Err(TransferError::InvalidTransition { from: status, action })
        }
    }
}

/// Staff of either branch, or an admin, may ask for a transfer.
pub fn authorize_request(actor: &Actor, from_branch_id: Ulid, to_branch_id: Ulid) -> Result<(), TransferError> {
    if actor.can_manage_branch(from_branch_id) || actor.can_manage_branch(to_branch_id) {
        Ok(())
    } else {
        Err(TransferError::Forbidden("actor manages neither branch of the transfer"))
    }
}

/// Admins decide and complete; the requester or staff of either branch may
/// also cancel while the transfer is open.
pub fn authorize(actor: &Actor, transfer: &StockTransfer, action: TransferAction) -> Result<(), TransferError> {
    match action {
        TransferAction::Approve | TransferAction::Reject | TransferAction::Complete => {
            if actor.is_admin() {
                Ok(())
            } else {
                Err(TransferError::Forbidden("only an admin may approve, reject or complete transfers"))
            }
        }
        TransferAction::Cancel => {
            if actor.user_id == transfer.requested_by
                || actor.can_manage_branch(transfer.from_branch_id)
                || actor.can_manage_branch(transfer.to_branch_id)
            {
                Ok(())
            } else {
                Err(TransferError::Forbidden("actor may not cancel this transfer"))
            }
        }
    }
}

pub fn apply(transfer: &mut StockTransfer, action: TransferAction, to: TransferStatus, actor_id: Ulid, at: Ms) {
    transfer.status = to;
    match action {
        TransferAction::Approve | TransferAction::Reject => {
            transfer.approved_by = Some(actor_id);
            transfer.approved_at = Some(at);
        }
        TransferAction::Complete | TransferAction::Cancel => {}
    }
    match to {
        TransferStatus::Completed => transfer.completed_at = Some(at),
        TransferStatus::Cancelled => transfer.cancelled_at = Some(at),
        TransferStatus::Pending | TransferStatus::Approved => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(requested_by: Ulid, from: Ulid, to: Ulid) -> StockTransfer {
        StockTransfer {
            id: Ulid::new(),
            product_id: Ulid::new(),
            from_branch_id: from,
            to_branch_id: to,
            quantity: 4,
            reason: None,
            status: TransferStatus::Pending,
            requested_by,
            approved_by: None,
            requested_at: 1,
            approved_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn lifecycle_table() {
        use TransferAction::*;
        use TransferStatus::*;
        assert_eq!(plan(Pending, Approve), Ok(Approved));
        assert_eq!(plan(Pending, Reject), Ok(Cancelled));
        assert_eq!(plan(Approved, Cancel), Ok(Cancelled));
        assert_eq!(plan(Approved, Complete), Ok(Completed));
        assert!(plan(Pending, Complete).is_err());
        for action in [Approve, Reject, Complete, Cancel] {
            assert!(plan(Completed, action).is_err());
            assert!(plan(Cancelled, action).is_err());
        }
    }

    #[test]
    fn only_completion_moves_stock() {
        let (from, to) = (Ulid::new(), Ulid::new());
        let t = transfer(Ulid::new(), from, to);
        assert_eq!(
            t.stock_shifts(TransferAction::Complete),
            vec![(t.source(), -4), (t.destination(), 4)]
        );
        assert!(t.stock_shifts(TransferAction::Approve).is_empty());
        assert!(t.stock_shifts(TransferAction::Cancel).is_empty());
    }

    #[test]
    fn authority() {
        let (from, to, elsewhere) = (Ulid::new(), Ulid::new(), Ulid::new());
        let requester = Ulid::new();
        let t = transfer(requester, from, to);

        assert!(authorize_request(&Actor::staff(Ulid::new(), vec![to]), from, to).is_ok());
        assert!(authorize_request(&Actor::staff(Ulid::new(), vec![elsewhere]), from, to).is_err());
        assert!(authorize_request(&Actor::customer(Ulid::new()), from, to).is_err());

        let staff = Actor::staff(requester, vec![from]);
        assert!(authorize(&staff, &t, TransferAction::Approve).is_err());
        assert!(authorize(&staff, &t, TransferAction::Cancel).is_ok());
        assert!(authorize(&Actor::staff(Ulid::new(), vec![elsewhere]), &t, TransferAction::Cancel).is_err());
        assert!(authorize(&Actor::admin(Ulid::new()), &t, TransferAction::Complete).is_ok());
    }

    #[test]
    fn timestamps_follow_the_action() {
        let mut t = transfer(Ulid::new(), Ulid::new(), Ulid::new());
        let admin = Ulid::new();
        apply(&mut t, TransferAction::Approve, TransferStatus::Approved, admin, 10);
        assert_eq!((t.approved_by, t.approved_at), (Some(admin), Some(10)));
        apply(&mut t, TransferAction::Complete, TransferStatus::Completed, admin, 20);
        assert_eq!(t.completed_at, Some(20));
        assert_eq!(t.cancelled_at, None);
        assert!(!t.status.is_open());
    }

    #[test]
    fn parse_names() {
        assert_eq!("Complete".parse::<TransferAction>(), Ok(TransferAction::Complete));
        assert_eq!("canceled".parse::<TransferStatus>(), Ok(TransferStatus::Cancelled));
        assert!("ship".parse::<TransferAction>().is_err());
    }
}
