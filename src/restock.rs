//! Restock requests: branch staff ask for more units, an admin decides, and
//! fulfilment adds the requested units to the branch's stock.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Actor, Ms, Role, StockKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestockStatus {
    Pending,
    Approved,
    Rejected,
    Fulfilled,
    Cancelled,
}

impl RestockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestockStatus::Pending => "pending",
            RestockStatus::Approved => "approved",
            RestockStatus::Rejected => "rejected",
            RestockStatus::Fulfilled => "fulfilled",
            RestockStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RestockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(RestockStatus::Pending),
            "approved" => Ok(RestockStatus::Approved),
            "rejected" => Ok(RestockStatus::Rejected),
            "fulfilled" => Ok(RestockStatus::Fulfilled),
            "cancelled" | "canceled" => Ok(RestockStatus::Cancelled),
            other => Err(format!("unknown restock status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestockAction {
    Approve,
    Reject,
    Fulfill,
    Cancel,
}

impl RestockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestockAction::Approve => "approve",
            RestockAction::Reject => "reject",
            RestockAction::Fulfill => "fulfill",
            RestockAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for RestockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestockAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(RestockAction::Approve),
            "reject" => Ok(RestockAction::Reject),
            "fulfill" => Ok(RestockAction::Fulfill),
            "cancel" | "withdraw" => Ok(RestockAction::Cancel),
            other => Err(format!("unknown restock action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockRequest {
    pub id: Ulid,
    pub product_id: Ulid,
    pub branch_id: Ulid,
    pub requested_by: Ulid,
    /// Shelf stock when the request was filed.
    pub current_stock: u32,
    pub requested_quantity: u32,
    pub notes: Option<String>,
    pub status: RestockStatus,
    pub approved_by: Option<Ulid>,
    pub requested_at: Ms,
    pub approved_at: Option<Ms>,
    pub fulfilled_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
}

impl RestockRequest {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.branch_id)
    }

    pub fn stock_shifts(&self, action: RestockAction) -> Vec<(StockKey, i64)> {
        match action {
            RestockAction::Fulfill => vec![(self.key(), i64::from(self.requested_quantity))],
            RestockAction::Approve | RestockAction::Reject | RestockAction::Cancel => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestockError {
    InvalidTransition {
        from: RestockStatus,
        action: RestockAction,
    },
    Forbidden(&'static str),
}

impl fmt::Display for RestockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestockError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a {from} restock request")
            }
            RestockError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

impl std::error::Error for RestockError {}

pub fn plan(status: RestockStatus, action: RestockAction) -> Result<RestockStatus, RestockError> {
    use RestockAction::*;
    use RestockStatus::*;

    match (status, action) {
        (Pending, Approve) => Ok(Approved),
        (Pending, Reject) => Ok(Rejected),
        (Pending, Cancel) => Ok(Cancelled),
        (Approved, Fulfill) => Ok(Fulfilled),
        (Pending, Fulfill)
        | (Approved, Approve)
        | (Approved, Reject)
        | (Approved, Cancel)
        | (Rejected, _)
        | (Fulfilled, _)
        | (Cancelled, _) => Err(RestockError::InvalidTransition { from: status, action }),
    }
}

/// Restock requests come from the staff of the branch being restocked.
pub fn authorize_request(actor: &Actor, branch_id: Ulid) -> Result<(), RestockError> {
    if actor.role == Role::Staff && actor.can_manage_branch(branch_id) {
        Ok(())
    } else {
        Err(RestockError::Forbidden("only staff of the branch may request a restock"))
    }
}

pub fn authorize(actor: &Actor, request: &RestockRequest, action: RestockAction) -> Result<(), RestockError> {
    match action {
        RestockAction::Approve | RestockAction::Reject | RestockAction::Fulfill => {
            if actor.is_admin() {
                Ok(())
            } else {
                Err(RestockError::Forbidden("only an admin may review or fulfil restock requests"))
            }
        }
        RestockAction::Cancel => {
            if actor.user_id == request.requested_by || actor.is_admin() {
                Ok(())
            } else {
                Err(RestockError::Forbidden("only the requester or an admin may cancel"))
            }
        }
    }
}

pub fn apply(request: &mut RestockRequest, to: RestockStatus, actor_id: Ulid, at: Ms) {
    request.status = to;
    match to {
        RestockStatus::Approved | RestockStatus::Rejected => {
            request.approved_by = Some(actor_id);
            request.approved_at = Some(at);
        }
        RestockStatus::Fulfilled => request.fulfilled_at = Some(at),
        RestockStatus::Cancelled => request.cancelled_at = Some(at),
        RestockStatus::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requested_by: Ulid, branch_id: Ulid) -> RestockRequest {
        RestockRequest {
            id: Ulid::new(),
            product_id: Ulid::new(),
            branch_id,
            requested_by,
            current_stock: 1,
            requested_quantity: 12,
            notes: None,
            status: RestockStatus::Pending,
            approved_by: None,
            requested_at: 1,
            approved_at: None,
            fulfilled_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn lifecycle_table() {
        use RestockAction::*;
        use RestockStatus::*;
        assert_eq!(plan(Pending, Approve), Ok(Approved));
        assert_eq!(plan(Pending, Reject), Ok(Rejected));
        assert_eq!(plan(Approved, Fulfill), Ok(Fulfilled));
        assert!(plan(Pending, Fulfill).is_err());
        assert!(plan(Approved, Cancel).is_err());
        for terminal in [Rejected, Fulfilled, Cancelled] {
            for action in [Approve, Reject, Fulfill, Cancel] {
                assert!(plan(terminal, action).is_err());
            }
        }
    }

    #[test]
    fn fulfilment_adds_the_requested_units() {
        let r = request(Ulid::new(), Ulid::new());
        assert_eq!(r.stock_shifts(RestockAction::Fulfill), vec![(r.key(), 12)]);
        assert!(r.stock_shifts(RestockAction::Approve).is_empty());
    }

    #[test]
    fn authority() {
        let branch = Ulid::new();
        let staff = Actor::staff(Ulid::new(), vec![branch]);
        assert!(authorize_request(&staff, branch).is_ok());
        assert!(authorize_request(&staff, Ulid::new()).is_err());
        assert!(authorize_request(&Actor::admin(Ulid::new()), branch).is_err());

        let r = request(staff.user_id, branch);
        assert!(authorize(&staff, &r, RestockAction::Cancel).is_ok());
        assert!(authorize(&staff, &r, RestockAction::Approve).is_err());
        assert!(authorize(&Actor::staff(Ulid::new(), vec![branch]), &r, RestockAction::Cancel).is_err());
        assert!(authorize(&Actor::admin(Ulid::new()), &r, RestockAction::Fulfill).is_ok());
    }
}
