use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Actor, Ms, Reservation, ReservationStatus};

/// A reviewer or requester action on an existing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Fulfill,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::Fulfill => "fulfill",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            "cancel" => Ok(Action::Cancel),
            "fulfill" | "complete" => Ok(Action::Fulfill),
            other => Err(format!("unknown reservation action: {other}")),
        }
    }
}

/// What a transition does to the ledger row of the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// Units stay reserved.
    Keep,
    /// `adjust_reserved(-q)`
    Release(u32),
    /// `decrement_stock_on_fulfillment(q)`
    Consume(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ReservationStatus,
    pub to: ReservationStatus,
    pub effect: LedgerEffect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    InvalidTransition {
        from: ReservationStatus,
        action: Action,
    },
    Forbidden(&'static str),
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a {from} reservation")
            }
            TransitionError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// The transition table. Every (status, action) pair is listed, so a new
/// status or action fails to compile until it is placed here.
pub fn plan(status: ReservationStatus, action: Action, quantity: u32) -> Result<Transition, TransitionError> {
    use Action::*;
    use ReservationStatus::*;

    let (to, effect) = match (status, action) {
        (Pending, Approve) => (Approved, LedgerEffect::Keep),
        (Pending, Reject) => (Rejected, LedgerEffect::Release(quantity)),
        (Pending, Cancel) | (Approved, Cancel) => (Cancelled, LedgerEffect::Release(quantity)),
        (Approved, Fulfill) => (Fulfilled, LedgerEffect::Consume(quantity)),
        (Pending, Fulfill)
        | (Approved, Approve)
        | (Approved, Reject)
        | (Fulfilled, _)
        | (Rejected, _)
        | (Cancelled, _) => {
            return Err(TransitionError::InvalidTransition { from: status, action });
        }
    };
    Ok(Transition { from: status, to, effect })
}

/// Who may perform `action` on `reservation`.
///
/// Reviewing and handing over need authority over the reservation's branch.
/// Cancelling is for the requester or an admin.
pub fn authorize(actor: &Actor, reservation: &Reservation, action: Action) -> Result<(), TransitionError> {
    match action {
        Action::Approve | Action::Reject | Action::Fulfill => {
            if actor.can_manage_branch(reservation.branch_id) {
                Ok(())
            } else {
                Err(TransitionError::Forbidden("actor does not manage this branch"))
            }
        }
        Action::Cancel => {
            if actor.user_id == reservation.user_id || actor.is_admin() {
                Ok(())
            } else {
                Err(TransitionError::Forbidden("only the requester or an admin may cancel"))
            }
        }
    }
}

/// Write the target status and its timestamps onto the reservation.
pub fn apply(
    reservation: &mut Reservation,
    to: ReservationStatus,
    actor_id: Ulid,
    admin_notes: Option<String>,
    at: Ms,
) {
    reservation.status = to;
    reservation.last_actor = Some(actor_id);
    if admin_notes.is_some() {
        reservation.admin_notes = admin_notes;
    }
    match to {
        ReservationStatus::Approved => reservation.approved_at = Some(at),
        ReservationStatus::Rejected => reservation.rejected_at = Some(at),
        ReservationStatus::Fulfilled | ReservationStatus::Cancelled => reservation.closed_at = Some(at),
        ReservationStatus::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    const ALL_STATUSES: [ReservationStatus; 5] = [
        ReservationStatus::Pending,
        ReservationStatus::Approved,
        ReservationStatus::Fulfilled,
        ReservationStatus::Rejected,
        ReservationStatus::Cancelled,
    ];
    const ALL_ACTIONS: [Action; 4] = [Action::Approve, Action::Reject, Action::Cancel, Action::Fulfill];

    fn reservation(user_id: Ulid, branch_id: Ulid) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id,
            product_id: Ulid::new(),
            branch_id,
            quantity: 2,
            status: ReservationStatus::Pending,
            notes: None,
            admin_notes: None,
            reserved_at: 1000,
            approved_at: None,
            rejected_at: None,
            closed_at: None,
            last_actor: None,
        }
    }

    #[test]
    fn allowed_transitions_and_effects() {
        use ReservationStatus::*;
        assert_eq!(plan(Pending, Action::Approve, 3).unwrap().effect, LedgerEffect::Keep);
        assert_eq!(plan(Pending, Action::Approve, 3).unwrap().to, Approved);
        assert_eq!(plan(Pending, Action::Reject, 3).unwrap().effect, LedgerEffect::Release(3));
        assert_eq!(plan(Pending, Action::Cancel, 3).unwrap().to, Cancelled);
        assert_eq!(plan(Approved, Action::Cancel, 3).unwrap().effect, LedgerEffect::Release(3));
        let fulfil = plan(Approved, Action::Fulfill, 3).unwrap();
        assert_eq!(fulfil.to, Fulfilled);
        assert_eq!(fulfil.effect, LedgerEffect::Consume(3));
    }

    #[test]
    fn terminal_statuses_admit_nothing() {
        for status in ALL_STATUSES.iter().filter(|s| s.is_terminal()) {
            for action in ALL_ACTIONS {
                assert_eq!(
                    plan(*status, action, 1),
                    Err(TransitionError::InvalidTransition { from: *status, action })
                );
            }
        }
    }

    #[test]
    fn out_of_order_actions_rejected() {
        use ReservationStatus::*;
        assert!(plan(Pending, Action::Fulfill, 1).is_err());
        assert!(plan(Approved, Action::Approve, 1).is_err());
        assert!(plan(Approved, Action::Reject, 1).is_err());
    }

    #[test]
    fn every_allowed_transition_leaves_pending() {
        for status in ALL_STATUSES {
            for action in ALL_ACTIONS {
                if let Ok(t) = plan(status, action, 1) {
                    assert_ne!(t.to, ReservationStatus::Pending);
                    assert!(!status.is_terminal());
                }
            }
        }
    }

    #[test]
    fn review_needs_branch_authority() {
        let branch = Ulid::new();
        let r = reservation(Ulid::new(), branch);
        let own_staff = Actor::staff(Ulid::new(), vec![branch]);
        let other_staff = Actor::staff(Ulid::new(), vec![Ulid::new()]);
        let admin = Actor::admin(Ulid::new());
        for action in [Action::Approve, Action::Reject, Action::Fulfill] {
            assert!(authorize(&own_staff, &r, action).is_ok());
            assert!(authorize(&admin, &r, action).is_ok());
            assert!(matches!(
                authorize(&other_staff, &r, action),
                Err(TransitionError::Forbidden(_))
            ));
        }
        let requester = Actor::customer(r.user_id);
        assert!(authorize(&requester, &r, Action::Approve).is_err());
    }

    #[test]
    fn cancel_is_for_requester_or_admin() {
        let branch = Ulid::new();
        let r = reservation(Ulid::new(), branch);
        assert!(authorize(&Actor::customer(r.user_id), &r, Action::Cancel).is_ok());
        assert!(authorize(&Actor::admin(Ulid::new()), &r, Action::Cancel).is_ok());
        assert!(authorize(&Actor::customer(Ulid::new()), &r, Action::Cancel).is_err());
        assert!(authorize(&Actor::staff(Ulid::new(), vec![branch]), &r, Action::Cancel).is_err());
        let optometrist = Actor::new(Ulid::new(), Role::Optometrist, vec![branch]);
        assert!(authorize(&optometrist, &r, Action::Cancel).is_err());
    }

    #[test]
    fn apply_stamps_timestamps() {
        let mut r = reservation(Ulid::new(), Ulid::new());
        let staff = Ulid::new();
        apply(&mut r, ReservationStatus::Approved, staff, None, 2000);
        assert_eq!(r.approved_at, Some(2000));
        assert_eq!(r.last_actor, Some(staff));
        apply(&mut r, ReservationStatus::Fulfilled, staff, Some("picked up".into()), 3000);
        assert_eq!(r.closed_at, Some(3000));
        assert_eq!(r.admin_notes.as_deref(), Some("picked up"));

        let mut rejected = reservation(Ulid::new(), Ulid::new());
        apply(&mut rejected, ReservationStatus::Rejected, staff, Some("discontinued".into()), 4000);
        assert_eq!(rejected.rejected_at, Some(4000));
        assert_eq!(rejected.closed_at, None);
    }

    #[test]
    fn action_parse() {
        assert_eq!("Approve".parse::<Action>(), Ok(Action::Approve));
        assert_eq!("complete".parse::<Action>(), Ok(Action::Fulfill));
        assert!("delete".parse::<Action>().is_err());
    }
}
