use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::restock::RestockStatus;
use crate::schedule::ScheduleStatus;
use crate::transfer::TransferStatus;

const CHANNEL_CAPACITY: usize = 256;

/// What the outside world hears about. Serialized as JSON by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Reservation {
        reservation_id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        quantity: u32,
        status: ReservationStatus,
    },
    ScheduleChange {
        request_id: Ulid,
        requester_id: Ulid,
        branch_id: Option<Ulid>,
        status: ScheduleStatus,
    },
    LowStock {
        product_id: Ulid,
        branch_id: Ulid,
        available: u32,
        threshold: u32,
    },
    Transfer {
        transfer_id: Ulid,
        product_id: Ulid,
        from_branch_id: Ulid,
        to_branch_id: Ulid,
        quantity: u32,
        status: TransferStatus,
    },
    Restock {
        request_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        requested_quantity: u32,
        status: RestockStatus,
    },
}

impl Notice {
    /// Branch channels the notice is delivered on. Transfers reach both ends.
    pub fn branch_ids(&self) -> Vec<Ulid> {
        match self {
            Notice::Reservation { branch_id, .. }
            | Notice::LowStock { branch_id, .. }
            | Notice::Restock { branch_id, .. } => vec![*branch_id],
            Notice::ScheduleChange { branch_id, .. } => branch_id.iter().copied().collect(),
            Notice::Transfer {
                from_branch_id,
                to_branch_id,
                ..
            } => vec![*from_branch_id, *to_branch_id],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notice::Reservation { .. } => "reservation",
            Notice::ScheduleChange { .. } => "schedule_change",
            Notice::LowStock { .. } => "low_stock",
            Notice::Transfer { .. } => "transfer",
            Notice::Restock { .. } => "restock",
        }
    }
}

/// Fire-and-forget broadcast hub: one global channel plus one per branch.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    branches: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            branches: DashMap::new(),
        }
    }

    /// Every notice, regardless of branch.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Notices scoped to one branch. Creates the channel if needed.
    pub fn subscribe_branch(&self, branch_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .branches
            .entry(branch_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening; never fails the caller.
    pub fn send(&self, notice: Notice) {
        for branch_id in notice.branch_ids() {
            if let Some(sender) = self.branches.get(&branch_id) {
                let _ = sender.send(notice.clone());
            }
        }
        let _ = self.all.send(notice);
    }

    /// Drop a branch channel (e.g. when the branch is deactivated).
    pub fn remove_branch(&self, branch_id: &Ulid) {
        self.branches.remove(branch_id);
    }
}
