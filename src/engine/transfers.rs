use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::transfer::{self, StockTransfer, TransferAction, TransferStatus};

use super::{Engine, EngineError};

/// A transfer as asked for by branch staff or an admin.
#[derive(Debug, Clone)]
pub struct TransferInput {
    pub product_id: Ulid,
    pub from_branch_id: Ulid,
    pub to_branch_id: Ulid,
    pub quantity: u32,
    pub reason: Option<String>,
}

/// Which transfers a listing returns. `branch_id` matches either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFilter {
    pub status: Option<TransferStatus>,
    pub product_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
}

impl TransferFilter {
    fn matches(&self, t: &StockTransfer) -> bool {
        self.status.is_none_or(|s| s == t.status)
            && self.product_id.is_none_or(|p| p == t.product_id)
            && self.branch_id.is_none_or(|b| t.involves(b))
    }
}

/// Replay one transfer event into `log`. Returns the stock shifts it carries.
pub(super) fn replay_transfer_event(log: &mut HashMap<Ulid, StockTransfer>, event: &Event) -> Vec<(StockKey, i64)> {
    match event {
        Event::TransferRequested { transfer } | Event::TransferRestored { transfer } => {
            log.insert(transfer.id, transfer.clone());
            Vec::new()
        }
        Event::TransferTransitioned {
            id,
            action,
            actor_id,
            at,
        } => {
            let Some(t) = log.get_mut(id) else {
                error!(transfer = %id, "replay: transition of unknown transfer");
                return Vec::new();
            };
            match transfer::plan(t.status, *action) {
                Ok(to) => {
                    let shifts = t.stock_shifts(*action);
                    transfer::apply(t, *action, to, *actor_id, *at);
                    shifts
                }
                Err(e) => {
                    error!(transfer = %id, error = %e, "replay: transfer transition refused");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    }
}

impl Engine {
    /// Move replayed transfers into the live maps and rebuild route claims.
    pub(super) fn restore_transfers(&self, log: HashMap<Ulid, StockTransfer>) {
        for (id, t) in log {
            if t.status.is_open() {
                self.open_transfers.insert(t.route(), id);
            }
            self.transfer_ids.insert(id);
            self.transfers.insert(id, Arc::new(Mutex::new(t)));
        }
    }

    async fn available_at(&self, key: StockKey) -> u32 {
        match self.get_row(&key) {
            Some(row) => row.read().await.stock.available(),
            None => 0,
        }
    }

    /// The source must still have `quantity` units nobody has reserved.
    async fn check_source_covers(&self, source: StockKey, quantity: u32) -> Result<(), EngineError> {
        let available = self.available_at(source).await;
        if quantity > available {
            return Err(EngineError::InsufficientStock {
                requested: quantity,
                available,
            });
        }
        Ok(())
    }

    pub async fn request_transfer(
        &self,
        id: Ulid,
        actor: &Actor,
        input: TransferInput,
    ) -> Result<StockTransfer, EngineError> {
        if input.quantity == 0 {
            return Err(EngineError::Invalid("quantity must be at least 1".into()));
        }
        if input.quantity > MAX_STOCK_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        if input.from_branch_id == input.to_branch_id {
            return Err(EngineError::Invalid("source and destination branch must differ".into()));
        }
        if let Some(ref r) = input.reason
            && r.chars().count() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        if actor.branch_ids.len() > MAX_ACTOR_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches in actor claim"));
        }
        transfer::authorize_request(actor, input.from_branch_id, input.to_branch_id)
            .map_err(|e| EngineError::from_transfer(id, e))?;
        self.catalog.check_target(input.product_id, input.from_branch_id)?;
        self.catalog.check_target(input.product_id, input.to_branch_id)?;

        let _gate = self.commit_gate.read().await;
        if !self.transfer_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let route = (input.product_id, input.from_branch_id, input.to_branch_id);
        let existing = match self.open_transfers.entry(route) {
            Entry::Occupied(o) => Some(*o.get()),
            Entry::Vacant(v) => {
                v.insert(id);
                None
            }
        };
        if let Some(existing) = existing {
            self.transfer_ids.remove(&id);
            return Err(EngineError::DuplicatePending(existing));
        }

        let result = self.insert_transfer(id, actor, input).await;
        if result.is_err() {
            self.open_transfers.remove_if(&route, |_, v| *v == id);
            self.transfer_ids.remove(&id);
        }
        result
    }

    async fn insert_transfer(&self, id: Ulid, actor: &Actor, input: TransferInput) -> Result<StockTransfer, EngineError> {
        let t = StockTransfer {
            id,
            product_id: input.product_id,
            from_branch_id: input.from_branch_id,
            to_branch_id: input.to_branch_id,
            quantity: input.quantity,
            reason: input.reason,
            status: TransferStatus::Pending,
            requested_by: actor.user_id,
            approved_by: None,
            requested_at: now_ms(),
            approved_at: None,
            completed_at: None,
            cancelled_at: None,
        };
        self.check_source_covers(t.source(), t.quantity).await?;
        self.wal_append(&Event::TransferRequested { transfer: t.clone() }).await?;
        self.transfers.insert(id, Arc::new(Mutex::new(t.clone())));

        info!(transfer = %id, from = %t.from_branch_id, to = %t.to_branch_id, quantity = t.quantity, "transfer requested");
        self.announce_transfer(&t);
        Ok(t)
    }

    /// Move a transfer along its lifecycle. Completion shifts stock on both
    /// rows under their write locks, logged with the status change as one event.
    pub async fn transition_transfer(
        &self,
        id: Ulid,
        actor: &Actor,
        action: TransferAction,
    ) -> Result<StockTransfer, EngineError> {
        let result = self.try_transition_transfer(id, actor, action).await;
        if let Err(ref e) = result {
            debug!(transfer = %id, %action, actor = %actor.user_id, error = %e, "transfer transition refused");
        }
        result
    }

    async fn try_transition_transfer(
        &self,
        id: Ulid,
        actor: &Actor,
        action: TransferAction,
    ) -> Result<StockTransfer, EngineError> {
        if actor.branch_ids.len() > MAX_ACTOR_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches in actor claim"));
        }
        let _gate = self.commit_gate.read().await;
        let handle = self
            .transfers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let mut t = handle.lock().await;
        transfer::authorize(actor, &t, action).map_err(|e| EngineError::from_transfer(id, e))?;
        let to = transfer::plan(t.status, action).map_err(|e| EngineError::from_transfer(id, e))?;
        if action == TransferAction::Approve {
            self.check_source_covers(t.source(), t.quantity).await?;
        }

        let at = now_ms();
        let event = Event::TransferTransitioned {
            id,
            action,
            actor_id: actor.user_id,
            at,
        };
        let touched = self.commit_stock_shifts(&t.stock_shifts(action), &event).await?;
        let from = t.status;
        transfer::apply(&mut t, action, to, actor.user_id, at);
        if !to.is_open() {
            self.open_transfers.remove_if(&t.route(), |_, v| *v == id);
        }
        let updated = t.clone();
        drop(t);

        info!(transfer = %id, %from, %to, actor = %actor.user_id, "transfer transitioned");
        for stock in &touched {
            self.check_low_stock(stock);
        }
        self.announce_transfer(&updated);
        Ok(updated)
    }

    fn announce_transfer(&self, t: &StockTransfer) {
        self.notify.send(Notice::Transfer {
            transfer_id: t.id,
            product_id: t.product_id,
            from_branch_id: t.from_branch_id,
            to_branch_id: t.to_branch_id,
            quantity: t.quantity,
            status: t.status,
        });
    }

    pub async fn get_transfer(&self, id: Ulid) -> Result<StockTransfer, EngineError> {
        let handle = self
            .transfers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let t = handle.lock().await;
        Ok(t.clone())
    }

    /// Newest first.
    pub async fn list_transfers(&self, filter: &TransferFilter) -> Vec<StockTransfer> {
        let handles: Vec<_> = self.transfers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let t = handle.lock().await;
            if filter.matches(&t) {
                out.push(t.clone());
            }
        }
        out.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        out
    }
}
