use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::restock::{self, RestockAction, RestockRequest, RestockStatus};

use super::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct RestockInput {
    pub product_id: Ulid,
    pub branch_id: Ulid,
    pub requested_quantity: u32,
    pub notes: Option<String>,
}

/// Replay one restock event into `log`. Returns the stock shifts it carries.
pub(super) fn replay_restock_event(log: &mut HashMap<Ulid, RestockRequest>, event: &Event) -> Vec<(StockKey, i64)> {
    match event {
        Event::RestockRequested { request } | Event::RestockRestored { request } => {
            log.insert(request.id, request.clone());
            Vec::new()
        }
        Event::RestockTransitioned {
            id,
            action,
            actor_id,
            at,
        } => {
            let Some(r) = log.get_mut(id) else {
                error!(restock = %id, "replay: transition of unknown restock request");
                return Vec::new();
            };
            match restock::plan(r.status, *action) {
                Ok(to) => {
                    let shifts = r.stock_shifts(*action);
                    restock::apply(r, to, *actor_id, *at);
                    shifts
                }
                Err(e) => {
                    error!(restock = %id, error = %e, "replay: restock transition refused");
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    }
}

impl Engine {
    pub(super) fn restore_restocks(&self, log: HashMap<Ulid, RestockRequest>) {
        for (id, r) in log {
            if r.status == RestockStatus::Pending {
                self.pending_restocks.insert(r.key(), id);
            }
            self.restock_ids.insert(id);
            self.restocks.insert(id, Arc::new(Mutex::new(r)));
        }
    }

    /// File a restock request. One pending request per ledger row.
    pub async fn request_restock(
        &self,
        id: Ulid,
        actor: &Actor,
        input: RestockInput,
    ) -> Result<RestockRequest, EngineError> {
        if input.requested_quantity == 0 {
            return Err(EngineError::Invalid("requested quantity must be at least 1".into()));
        }
        if input.requested_quantity > MAX_STOCK_QUANTITY {
            return Err(EngineError::LimitExceeded("requested quantity too large"));
        }
        if let Some(ref n) = input.notes
            && n.chars().count() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if actor.branch_ids.len() > MAX_ACTOR_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches in actor claim"));
        }
        restock::authorize_request(actor, input.branch_id).map_err(|e| EngineError::from_restock(id, e))?;
        self.catalog.check_target(input.product_id, input.branch_id)?;

        let key = StockKey::new(input.product_id, input.branch_id);
        let _gate = self.commit_gate.read().await;
        if !self.restock_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let existing = match self.pending_restocks.entry(key) {
            Entry::Occupied(o) => Some(*o.get()),
            Entry::Vacant(v) => {
                v.insert(id);
                None
            }
        };
        if let Some(existing) = existing {
            self.restock_ids.remove(&id);
            return Err(EngineError::DuplicatePending(existing));
        }

        let current_stock = match self.get_row(&key) {
            Some(row) => row.read().await.stock.stock_quantity,
            None => 0,
        };
        let request = RestockRequest {
            id,
            product_id: input.product_id,
            branch_id: input.branch_id,
            requested_by: actor.user_id,
            current_stock,
            requested_quantity: input.requested_quantity,
            notes: input.notes,
            status: RestockStatus::Pending,
            approved_by: None,
            requested_at: now_ms(),
            approved_at: None,
            fulfilled_at: None,
            cancelled_at: None,
        };
        if let Err(e) = self.wal_append(&Event::RestockRequested { request: request.clone() }).await {
            self.pending_restocks.remove_if(&key, |_, v| *v == id);
            self.restock_ids.remove(&id);
            return Err(e);
        }
        self.restocks.insert(id, Arc::new(Mutex::new(request.clone())));

        info!(restock = %id, %key, quantity = request.requested_quantity, "restock requested");
        self.announce_restock(&request);
        Ok(request)
    }

    /// Review, fulfil or withdraw a restock request. Fulfilment adds the
    /// requested units to the row in the same logged event.
    pub async fn transition_restock(
        &self,
        id: Ulid,
        actor: &Actor,
        action: RestockAction,
    ) -> Result<RestockRequest, EngineError> {
        let result = self.try_transition_restock(id, actor, action).await;
        if let Err(ref e) = result {
            debug!(restock = %id, %action, actor = %actor.user_id, error = %e, "restock transition refused");
        }
        result
    }

    async fn try_transition_restock(
        &self,
        id: Ulid,
        actor: &Actor,
        action: RestockAction,
    ) -> Result<RestockRequest, EngineError> {
        let _gate = self.commit_gate.read().await;
        let handle = self
            .restocks
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let mut r = handle.lock().await;
        restock::authorize(actor, &r, action).map_err(|e| EngineError::from_restock(id, e))?;
        let to = restock::plan(r.status, action).map_err(|e| EngineError::from_restock(id, e))?;

        let at = now_ms();
        let event = Event::RestockTransitioned {
            id,
            action,
            actor_id: actor.user_id,
            at,
        };
        let touched = self.commit_stock_shifts(&r.stock_shifts(action), &event).await?;
        let from = r.status;
        restock::apply(&mut r, to, actor.user_id, at);
        if from == RestockStatus::Pending {
            self.pending_restocks.remove_if(&r.key(), |_, v| *v == id);
        }
        let updated = r.clone();
        drop(r);

        info!(restock = %id, %from, %to, actor = %actor.user_id, "restock transitioned");
        for stock in &touched {
            self.check_low_stock(stock);
        }
        self.announce_restock(&updated);
        Ok(updated)
    }

    fn announce_restock(&self, r: &RestockRequest) {
        self.notify.send(Notice::Restock {
            request_id: r.id,
            product_id: r.product_id,
            branch_id: r.branch_id,
            requested_quantity: r.requested_quantity,
            status: r.status,
        });
    }

    pub async fn get_restock(&self, id: Ulid) -> Result<RestockRequest, EngineError> {
        let handle = self
            .restocks
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let r = handle.lock().await;
        Ok(r.clone())
    }

    /// Newest first.
    pub async fn list_restocks(&self, status: Option<RestockStatus>, branch_id: Option<Ulid>) -> Vec<RestockRequest> {
        let handles: Vec<_> = self.restocks.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let r = handle.lock().await;
            if status.is_none_or(|s| s == r.status) && branch_id.is_none_or(|b| b == r.branch_id) {
                out.push(r.clone());
            }
        }
        out.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        out
    }
}
