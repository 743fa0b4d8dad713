use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::reservation::{self, Action, LedgerEffect};

use super::{ledger_failure, Engine, EngineError};

fn check_notes(notes: &Option<String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.chars().count() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn count_rejection(err: &EngineError) {
    metrics::counter!(observability::RESERVATION_REJECTIONS_TOTAL, "reason" => err.reason()).increment(1);
}

impl Engine {
    /// Reserve `quantity` units at a branch. The availability check and the
    /// reserved-quantity increment run under the row's write lock.
    pub async fn create(
        &self,
        id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        quantity: u32,
        notes: Option<String>,
    ) -> Result<Reservation, EngineError> {
        self.create_bounded(id, user_id, product_id, branch_id, quantity, notes, None)
            .await
    }

    /// Like [`Engine::create`], but also fails if more than
    /// `expected_max_available` units would be taken (the caller's view of
    /// availability is stale).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_bounded(
        &self,
        id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        quantity: u32,
        notes: Option<String>,
        expected_max_available: Option<u32>,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .try_create(id, user_id, product_id, branch_id, quantity, notes, expected_max_available)
            .await;
        if let Err(ref e) = result {
            debug!(reservation = %id, user = %user_id, error = %e, "reservation refused");
            count_rejection(e);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_create(
        &self,
        id: Ulid,
        user_id: Ulid,
        product_id: Ulid,
        branch_id: Ulid,
        quantity: u32,
        notes: Option<String>,
        expected_max_available: Option<u32>,
    ) -> Result<Reservation, EngineError> {
        if quantity == 0 {
            return Err(EngineError::Invalid("quantity must be at least 1".into()));
        }
        if quantity > MAX_RESERVATION_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        check_notes(&notes, MAX_NOTES_LEN, "notes too long")?;
        self.catalog.check_target(product_id, branch_id)?;

        let key = StockKey::new(product_id, branch_id);
        let _gate = self.commit_gate.read().await;

        match self.reservation_rows.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(key);
            }
        }
        let claim = (user_id, product_id);
        let existing = match self.pending_claims.entry(claim) {
            Entry::Occupied(o) => Some(*o.get()),
            Entry::Vacant(v) => {
                v.insert(id);
                None
            }
        };
        if let Some(existing) = existing {
            self.reservation_rows.remove(&id);
            return Err(EngineError::DuplicatePending(existing));
        }

        let result = self
            .insert_reservation(id, user_id, key, quantity, notes, expected_max_available)
            .await;
        if result.is_err() {
            self.reservation_rows.remove(&id);
            self.pending_claims.remove_if(&claim, |_, v| *v == id);
        }
        result
    }

    async fn insert_reservation(
        &self,
        id: Ulid,
        user_id: Ulid,
        key: StockKey,
        quantity: u32,
        notes: Option<String>,
        expected_max_available: Option<u32>,
    ) -> Result<Reservation, EngineError> {
        let row = self.open_row(key).await?;
        let mut guard = row.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROW {
            return Err(EngineError::LimitExceeded("too many reservations on row"));
        }

        let mut trial = guard.stock;
        trial
            .adjust_reserved(i64::from(quantity), expected_max_available)
            .map_err(ledger_failure)?;

        let event = Event::ReservationCreated {
            id,
            user_id,
            key,
            quantity,
            notes,
            at: now_ms(),
        };
        self.persist_row(&mut guard, &event).await?;
        let created = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let stock = guard.stock;
        drop(guard);

        info!(
            reservation = %id,
            %key,
            quantity,
            reserved = stock.reserved_quantity,
            available = stock.available(),
            "reservation created"
        );
        self.announce(&created);
        self.check_low_stock(&stock);
        Ok(created)
    }

    pub async fn approve(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition(id, actor, Action::Approve, None).await
    }

    pub async fn reject(&self, id: Ulid, actor: &Actor, admin_notes: Option<String>) -> Result<Reservation, EngineError> {
        self.transition(id, actor, Action::Reject, admin_notes).await
    }

    pub async fn cancel(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition(id, actor, Action::Cancel, None).await
    }

    pub async fn fulfill(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition(id, actor, Action::Fulfill, None).await
    }

    /// Move a reservation along the state machine. The status write and the
    /// ledger effect are one WAL event applied under the row lock.
    pub async fn transition(
        &self,
        id: Ulid,
        actor: &Actor,
        action: Action,
        admin_notes: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_transition(id, actor, action, admin_notes).await;
        if let Err(ref e) = result {
            debug!(reservation = %id, %action, actor = %actor.user_id, error = %e, "transition refused");
            count_rejection(e);
        }
        result
    }

    async fn try_transition(
        &self,
        id: Ulid,
        actor: &Actor,
        action: Action,
        admin_notes: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if actor.branch_ids.len() > MAX_ACTOR_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches in actor claim"));
        }
        check_notes(&admin_notes, MAX_ADMIN_NOTES_LEN, "admin notes too long")?;

        let _gate = self.commit_gate.read().await;
        let key = self
            .reservation_rows
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let row = self.get_row(&key).ok_or(EngineError::NotFound(id))?;
        let mut guard = row.write().await;

        let (transition, user_id) = {
            let current = guard.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
            reservation::authorize(actor, current, action).map_err(|e| EngineError::from_transition(id, e))?;
            let t = reservation::plan(current.status, action, current.quantity)
                .map_err(|e| EngineError::from_transition(id, e))?;
            (t, current.user_id)
        };

        let mut trial = guard.stock;
        match transition.effect {
            LedgerEffect::Keep => Ok(trial),
            LedgerEffect::Release(q) => trial.adjust_reserved(-i64::from(q), None),
            LedgerEffect::Consume(q) => trial.decrement_stock_on_fulfillment(q),
        }
        .map_err(ledger_failure)?;

        let event = Event::ReservationTransitioned {
            id,
            key,
            action,
            actor_id: actor.user_id,
            admin_notes,
            at: now_ms(),
        };
        self.persist_row(&mut guard, &event).await?;
        let updated = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let stock = guard.stock;
        drop(guard);

        if transition.from == ReservationStatus::Pending {
            self.pending_claims
                .remove_if(&(user_id, key.product_id), |_, v| *v == id);
        }

        info!(
            reservation = %id,
            from = %transition.from,
            to = %transition.to,
            actor = %actor.user_id,
            stock = stock.stock_quantity,
            reserved = stock.reserved_quantity,
            "reservation transitioned"
        );
        self.announce(&updated);
        Ok(updated)
    }

    /// Change how many units a pending reservation holds. Growing it must fit
    /// in what is still available at the branch.
    pub async fn update_quantity(&self, id: Ulid, actor: &Actor, quantity: u32) -> Result<Reservation, EngineError> {
        let result = self.try_update_quantity(id, actor, quantity).await;
        if let Err(ref e) = result {
            debug!(reservation = %id, quantity, actor = %actor.user_id, error = %e, "quantity change refused");
            count_rejection(e);
        }
        result
    }

    async fn try_update_quantity(&self, id: Ulid, actor: &Actor, quantity: u32) -> Result<Reservation, EngineError> {
        if quantity == 0 {
            return Err(EngineError::Invalid("quantity must be at least 1".into()));
        }
        if quantity > MAX_RESERVATION_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        if actor.branch_ids.len() > MAX_ACTOR_BRANCHES {
            return Err(EngineError::LimitExceeded("too many branches in actor claim"));
        }

        let _gate = self.commit_gate.read().await;
        let key = self
            .reservation_rows
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let row = self.get_row(&key).ok_or(EngineError::NotFound(id))?;
        let mut guard = row.write().await;

        let current = guard.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
        if current.user_id != actor.user_id && !actor.can_manage_branch(key.branch_id) {
            return Err(EngineError::Forbidden("only the owner or branch staff may change a reservation"));
        }
        if current.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status.as_str(),
                action: "update",
            });
        }
        let delta = i64::from(quantity) - i64::from(current.quantity);
        if delta == 0 {
            return Ok(current.clone());
        }

        let mut trial = guard.stock;
        trial.adjust_reserved(delta, None).map_err(ledger_failure)?;

        let event = Event::ReservationQuantityChanged {
            id,
            key,
            quantity,
            actor_id: actor.user_id,
            at: now_ms(),
        };
        self.persist_row(&mut guard, &event).await?;
        let updated = guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let stock = guard.stock;
        drop(guard);

        info!(reservation = %id, quantity, reserved = stock.reserved_quantity, "reservation quantity changed");
        self.notify.send(Notice::Reservation {
            reservation_id: updated.id,
            user_id: updated.user_id,
            product_id: updated.product_id,
            branch_id: updated.branch_id,
            quantity: updated.quantity,
            status: updated.status,
        });
        self.check_low_stock(&stock);
        Ok(updated)
    }

    /// Best-effort notification; never affects the committed transition.
    fn announce(&self, r: &Reservation) {
        metrics::counter!(observability::RESERVATION_TRANSITIONS_TOTAL, "status" => r.status.as_str())
            .increment(1);
        self.notify.send(Notice::Reservation {
            reservation_id: r.id,
            user_id: r.user_id,
            product_id: r.product_id,
            branch_id: r.branch_id,
            quantity: r.quantity,
            status: r.status,
        });
    }

    /// Pending reservations made at or before `cutoff`, oldest first.
    pub async fn collect_stale_pending(&self, cutoff: Ms) -> Vec<Ulid> {
        let rows: Vec<_> = self.rows.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for row in rows {
            let guard = row.read().await;
            stale.extend(
                guard
                    .reservations
                    .values()
                    .filter(|r| r.status == ReservationStatus::Pending && r.reserved_at <= cutoff)
                    .map(|r| (r.reserved_at, r.id)),
            );
        }
        stale.sort();
        stale.into_iter().map(|(_, id)| id).collect()
    }
}
