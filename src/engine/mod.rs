mod catalog;
mod error;
mod queries;
mod reservations;
mod restocks;
mod schedule;
mod stock;
#[cfg(test)]
mod tests;
mod transfers;

pub use error::EngineError;
pub use queries::LedgerViolation;
pub use restocks::RestockInput;
pub use schedule::ScheduleChangeInput;
pub use transfers::{TransferFilter, TransferInput};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, info};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::ledger::{BranchStock, LedgerError};
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::observability;
use crate::reservation::{self, LedgerEffect};
use crate::restock::RestockRequest;
use crate::schedule::{ScheduleChangeRequest, WeeklySlot};
use crate::transfer::{Route, StockTransfer};
use crate::wal::Wal;

/// One ledger row and every reservation ever made against it.
///
/// Reservations live inside the row so a status write and its ledger effect
/// happen under the same lock.
#[derive(Debug, Clone)]
pub struct RowState {
    pub stock: BranchStock,
    pub reservations: BTreeMap<Ulid, Reservation>,
}

impl RowState {
    pub fn new(key: StockKey) -> Self {
        Self {
            stock: BranchStock::new(key),
            reservations: BTreeMap::new(),
        }
    }

    /// Sum of quantities still holding stock (pending + approved).
    pub fn held_quantity(&self) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.status.holds_stock())
            .map(|r| u64::from(r.quantity))
            .sum()
    }
}

pub type SharedRow = Arc<RwLock<RowState>>;
pub type SharedRequest = Arc<Mutex<ScheduleChangeRequest>>;
pub type SharedTransfer = Arc<Mutex<StockTransfer>>;
pub type SharedRestock = Arc<Mutex<RestockRequest>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive together share one fsync; any other
/// command first flushes the batch collected so far.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer for the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub(super) rows: DashMap<StockKey, SharedRow>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub catalog: Catalog,
    /// Reservation id → the row that owns it.
    pub(super) reservation_rows: DashMap<Ulid, StockKey>,
    /// (user, product) → the user's single pending reservation for it.
    pub(super) pending_claims: DashMap<(Ulid, Ulid), Ulid>,
    pub(super) schedule_requests: DashMap<Ulid, SharedRequest>,
    /// Every schedule-change id ever taken, including ones still being logged.
    pub(super) schedule_ids: DashSet<Ulid>,
    /// (requester, day_of_week) → pending schedule-change request.
    pub(super) pending_schedule: DashMap<(Ulid, u8), Ulid>,
    pub(super) weekly: DashMap<Ulid, BTreeMap<u8, WeeklySlot>>,
    pub(super) transfers: DashMap<Ulid, SharedTransfer>,
    pub(super) transfer_ids: DashSet<Ulid>,
    /// Route → the open (pending or approved) transfer on it.
    pub(super) open_transfers: DashMap<Route, Ulid>,
    pub(super) restocks: DashMap<Ulid, SharedRestock>,
    pub(super) restock_ids: DashSet<Ulid>,
    /// Ledger row → its pending restock request.
    pub(super) pending_restocks: DashMap<StockKey, Ulid>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot and the WAL swap see no write in between.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a row-scoped event. The caller holds the row lock (or owns the row
/// during replay). Ledger effect first, then the reservation write, so an
/// error leaves the row untouched.
fn apply_to_row(row: &mut RowState, event: &Event) -> Result<(), LedgerError> {
    match event {
        Event::StockSet { stock_quantity, .. } => {
            row.stock.set_stock(*stock_quantity)?;
        }
        Event::ThresholdSet { threshold, .. } => {
            row.stock.set_low_stock_threshold(*threshold);
        }
        Event::ReservationCreated {
            id,
            user_id,
            key,
            quantity,
            notes,
            at,
        } => {
            if row.reservations.contains_key(id) {
                return Err(LedgerError::InvariantViolation(format!("reservation {id} recorded twice")));
            }
            row.stock.adjust_reserved(i64::from(*quantity), None)?;
            row.reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    user_id: *user_id,
                    product_id: key.product_id,
                    branch_id: key.branch_id,
                    quantity: *quantity,
                    status: ReservationStatus::Pending,
                    notes: notes.clone(),
                    admin_notes: None,
                    reserved_at: *at,
                    approved_at: None,
                    rejected_at: None,
                    closed_at: None,
                    last_actor: None,
                },
            );
        }
        Event::ReservationTransitioned {
            id,
            action,
            actor_id,
            admin_notes,
            at,
            ..
        } => {
            let res = row
                .reservations
                .get_mut(id)
                .ok_or_else(|| LedgerError::InvariantViolation(format!("transition of unknown reservation {id}")))?;
            let transition = reservation::plan(res.status, *action, res.quantity)
                .map_err(|e| LedgerError::InvariantViolation(format!("{id}: {e}")))?;
            match transition.effect {
                LedgerEffect::Keep => {}
                LedgerEffect::Release(q) => {
                    row.stock.adjust_reserved(-i64::from(q), None)?;
                }
                LedgerEffect::Consume(q) => {
                    row.stock.decrement_stock_on_fulfillment(q)?;
                }
            }
            reservation::apply(res, transition.to, *actor_id, admin_notes.clone(), *at);
        }
        Event::ReservationQuantityChanged { id, quantity, actor_id, .. } => {
            let res = row
                .reservations
                .get_mut(id)
                .ok_or_else(|| LedgerError::InvariantViolation(format!("update of unknown reservation {id}")))?;
            if res.status != ReservationStatus::Pending {
                return Err(LedgerError::InvariantViolation(format!(
                    "{id}: quantity changed while {}",
                    res.status
                )));
            }
            let delta = i64::from(*quantity) - i64::from(res.quantity);
            if delta != 0 {
                row.stock.adjust_reserved(delta, None)?;
            }
            res.quantity = *quantity;
            res.last_actor = Some(*actor_id);
        }
        Event::RowSnapshot {
            stock_quantity,
            reserved_quantity,
            threshold,
            ..
        } => {
            row.stock.stock_quantity = *stock_quantity;
            row.stock.reserved_quantity = *reserved_quantity;
            row.stock.low_stock_threshold = *threshold;
            row.stock.check_invariant()?;
        }
        Event::ReservationRestored { reservation } => {
            row.reservations.insert(reservation.id, reservation.clone());
        }
        // Not row-scoped, or split into per-row parts before replay.
        Event::StockRowOpened { .. }
        | Event::StockBulkSet { .. }
        | Event::ProductRegistered { .. }
        | Event::ProductActiveSet { .. }
        | Event::BranchRegistered { .. }
        | Event::BranchActiveSet { .. }
        | Event::ScheduleChangeRequested { .. }
        | Event::ScheduleChangeReviewed { .. }
        | Event::ScheduleChangeRestored { .. }
        | Event::TransferRequested { .. }
        | Event::TransferTransitioned { .. }
        | Event::TransferRestored { .. }
        | Event::RestockRequested { .. }
        | Event::RestockTransitioned { .. }
        | Event::RestockRestored { .. } => {}
    }
    Ok(())
}

/// The ledger row a row-scoped event belongs to.
fn event_key(event: &Event) -> Option<StockKey> {
    match event {
        Event::StockRowOpened { key }
        | Event::StockSet { key, .. }
        | Event::ThresholdSet { key, .. }
        | Event::ReservationCreated { key, .. }
        | Event::ReservationTransitioned { key, .. }
        | Event::ReservationQuantityChanged { key, .. }
        | Event::RowSnapshot { key, .. } => Some(*key),
        Event::ReservationRestored { reservation } => Some(reservation.key()),
        Event::StockBulkSet { .. }
        | Event::ProductRegistered { .. }
        | Event::ProductActiveSet { .. }
        | Event::BranchRegistered { .. }
        | Event::BranchActiveSet { .. }
        | Event::ScheduleChangeRequested { .. }
        | Event::ScheduleChangeReviewed { .. }
        | Event::ScheduleChangeRestored { .. }
        | Event::TransferRequested { .. }
        | Event::TransferTransitioned { .. }
        | Event::TransferRestored { .. }
        | Event::RestockRequested { .. }
        | Event::RestockTransitioned { .. }
        | Event::RestockRestored { .. } => None,
    }
}

/// The per-row parts of a bulk stock event, in entry order.
fn bulk_row_events(product_id: Ulid, entries: &[(Ulid, u32)]) -> impl Iterator<Item = (StockKey, Event)> + '_ {
    entries.iter().map(move |&(branch_id, stock_quantity)| {
        let key = StockKey::new(product_id, branch_id);
        (key, Event::StockSet { key, stock_quantity })
    })
}

/// Turn a ledger failure into an engine error. Invariant violations are
/// logged and counted here, never swallowed.
pub(super) fn ledger_failure(err: LedgerError) -> EngineError {
    if let LedgerError::InvariantViolation(msg) = &err {
        error!(%msg, "ledger invariant violation");
        metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    }
    err.into()
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rows: DashMap::new(),
            wal_tx,
            notify,
            catalog: Catalog::new(),
            reservation_rows: DashMap::new(),
            pending_claims: DashMap::new(),
            schedule_requests: DashMap::new(),
            schedule_ids: DashSet::new(),
            pending_schedule: DashMap::new(),
            weekly: DashMap::new(),
            transfers: DashMap::new(),
            transfer_ids: DashSet::new(),
            open_transfers: DashMap::new(),
            restocks: DashMap::new(),
            restock_ids: DashSet::new(),
            pending_restocks: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // Replay into plain maps; nothing else can see them yet.
        let mut rows: HashMap<StockKey, RowState> = HashMap::new();
        let mut requests: HashMap<Ulid, ScheduleChangeRequest> = HashMap::new();
        let mut transfer_log: HashMap<Ulid, StockTransfer> = HashMap::new();
        let mut restock_log: HashMap<Ulid, RestockRequest> = HashMap::new();
        let replay_row = |rows: &mut HashMap<StockKey, RowState>, key: StockKey, event: &Event| {
            let row = rows.entry(key).or_insert_with(|| RowState::new(key));
            if let Err(e) = apply_to_row(row, event) {
                error!(%key, error = %e, "replay: event could not be applied");
                metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
            }
        };
        for event in &events {
            if let Some(key) = event_key(event) {
                replay_row(&mut rows, key, event);
                continue;
            }
            if let Event::StockBulkSet { product_id, entries } = event {
                for (key, part) in bulk_row_events(*product_id, entries) {
                    replay_row(&mut rows, key, &part);
                }
                continue;
            }
            engine.apply_directory_event(event);
            engine.replay_schedule_event(&mut requests, event);
            let shifts = transfers::replay_transfer_event(&mut transfer_log, event)
                .into_iter()
                .chain(restocks::replay_restock_event(&mut restock_log, event));
            for (key, delta) in shifts {
                let row = rows.entry(key).or_insert_with(|| RowState::new(key));
                if let Err(e) = row.stock.shift_stock(delta) {
                    error!(%key, delta, error = %e, "replay: stock shift could not be applied");
                    metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
                }
            }
        }

        for (key, row) in rows {
            for res in row.reservations.values() {
                engine.reservation_rows.insert(res.id, key);
                if res.status == ReservationStatus::Pending {
                    engine.pending_claims.insert((res.user_id, res.product_id), res.id);
                }
            }
            for violation in queries::audit_row(&row) {
                error!(key = %violation.key, detail = %violation.detail, "replay: ledger audit failed");
                metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
            }
            engine.rows.insert(key, Arc::new(RwLock::new(row)));
        }
        for (id, req) in requests {
            if req.status == crate::schedule::ScheduleStatus::Pending {
                engine.pending_schedule.insert((req.requester_id, req.day_of_week), id);
            }
            engine.schedule_ids.insert(id);
            engine.schedule_requests.insert(id, Arc::new(Mutex::new(req)));
        }
        engine.restore_transfers(transfer_log);
        engine.restore_restocks(restock_log);

        if !events.is_empty() {
            info!(
                events = events.len(),
                rows = engine.rows.len(),
                reservations = engine.reservation_rows.len(),
                "replayed WAL"
            );
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the locked row.
    pub(super) async fn persist_row(&self, row: &mut RowState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_row(row, event).map_err(ledger_failure)
    }

    pub(super) fn get_row(&self, key: &StockKey) -> Option<SharedRow> {
        self.rows.get(key).map(|e| e.value().clone())
    }

    /// Insert-or-fetch. Two racing openers both log the open, and replay
    /// collapses them onto one row, so exactly one row ever exists per key.
    pub(super) async fn open_row(&self, key: StockKey) -> Result<SharedRow, EngineError> {
        if let Some(row) = self.get_row(&key) {
            return Ok(row);
        }
        self.wal_append(&Event::StockRowOpened { key }).await?;
        let row = self
            .rows
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(RowState::new(key))))
            .value()
            .clone();
        Ok(row)
    }

    /// Publish a low-stock notice if the row sits at or under its threshold.
    pub(super) fn check_low_stock(&self, stock: &BranchStock) {
        if stock.is_low() {
            metrics::counter!(observability::LOW_STOCK_NOTICES_TOTAL).increment(1);
            self.notify.send(Notice::LowStock {
                product_id: stock.product_id,
                branch_id: stock.branch_id,
                available: stock.available(),
                threshold: stock.low_stock_threshold,
            });
        }
    }

    /// Rewrite the WAL as the minimal event set recreating the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for p in self.catalog.products() {
            events.push(Event::ProductRegistered {
                id: p.id,
                name: p.name,
                category: p.category,
                price_cents: p.price_cents,
                active: p.active,
            });
        }
        for b in self.catalog.branches() {
            events.push(Event::BranchRegistered {
                id: b.id,
                code: b.code,
                name: b.name,
                active: b.active,
            });
        }

        let mut keys: Vec<StockKey> = self.rows.iter().map(|e| *e.key()).collect();
        keys.sort();
        for key in keys {
            let Some(row) = self.get_row(&key) else { continue };
            let guard = row.read().await;
            events.push(Event::RowSnapshot {
                key,
                stock_quantity: guard.stock.stock_quantity,
                reserved_quantity: guard.stock.reserved_quantity,
                threshold: guard.stock.low_stock_threshold,
            });
            // Terminal reservations are kept for audit.
            for res in guard.reservations.values() {
                events.push(Event::ReservationRestored { reservation: res.clone() });
            }
        }

        let handles: Vec<SharedRequest> = self.schedule_requests.iter().map(|e| e.value().clone()).collect();
        let mut requests = Vec::with_capacity(handles.len());
        for handle in handles {
            requests.push(handle.lock().await.clone());
        }
        // Later approvals overwrite earlier slots on replay.
        requests.sort_by_key(|r| (r.reviewed_at, r.id));
        for request in requests {
            events.push(Event::ScheduleChangeRestored { request });
        }

        let handles: Vec<SharedTransfer> = self.transfers.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let transfer = handle.lock().await.clone();
            events.push(Event::TransferRestored { transfer });
        }
        let handles: Vec<SharedRestock> = self.restocks.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let request = handle.lock().await.clone();
            events.push(Event::RestockRestored { request });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
