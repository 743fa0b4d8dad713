use std::collections::HashSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::catalog::TargetError;
use crate::ledger::BranchStock;
use crate::limits::*;
use crate::model::*;

use super::{apply_to_row, bulk_row_events, ledger_failure, Engine, EngineError};

impl Engine {
    /// Ledger rows may exist for inactive products or branches (kept at
    /// zero), but never for ids the directory has not heard of.
    fn check_known(&self, key: StockKey) -> Result<(), EngineError> {
        if !self.catalog.has_product(&key.product_id) {
            return Err(TargetError::UnknownProduct(key.product_id).into());
        }
        if !self.catalog.has_branch(&key.branch_id) {
            return Err(TargetError::UnknownBranch(key.branch_id).into());
        }
        Ok(())
    }

    /// Return the row for (product, branch), creating a zero row if needed.
    pub async fn get_or_create(&self, product_id: Ulid, branch_id: Ulid) -> Result<BranchStock, EngineError> {
        let key = StockKey::new(product_id, branch_id);
        self.check_known(key)?;
        let _gate = self.commit_gate.read().await;
        let row = self.open_row(key).await?;
        let guard = row.read().await;
        Ok(guard.stock)
    }

    /// Administrative stock correction. Cannot go below what is reserved.
    pub async fn set_stock(
        &self,
        product_id: Ulid,
        branch_id: Ulid,
        stock_quantity: u32,
    ) -> Result<BranchStock, EngineError> {
        if stock_quantity > MAX_STOCK_QUANTITY {
            return Err(EngineError::LimitExceeded("stock quantity too large"));
        }
        let key = StockKey::new(product_id, branch_id);
        self.check_known(key)?;

        let _gate = self.commit_gate.read().await;
        let row = self.open_row(key).await?;
        let mut guard = row.write().await;

        let mut trial = guard.stock;
        if let Err(e) = trial.set_stock(stock_quantity) {
            debug!(%key, stock_quantity, error = %e, "stock update rejected");
            return Err(ledger_failure(e));
        }

        let event = Event::StockSet { key, stock_quantity };
        self.persist_row(&mut guard, &event).await?;
        let stock = guard.stock;
        drop(guard);

        info!(%key, stock_quantity, "stock set");
        self.check_low_stock(&stock);
        Ok(stock)
    }

    /// Set stock for one product at many branches. All-or-nothing: every row
    /// is locked (in key order) and validated before anything is written.
    pub async fn set_stock_bulk(
        &self,
        product_id: Ulid,
        entries: Vec<(Ulid, u32)>,
    ) -> Result<Vec<BranchStock>, EngineError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::new();
        for (branch_id, qty) in &entries {
            if !seen.insert(*branch_id) {
                return Err(EngineError::Invalid(format!("branch {branch_id} listed twice")));
            }
            if *qty > MAX_STOCK_QUANTITY {
                return Err(EngineError::LimitExceeded("stock quantity too large"));
            }
            self.check_known(StockKey::new(product_id, *branch_id))?;
        }

        let mut entries = entries;
        entries.sort_by_key(|(branch_id, _)| *branch_id);

        let _gate = self.commit_gate.read().await;
        let mut guards = Vec::with_capacity(entries.len());
        for (branch_id, _) in &entries {
            let row = self.open_row(StockKey::new(product_id, *branch_id)).await?;
            guards.push(row.write_owned().await);
        }

        // Phase 1: validate every row.
        for ((_, qty), guard) in entries.iter().zip(&guards) {
            let mut trial = guard.stock;
            trial.set_stock(*qty).map_err(ledger_failure)?;
        }

        // Phase 2: one WAL record for the whole batch, then every row.
        self.wal_append(&Event::StockBulkSet {
            product_id,
            entries: entries.clone(),
        })
        .await?;
        let mut updated = Vec::with_capacity(entries.len());
        for ((_, part), guard) in bulk_row_events(product_id, &entries).zip(guards.iter_mut()) {
            apply_to_row(guard, &part).map_err(ledger_failure)?;
            updated.push(guard.stock);
        }
        drop(guards);

        info!(product = %product_id, rows = updated.len(), "bulk stock set");
        for stock in &updated {
            self.check_low_stock(stock);
        }
        Ok(updated)
    }

    pub async fn set_low_stock_threshold(
        &self,
        product_id: Ulid,
        branch_id: Ulid,
        threshold: u32,
    ) -> Result<BranchStock, EngineError> {
        if threshold > MAX_STOCK_QUANTITY {
            return Err(EngineError::LimitExceeded("threshold too large"));
        }
        let key = StockKey::new(product_id, branch_id);
        self.check_known(key)?;

        let _gate = self.commit_gate.read().await;
        let row = self.open_row(key).await?;
        let mut guard = row.write().await;
        let event = Event::ThresholdSet { key, threshold };
        self.persist_row(&mut guard, &event).await?;
        let stock = guard.stock;
        drop(guard);

        self.check_low_stock(&stock);
        Ok(stock)
    }

    /// Shift stock on several rows and log `event` as the record of it.
    /// Rows are locked in key order and checked before the append. The caller
    /// holds the commit gate; keys must be distinct.
    pub(super) async fn commit_stock_shifts(
        &self,
        shifts: &[(StockKey, i64)],
        event: &Event,
    ) -> Result<Vec<BranchStock>, EngineError> {
        let mut shifts = shifts.to_vec();
        shifts.sort_by_key(|(key, _)| *key);

        let mut guards = Vec::with_capacity(shifts.len());
        for (key, _) in &shifts {
            let row = self.open_row(*key).await?;
            guards.push(row.write_owned().await);
        }
        for ((key, delta), guard) in shifts.iter().zip(&guards) {
            let mut trial = guard.stock;
            if let Err(e) = trial.shift_stock(*delta) {
                debug!(%key, delta, error = %e, "stock shift rejected");
                return Err(ledger_failure(e));
            }
            if trial.stock_quantity > MAX_STOCK_QUANTITY {
                return Err(EngineError::LimitExceeded("stock quantity too large"));
            }
        }

        self.wal_append(event).await?;
        let mut updated = Vec::with_capacity(shifts.len());
        for ((_, delta), guard) in shifts.iter().zip(guards.iter_mut()) {
            guard.stock.shift_stock(*delta).map_err(ledger_failure)?;
            updated.push(guard.stock);
        }
        Ok(updated)
    }
}
