use std::collections::BTreeMap;

use tracing::error;
use ulid::Ulid;

use crate::availability::{self, ProductAvailability, StockSummary};
use crate::ledger::BranchStock;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, RowState};

/// A row whose counts disagree with the ledger invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerViolation {
    pub key: StockKey,
    pub detail: String,
}

/// Check `0 <= reserved <= stock` and that `reserved` equals the quantity
/// held by pending and approved reservations.
pub(super) fn audit_row(row: &RowState) -> Vec<LedgerViolation> {
    let mut out = Vec::new();
    let key = row.stock.key();
    if let Err(e) = row.stock.check_invariant() {
        out.push(LedgerViolation {
            key,
            detail: e.to_string(),
        });
    }
    let held = row.held_quantity();
    if held != u64::from(row.stock.reserved_quantity) {
        out.push(LedgerViolation {
            key,
            detail: format!(
                "reserved {} but open reservations hold {held}",
                row.stock.reserved_quantity
            ),
        });
    }
    out
}

impl Engine {
    /// Copy out rows matching `filter`, each read under its own lock.
    async fn collect_rows(&self, filter: impl Fn(&StockKey) -> bool) -> Vec<BranchStock> {
        let rows: Vec<_> = self
            .rows
            .iter()
            .filter(|e| filter(e.key()))
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.read().await.stock);
        }
        out.sort_by_key(|s| s.key());
        out
    }

    pub async fn stock(&self, product_id: Ulid, branch_id: Ulid) -> Option<StockInfo> {
        let row = self.get_row(&StockKey::new(product_id, branch_id))?;
        let guard = row.read().await;
        Some(StockInfo::from(&guard.stock))
    }

    /// `{branch_id: available}` for a product, optionally narrowed to one
    /// branch. A known branch without a row reports 0.
    pub async fn availability(
        &self,
        product_id: Ulid,
        branch_id: Option<Ulid>,
    ) -> Result<BTreeMap<Ulid, u32>, EngineError> {
        if !self.catalog.has_product(&product_id) {
            return Err(EngineError::NotFound(product_id));
        }
        let view = self.product_availability(product_id).await?;
        match branch_id {
            None => Ok(view.by_branch),
            Some(b) => {
                if !self.catalog.has_branch(&b) {
                    return Err(EngineError::NotFound(b));
                }
                Ok(BTreeMap::from([(b, view.available_at(&b))]))
            }
        }
    }

    pub async fn product_availability(&self, product_id: Ulid) -> Result<ProductAvailability, EngineError> {
        if !self.catalog.has_product(&product_id) {
            return Err(EngineError::NotFound(product_id));
        }
        let rows = self.collect_rows(|k| k.product_id == product_id).await;
        Ok(availability::product_availability(product_id, &rows))
    }

    pub async fn available_anywhere(&self, product_id: Ulid) -> Result<bool, EngineError> {
        Ok(self.product_availability(product_id).await?.available_anywhere())
    }

    pub async fn branch_stock(&self, product_id: Option<Ulid>, branch_id: Option<Ulid>) -> Vec<StockInfo> {
        self.collect_rows(|k| {
            product_id.is_none_or(|p| p == k.product_id) && branch_id.is_none_or(|b| b == k.branch_id)
        })
        .await
        .iter()
        .map(StockInfo::from)
        .collect()
    }

    pub async fn branch_summary(&self, branch_id: Ulid) -> Result<StockSummary, EngineError> {
        if !self.catalog.has_branch(&branch_id) {
            return Err(EngineError::NotFound(branch_id));
        }
        let rows = self.collect_rows(|k| k.branch_id == branch_id).await;
        Ok(availability::stock_summary(&rows))
    }

    /// Rows whose available quantity is at or under their threshold.
    pub async fn low_stock(&self, branch_id: Option<Ulid>) -> Vec<StockInfo> {
        self.collect_rows(|k| branch_id.is_none_or(|b| b == k.branch_id))
            .await
            .iter()
            .filter(|s| s.is_low())
            .map(StockInfo::from)
            .collect()
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let key = self
            .reservation_rows
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let row = self.get_row(&key).ok_or(EngineError::NotFound(id))?;
        let guard = row.read().await;
        guard.reservations.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations matching every set field of `filter`, newest first.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let rows: Vec<_> = self
            .rows
            .iter()
            .filter(|e| filter.branch_id.is_none_or(|b| b == e.key().branch_id))
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::new();
        for row in rows {
            let guard = row.read().await;
            out.extend(guard.reservations.values().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at).then(b.id.cmp(&a.id)));
        out
    }

    /// What the user owes at pickup: quantity × price over approved reservations.
    pub async fn approved_total(&self, user_id: Ulid) -> Result<i64, EngineError> {
        let filter = ReservationFilter {
            status: Some(ReservationStatus::Approved),
            user_id: Some(user_id),
            ..Default::default()
        };
        self.list_reservations(&filter)
            .await
            .iter()
            .try_fold(0i64, |total, r| {
                let price = self.catalog.price_cents(&r.product_id).unwrap_or(0);
                i64::from(r.quantity)
                    .checked_mul(price)
                    .and_then(|line| total.checked_add(line))
                    .ok_or(EngineError::LimitExceeded("approved total overflows"))
            })
    }

    /// Audit every row under its read lock. Violations are logged and counted.
    pub async fn verify_ledger(&self) -> Vec<LedgerViolation> {
        let rows: Vec<_> = self.rows.iter().map(|e| e.value().clone()).collect();
        let mut violations = Vec::new();
        for row in rows {
            let guard = row.read().await;
            violations.extend(audit_row(&guard));
        }
        for v in &violations {
            error!(key = %v.key, detail = %v.detail, "ledger audit failed");
            metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
        }
        violations
    }
}
