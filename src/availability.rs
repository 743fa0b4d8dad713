//! Pure, lock-free derivations over already-consistent ledger rows.

use std::collections::BTreeMap;

use ulid::Ulid;

use crate::ledger::BranchStock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityError {
    NegativeInput { stock: i64, reserved: i64 },
}

impl std::fmt::Display for AvailabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AvailabilityError::NegativeInput { stock, reserved } => {
                write!(f, "negative quantity: stock {stock}, reserved {reserved}")
            }
        }
    }
}

impl std::error::Error for AvailabilityError {}

/// `stock - reserved` from raw counts. Never offers a negative number.
pub fn available_quantity(stock: i64, reserved: i64) -> Result<u32, AvailabilityError> {
    if stock < 0 || reserved < 0 {
        return Err(AvailabilityError::NegativeInput { stock, reserved });
    }
    let available = (stock - reserved).max(0);
    Ok(u32::try_from(available).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductAvailability {
    pub product_id: Ulid,
    pub by_branch: BTreeMap<Ulid, u32>,
    pub total_available: u64,
    pub branches_with_stock: usize,
}

impl ProductAvailability {
    pub fn available_anywhere(&self) -> bool {
        self.total_available > 0
    }

    pub fn available_at(&self, branch_id: &Ulid) -> u32 {
        self.by_branch.get(branch_id).copied().unwrap_or(0)
    }
}

/// Aggregate one product's rows into the listing view. Rows for other
/// products are ignored.
pub fn product_availability<'a>(
    product_id: Ulid,
    rows: impl IntoIterator<Item = &'a BranchStock>,
) -> ProductAvailability {
    let mut by_branch = BTreeMap::new();
    let mut total_available = 0u64;
    let mut branches_with_stock = 0usize;
    for row in rows.into_iter().filter(|r| r.product_id == product_id) {
        let available = row.available();
        by_branch.insert(row.branch_id, available);
        total_available += u64::from(available);
        if available > 0 {
            branches_with_stock += 1;
        }
    }
    ProductAvailability {
        product_id,
        by_branch,
        total_available,
        branches_with_stock,
    }
}

/// Counts for a branch's stock page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockSummary {
    pub total: usize,
    pub in_stock: usize,
    /// Available but at or under the row's threshold.
    pub low_stock: usize,
    pub out_of_stock: usize,
}

pub fn stock_summary<'a>(rows: impl IntoIterator<Item = &'a BranchStock>) -> StockSummary {
    let mut summary = StockSummary::default();
    for row in rows {
        summary.total += 1;
        let available = row.available();
        if available == 0 {
            summary.out_of_stock += 1;
        } else {
            summary.in_stock += 1;
            if available <= row.low_stock_threshold {
                summary.low_stock += 1;
            }
        }
    }
    summary
}
