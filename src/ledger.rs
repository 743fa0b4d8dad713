use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::availability::available_quantity;
use crate::limits::DEFAULT_LOW_STOCK_THRESHOLD;
use crate::model::StockKey;

/// One ledger row: physical and reserved units of a product at a branch.
///
/// Every mutation goes through the checked primitives below. Each primitive
/// either applies fully or returns an error and leaves the row untouched, so
/// `0 <= reserved_quantity <= stock_quantity` holds after every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchStock {
    pub product_id: Ulid,
    pub branch_id: Ulid,
    pub stock_quantity: u32,
    pub reserved_quantity: u32,
    pub low_stock_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The increment does not fit in what is left to offer.
    InsufficientStock { requested: u32, available: u32 },
    /// Stock cannot be set below what is already promised.
    BelowReserved { stock: u32, reserved: u32 },
    InvariantViolation(String),
    Invalid(&'static str),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientStock { requested, available } => {
                write!(f, "insufficient stock: requested {requested}, available {available}")
            }
            LedgerError::BelowReserved { stock, reserved } => {
                write!(f, "stock {stock} is below reserved quantity {reserved}")
            }
            LedgerError::InvariantViolation(msg) => write!(f, "ledger invariant violated: {msg}"),
            LedgerError::Invalid(msg) => write!(f, "invalid ledger operation: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl BranchStock {
    pub fn new(key: StockKey) -> Self {
        Self {
            product_id: key.product_id,
            branch_id: key.branch_id,
            stock_quantity: 0,
            reserved_quantity: 0,
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.branch_id)
    }

    /// Floored at zero, so an over-reserved row offers nothing.
    pub fn available(&self) -> u32 {
        available_quantity(i64::from(self.stock_quantity), i64::from(self.reserved_quantity)).unwrap_or(0)
    }

    pub fn is_low(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }

    pub fn check_invariant(&self) -> Result<(), LedgerError> {
        if self.reserved_quantity > self.stock_quantity {
            return Err(LedgerError::InvariantViolation(format!(
                "{}: reserved {} exceeds stock {}",
                self.key(),
                self.reserved_quantity,
                self.stock_quantity
            )));
        }
        Ok(())
    }

    /// `reserved_quantity += delta`.
    ///
    /// A positive delta must fit in the available quantity and, when given,
    /// in `expected_max_available` as well. A negative delta may not take the
    /// reserved quantity below zero.
    pub fn adjust_reserved(
        &mut self,
        delta: i64,
        expected_max_available: Option<u32>,
    ) -> Result<Self, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::Invalid("zero reservation adjustment"));
        }
        let magnitude = u32::try_from(delta.unsigned_abs())
            .map_err(|_| LedgerError::Invalid("adjustment out of range"))?;

        if delta > 0 {
            let ceiling = match expected_max_available {
                Some(max) => self.available().min(max),
                None => self.available(),
            };
            if magnitude > ceiling {
                return Err(LedgerError::InsufficientStock {
                    requested: magnitude,
                    available: ceiling,
                });
            }
            self.reserved_quantity += magnitude;
        } else {
            if magnitude > self.reserved_quantity {
                return Err(LedgerError::InvariantViolation(format!(
                    "{}: releasing {magnitude} with only {} reserved",
                    self.key(),
                    self.reserved_quantity
                )));
            }
            self.reserved_quantity -= magnitude;
        }
        Ok(*self)
    }

    /// Administrative correction of physical stock.
    pub fn set_stock(&mut self, stock_quantity: u32) -> Result<Self, LedgerError> {
        if stock_quantity < self.reserved_quantity {
            return Err(LedgerError::BelowReserved {
                stock: stock_quantity,
                reserved: self.reserved_quantity,
            });
        }
        self.stock_quantity = stock_quantity;
        Ok(*self)
    }

    /// Units arriving at (`delta > 0`) or leaving (`delta < 0`) the branch
    /// outside any reservation. Leaving units come out of the available
    /// quantity, so what is reserved stays covered.
    pub fn shift_stock(&mut self, delta: i64) -> Result<Self, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::Invalid("zero stock shift"));
        }
        let magnitude =
            u32::try_from(delta.unsigned_abs()).map_err(|_| LedgerError::Invalid("stock shift out of range"))?;
        if delta > 0 {
            self.stock_quantity = self
                .stock_quantity
                .checked_add(magnitude)
                .ok_or(LedgerError::Invalid("stock quantity overflow"))?;
        } else {
            let available = self.available();
            if magnitude > available {
                return Err(LedgerError::InsufficientStock {
                    requested: magnitude,
                    available,
                });
            }
            self.stock_quantity -= magnitude;
        }
        Ok(*self)
    }

    /// A reserved unit leaves the branch: stock and reserved drop together.
    pub fn decrement_stock_on_fulfillment(&mut self, quantity: u32) -> Result<Self, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::Invalid("zero fulfillment quantity"));
        }
        if quantity > self.reserved_quantity || quantity > self.stock_quantity {
            return Err(LedgerError::InvariantViolation(format!(
                "{}: fulfilling {quantity} with stock {} and reserved {}",
                self.key(),
                self.stock_quantity,
                self.reserved_quantity
            )));
        }
        self.stock_quantity -= quantity;
        self.reserved_quantity -= quantity;
        Ok(*self)
    }

    pub fn set_low_stock_threshold(&mut self, threshold: u32) -> Self {
        self.low_stock_threshold = threshold;
        *self
    }
}
