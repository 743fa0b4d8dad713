// Input bounds enforced at the engine boundary.

pub const MAX_PRODUCTS: usize = 100_000;
pub const MAX_BRANCHES: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 32;
pub const MAX_CATEGORY_LEN: usize = 64;

/// Reservation notes written by the customer.
pub const MAX_NOTES_LEN: usize = 500;
/// Notes written by staff or an admin when reviewing.
pub const MAX_ADMIN_NOTES_LEN: usize = 1000;
pub const MAX_REASON_LEN: usize = 1000;

/// One million currency units.
pub const MAX_PRICE_CENTS: i64 = 100_000_000;

pub const MAX_RESERVATION_QUANTITY: u32 = 10_000;
pub const MAX_STOCK_QUANTITY: u32 = 1_000_000;
pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_ACTOR_BRANCHES: usize = 64;
pub const MAX_RESERVATIONS_PER_ROW: usize = 100_000;

pub const DEFAULT_LOW_STOCK_THRESHOLD: u32 = 5;
