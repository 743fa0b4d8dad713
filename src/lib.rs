pub mod auth;
pub mod availability;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod reservation;
pub mod restock;
pub mod schedule;
pub mod sql;
pub mod tls;
pub mod transfer;
pub mod wal;
pub mod wire;
