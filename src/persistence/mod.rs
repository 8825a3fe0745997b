//! Persistence layer - Durable storage of provisioned stone records

mod database;
mod error;

pub use database::{HistoryEvent, RecordStore};
pub use error::{StoreError, StoreResult};
