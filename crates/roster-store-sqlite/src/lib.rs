//! SQLite backend for the Roster AFK and membership stores.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every call is bounded by a timeout
//! that surfaces as [`roster_core::Error::StoreUnavailable`].

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{DEFAULT_OP_TIMEOUT, SqliteStore};

#[cfg(test)]
mod tests;
