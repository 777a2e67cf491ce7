//! Core types, trait definitions, and engines for the Roster service.
//!
//! This crate is deliberately free of HTTP and database dependencies. It
//! owns the AFK lifecycle state machine, the membership reconciliation
//! engine, and the read projections served by the API layer.

pub mod afk;
pub mod clock;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod membership;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod store;

mod locks;

pub use error::{Error, Result};
