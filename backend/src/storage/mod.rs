//! # Storage Module
//!
//! Persistence for lessons, ledger accounts, payment events, notification
//! logs, and chat identities. The domain layer only sees the traits in
//! `traits`; the sqlite implementation lives under `sqlite`.

pub mod sqlite;
pub mod traits;

pub use traits::*;
