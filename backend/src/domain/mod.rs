//! # Domain Module
//!
//! Contains all business logic for the tutor book backend.
//!
//! ## Module Organization
//!
//! - **clock**: timezone-correct conversion between civil wall-clock time
//!   and UTC instants; every piece of range and recurrence math goes
//!   through it
//! - **range_cache**: range-keyed lesson cache with out-of-order load
//!   fencing and cross-range mutation propagation
//! - **recurrence_service**: weekly series expansion and the edit / detach /
//!   delete semantics around series occurrences
//! - **ledger_service**: the lesson status machine and the credit balance
//!   ledger (append-only payment events)
//! - **notification_service**: idempotent reminder dispatch through the
//!   messaging gateway
//! - **commands**: command structs the services consume
//!
//! ## Business Rules
//!
//! - A lesson's balance effect only ever happens through a payment event
//! - Completion and cancellation are terminal for lesson status
//! - A cached range entry holds a lesson iff its start instant is inside
//!   the range bounds
//! - At most one notification log row per dedupe key

pub mod clock;
pub mod commands;
pub mod ledger_service;
pub mod notification_service;
pub mod range_cache;
pub mod recurrence_service;

pub use ledger_service::*;
pub use notification_service::*;
pub use range_cache::*;
pub use recurrence_service::*;
