//! SQLite storage backend built on sqlx.

pub mod db;
pub mod repositories;

pub use db::DbConnection;
