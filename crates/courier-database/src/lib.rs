//! SQLite persistence for the Courier delivery core.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Database migrations for the outbox and idempotency tables
//! - Row models
//! - Standalone query functions, each a single atomic statement
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite operations.
//! Queries are sent through a channel and executed in FIFO order.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let dead = db.call(|conn| queries::count_dead(conn, &DeadItemFilter::default())).await?;
//! ```
//!
//! Separate processes open their own `AsyncDatabase` on the same file. Cross-process
//! correctness comes from conditional updates, never from in-memory locks.

mod error;
mod executor;
mod functions;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use functions::register_functions;
pub use migrations::run_migrations;
pub use models::*;
