//! PostgreSQL backend for kairan.
//!
//! [`PostgresStore`] implements [`kairan_core::JobStore`] over the
//! `kairan_jobs` table; [`Listener`] turns `NOTIFY` into worker wake-ups.
pub use kairan_core;
pub use sqlx::PgPool;

mod error;
pub mod listener;
mod queries;
mod store;

pub use error::Error;
pub use listener::{Listener, Subscribe, WorkerWithListenerExt};
pub use store::PostgresStore;

/// Channel every enqueue and manual reset notifies.
pub const NOTIFY_CHANNEL_NAME: &str = "kairan_jobs";

/// Schema migrations for the job table.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
