//! Persistent state: email templates, mailing lists (campaigns), subscribers
//! and the memberships joining the last two.
//!
//! Every multi-statement mutation runs in a single transaction; callers never
//! observe a half-created campaign or a list without its memberships removed.
//! No transaction is ever held across network I/O.

mod campaigns;
mod templates;

use std::fmt::Debug;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub use templates::Template;

use crate::configuration::DatabaseSettings;
use crate::utils::error_chain_fmt;

/// Lazily connected pool; nothing touches the file until the first query.
fn get_connection_pool(db_cfg: &DatabaseSettings) -> SqlitePool {
    SqlitePoolOptions::new().connect_lazy_with(db_cfg.connection())
}

/// SQLite allows one writer at a time. A transaction that reads before it
/// writes fails with SQLITE_BUSY (busy_timeout does not help) if another
/// connection wrote in the meantime, so every write goes through this single
/// connection and waits its turn in the pool queue instead.
fn get_writer_pool(db_cfg: &DatabaseSettings) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_lazy_with(db_cfg.connection())
}

#[derive(thiserror::Error)]
pub enum StoreError {
    #[error("A mailing list named {0:?} already exists")]
    DuplicateName(String),

    #[error("A template titled {0:?} already exists")]
    DuplicateTitle(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{email} is already subscribed to {list:?}")]
    AlreadyMember { list: String, email: String },

    #[error("Database failure")]
    Database(#[from] sqlx::Error),
}

impl Debug for StoreError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// Handle to the relational store. Cheap to clone (the pools are `Arc`s
/// internally); pass it to whoever needs persistence.
#[derive(Clone)]
pub struct Store {
    /// Reads only
    pool: SqlitePool,
    writer: SqlitePool,
}

impl Store {
    pub fn new(db_cfg: &DatabaseSettings) -> Self {
        Self {
            pool: get_connection_pool(db_cfg),
            writer: get_writer_pool(db_cfg),
        }
    }

    /// Create the tables if they don't exist yet. Migrations are embedded in
    /// the binary at compile time.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.writer).await
    }

    pub fn pool(&self) -> &SqlitePool { &self.pool }
}
