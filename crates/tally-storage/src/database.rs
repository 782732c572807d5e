// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread; the `Database` struct IS the single writer. Every ledger
//! transaction runs inside one `conn.call()` closure, which is what makes
//! check-then-mutate sequences race-free without a lock service.

use tally_config::StorageConfig;
use tally_core::TallyError;
use tracing::debug;

/// Convert a tokio-rusqlite error into `TallyError::Storage`.
pub fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> TallyError {
    TallyError::Storage {
        source: Box::new(e),
    }
}

/// Convert a bare rusqlite error into `TallyError::Storage`.
pub fn map_sql_err(e: rusqlite::Error) -> TallyError {
    TallyError::Storage {
        source: Box::new(e),
    }
}

/// Handle to the SQLite database backing all shards.
///
/// Wraps a single `tokio_rusqlite::Connection`. Query modules accept
/// `&Database` (or a `&rusqlite::Connection` inside a `call` closure) and
/// never open additional connections for writes.
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (or create) the database at `path` with WAL mode enabled and
    /// base-schema migrations applied.
    pub async fn open(path: &str) -> Result<Self, TallyError> {
        Self::open_with(path, true).await
    }

    /// Open the database described by a [`StorageConfig`].
    pub async fn from_config(config: &StorageConfig) -> Result<Self, TallyError> {
        Self::open_with(&config.database_path, config.wal_mode).await
    }

    async fn open_with(path: &str, wal_mode: bool) -> Result<Self, TallyError> {
        // PRAGMA setup and migrations run on a short-lived blocking
        // connection before the async connection takes over the file.
        let setup_path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), TallyError> {
            let mut conn = rusqlite::Connection::open(&setup_path).map_err(map_sql_err)?;
            if wal_mode {
                conn.pragma_update(None, "journal_mode", "WAL")
                    .map_err(map_sql_err)?;
            }
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(map_sql_err)?;
            crate::migrations::run_migrations(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| TallyError::Internal(format!("database setup task failed: {e}")))??;

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| TallyError::Storage {
                source: Box::new(e),
            })?;
        conn.call(|conn| -> Result<(), rusqlite::Error> {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path, wal_mode, "database opened");
        Ok(Self { conn })
    }

    /// The underlying tokio-rusqlite connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Checkpoint the WAL before shutdown.
    pub async fn close(&self) -> Result<(), TallyError> {
        self.conn
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}
