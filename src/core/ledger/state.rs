use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::LedgerError;

/// SQLite result code for "file is not a database".
const SQLITE_NOTADB: &str = "26";

/// Open store file for one ledger.
///
/// Appends take `writer` so that, within this process, each append sees the
/// totals of every append before it.
pub(super) struct LedgerState {
    file: PathBuf,
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl std::fmt::Debug for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerState")
            .field("file", &self.file)
            .finish()
    }
}

impl LedgerState {
    /// Open (creating if missing) the store file and bring its schema up to
    /// date.
    pub(super) async fn open(file: &Path) -> Result<Self, LedgerError> {
        let existed = file.is_file();
        let connect_opts = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_opts)
            .await
            .map_err(|e| open_error(file, e))?;

        if let Err(source) = sqlx::migrate!("./migrations").run(&pool).await {
            pool.close().await;
            return Err(match source {
                sqlx::migrate::MigrateError::Execute(e) => open_error(file, e),
                source => LedgerError::Migration {
                    path: file.to_path_buf(),
                    source,
                },
            });
        }
        debug!(file = %file.display(), existed, "Ledger opened");

        Ok(Self {
            file: file.to_path_buf(),
            pool,
            writer: Mutex::new(()),
        })
    }

    pub(super) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(super) fn file(&self) -> &Path {
        &self.file
    }

    pub(super) async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    pub(super) fn persistence_error(&self, source: sqlx::Error) -> LedgerError {
        LedgerError::Persistence {
            path: self.file.clone(),
            source,
        }
    }

    pub(super) async fn close(&self) {
        self.pool.close().await;
    }
}

fn open_error(file: &Path, source: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &source {
        if db.code().as_deref() == Some(SQLITE_NOTADB) {
            return LedgerError::Corrupt {
                path: file.to_path_buf(),
                detail: db.message().to_string(),
            };
        }
    }
    LedgerError::Persistence {
        path: file.to_path_buf(),
        source,
    }
}
