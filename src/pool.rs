//! Bounded pool of libsql connections.
//!
//! SQLite only admits one writer at a time, so write transactions also take
//! the pool-wide writer gate. Waiting on the gate is an async suspension
//! instead of a busy-wait inside SQLite, which keeps single-threaded runtimes
//! from stalling.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libsql::{Builder, Connection, Database, params};
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{HarvestError, HarvestResult};

/// Runs a pragma that may answer with a row (`busy_timeout`, `journal_mode`).
/// `execute_batch` rejects statements that return rows, so the answer is
/// read and discarded here.
async fn apply_pragma(conn: &Connection, pragma: &str) -> libsql::Result<()> {
    let mut rows = conn.query(pragma, params![]).await?;
    while rows.next().await?.is_some() {}
    Ok(())
}

/// Applied to every connection when it is opened.
async fn configure_connection(conn: &Connection) -> libsql::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;").await?;
    apply_pragma(conn, "PRAGMA busy_timeout=5000").await
}

/// Applied once per database file.
async fn configure_database(conn: &Connection) -> libsql::Result<()> {
    apply_pragma(conn, "PRAGMA journal_mode=WAL").await?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;").await?;
    Ok(())
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    db: Database,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    writer: Arc<tokio::sync::Mutex<()>>,
    size: usize,
}

impl ConnectionPool {
    /// Opens (and if necessary creates) the database file and prepares a pool
    /// that hands out at most `size` connections at once.
    pub async fn open(path: &Path, size: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let size = size.max(1);
        let pool = Self {
            inner: Arc::new(PoolInner {
                db,
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
                writer: Arc::new(tokio::sync::Mutex::new(())),
                size,
            }),
        };

        let conn = pool
            .acquire()
            .await
            .with_context(|| format!("connecting to {}", path.display()))?;
        configure_database(&conn)
            .await
            .context("configuring journal mode")?;
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Waits for a free slot, then reuses an idle connection or opens a new one.
    pub async fn acquire(&self) -> HarvestResult<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HarvestError::Persistence("connection pool is closed".into()))?;

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("opening new pooled connection");
                let conn = self.inner.db.connect()?;
                configure_connection(&conn).await?;
                conn
            }
        };

        Ok(PooledConnection {
            conn,
            pool: self.inner.clone(),
            poisoned: false,
            _permit: permit,
        })
    }
}

/// A checked-out connection. Dropping it hands the connection back to the
/// pool unless a transaction was left open on it.
pub struct PooledConnection {
    conn: Connection,
    pool: Arc<PoolInner>,
    poisoned: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Starts an immediate write transaction.
    pub async fn begin(&mut self) -> HarvestResult<ScopedTransaction<'_>> {
        let writer = self.pool.writer.clone().lock_owned().await;
        self.conn.execute("BEGIN IMMEDIATE", params![]).await?;
        Ok(ScopedTransaction {
            owner: self,
            finished: false,
            _writer: writer,
        })
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.poisoned {
            // Closing the connection makes SQLite roll back whatever is open.
            warn!("discarding pooled connection with an unfinished transaction");
            return;
        }
        self.pool.idle.lock().push(self.conn.clone());
    }
}

/// Write transaction bound to one pooled connection. It must end through
/// [`commit`](Self::commit) or [`rollback`](Self::rollback); a guard dropped
/// on any other path poisons the connection so it never returns to the pool
/// mid-transaction.
pub struct ScopedTransaction<'a> {
    owner: &'a mut PooledConnection,
    finished: bool,
    _writer: OwnedMutexGuard<()>,
}

impl ScopedTransaction<'_> {
    /// Commits; when the commit itself fails (deferred foreign keys are only
    /// checked here) the transaction is rolled back before returning.
    pub async fn commit(mut self) -> HarvestResult<()> {
        match self.owner.conn.execute("COMMIT", params![]).await {
            Ok(_) => {
                self.finished = true;
                Ok(())
            }
            Err(err) => {
                self.rollback_in_place().await;
                Err(err.into())
            }
        }
    }

    pub async fn rollback(mut self) {
        self.rollback_in_place().await;
    }

    async fn rollback_in_place(&mut self) {
        match self.owner.conn.execute("ROLLBACK", params![]).await {
            Ok(_) => self.finished = true,
            Err(err) => warn!(error = %err, "rollback failed"),
        }
    }
}

impl Deref for ScopedTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.owner.conn
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.owner.poisoned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn scratch_pool(size: usize) -> Result<(tempfile::TempDir, ConnectionPool)> {
        let dir = tempdir()?;
        let pool = ConnectionPool::open(&dir.path().join("nested/pool.db"), size).await?;
        let conn = pool.acquire().await?;
        conn.execute("CREATE TABLE items (id TEXT PRIMARY KEY)", params![])
            .await?;
        drop(conn);
        Ok((dir, pool))
    }

    async fn count_items(pool: &ConnectionPool) -> Result<i64> {
        let conn = pool.acquire().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM items", params![]).await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)?)
    }

    #[tokio::test]
    async fn fresh_pool_applies_every_pragma() -> Result<()> {
        let dir = tempdir()?;
        let pool = ConnectionPool::open(&dir.path().join("fresh.db"), 2).await?;

        // Both slots get a brand new connection.
        let first = pool.acquire().await?;
        let second = pool.acquire().await?;
        for conn in [&first, &second] {
            let mut rows = conn.query("PRAGMA busy_timeout", params![]).await?;
            let timeout: i64 = rows.next().await?.context("missing pragma row")?.get(0)?;
            assert_eq!(timeout, 5000);
        }

        let mut rows = first.query("PRAGMA journal_mode", params![]).await?;
        let mode: String = rows.next().await?.context("missing pragma row")?.get(0)?;
        assert_eq!(mode.to_lowercase(), "wal");
        Ok(())
    }

    #[tokio::test]
    async fn connections_are_reused() -> Result<()> {
        let (_dir, pool) = scratch_pool(2).await?;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle_count(), 1);

        let first = pool.acquire().await?;
        assert_eq!(pool.idle_count(), 0);
        drop(first);
        assert_eq!(pool.idle_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn pooled_connections_enforce_foreign_keys() -> Result<()> {
        let (_dir, pool) = scratch_pool(1).await?;
        let conn = pool.acquire().await?;
        let mut rows = conn.query("PRAGMA foreign_keys", params![]).await?;
        let flag: i64 = rows.next().await?.context("missing pragma row")?.get(0)?;
        assert_eq!(flag, 1);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_waits_for_a_free_slot() -> Result<()> {
        let (_dir, pool) = scratch_pool(1).await?;
        let held = pool.acquire().await?;

        let waiting = tokio::time::timeout(std::time::Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire should block while the slot is held");

        drop(held);
        let again = pool.acquire().await;
        assert!(again.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn commit_persists_and_rollback_discards() -> Result<()> {
        let (_dir, pool) = scratch_pool(1).await?;

        let mut conn = pool.acquire().await?;
        let tx = conn.begin().await?;
        tx.execute("INSERT INTO items (id) VALUES ('kept')", params![])
            .await?;
        tx.commit().await?;

        let tx = conn.begin().await?;
        tx.execute("INSERT INTO items (id) VALUES ('dropped')", params![])
            .await?;
        tx.rollback().await;
        drop(conn);

        assert_eq!(count_items(&pool).await?, 1);
        assert_eq!(pool.idle_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_transaction_poisons_the_connection() -> Result<()> {
        let (_dir, pool) = scratch_pool(1).await?;

        {
            let mut conn = pool.acquire().await?;
            let tx = conn.begin().await?;
            tx.execute("INSERT INTO items (id) VALUES ('ghost')", params![])
                .await?;
            drop(tx);
        }

        // The poisoned connection was closed instead of being pooled.
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(count_items(&pool).await?, 0);

        let mut conn = pool.acquire().await?;
        let tx = conn.begin().await?;
        tx.execute("INSERT INTO items (id) VALUES ('real')", params![])
            .await?;
        tx.commit().await?;
        drop(conn);
        assert_eq!(count_items(&pool).await?, 1);
        Ok(())
    }
}
