//! SQLite Transaction Log
//!
//! Reference [`DurableLog`] keeping one row per global transaction id.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::{DurableLog, PreparedRecord, PreparedState};
use crate::commit::Gid;
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
    PRAGMA synchronous = FULL;

    CREATE TABLE IF NOT EXISTS prepared_xacts (
        gid TEXT PRIMARY KEY,
        origin_node INTEGER NOT NULL,
        xid INTEGER NOT NULL,
        state TEXT NOT NULL,
        prepared_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_prepared_xacts_state
        ON prepared_xacts(state);
"#;

/// Durable log backed by SQLite
pub struct SqliteLog {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file, `None` when in memory
    path: Option<PathBuf>,
}

impl SqliteLog {
    /// Create or open the log in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("txlog.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path),
        })
    }

    /// Create a log that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn current_state(conn: &Connection, gid: &Gid) -> Result<Option<PreparedState>> {
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM prepared_xacts WHERE gid = ?1",
                params![gid.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        state
            .map(|s| {
                PreparedState::parse(&s)
                    .ok_or_else(|| Error::Log(format!("unknown state '{}' for {}", s, gid)))
            })
            .transpose()
    }

    /// Move `gid` to `to` if its current state is one of `from`.
    /// Repeating a transition that already happened is accepted.
    async fn transition(&self, gid: &Gid, from: &[PreparedState], to: PreparedState) -> Result<()> {
        let conn = self.conn.lock().await;

        let current = Self::current_state(&conn, gid)?;
        match current {
            Some(state) if state == to => Ok(()),
            Some(state) if from.contains(&state) => {
                conn.execute(
                    "UPDATE prepared_xacts SET state = ?1, updated_at = CURRENT_TIMESTAMP WHERE gid = ?2",
                    params![to.as_str(), gid.to_string()],
                )?;
                tracing::trace!("txlog: {} {} -> {}", gid, state, to);
                Ok(())
            }
            Some(state) => Err(Error::Log(format!(
                "cannot move {} from {} to {}",
                gid, state, to
            ))),
            None => Err(Error::Log(format!("transaction {} is not prepared", gid))),
        }
    }
}

#[async_trait]
impl DurableLog for SqliteLog {
    async fn prepare(&self, gid: &Gid) -> Result<()> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT INTO prepared_xacts (gid, origin_node, xid, state) VALUES (?1, ?2, ?3, ?4)",
            params![
                gid.to_string(),
                gid.origin() as i64,
                gid.xid() as i64,
                PreparedState::Prepared.as_str()
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::Log(format!("transaction {} was already prepared", gid)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn precommit(&self, gid: &Gid) -> Result<()> {
        self.transition(gid, &[PreparedState::Prepared], PreparedState::Precommitted)
            .await
    }

    async fn commit_prepared(&self, gid: &Gid) -> Result<()> {
        self.transition(
            gid,
            &[PreparedState::Prepared, PreparedState::Precommitted],
            PreparedState::Committed,
        )
        .await
    }

    async fn abort_prepared(&self, gid: &Gid) -> Result<()> {
        self.transition(gid, &[PreparedState::Prepared], PreparedState::Aborted)
            .await
    }

    async fn in_doubt(&self) -> Result<Vec<PreparedRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT gid, state FROM prepared_xacts WHERE state IN ('prepared', 'precommitted') ORDER BY origin_node, xid",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (gid, state) = row?;
            let gid: Gid = gid.parse()?;
            let state = PreparedState::parse(&state)
                .ok_or_else(|| Error::Log(format!("unknown state '{}' for {}", state, gid)))?;
            records.push(PreparedRecord { gid, state });
        }

        Ok(records)
    }

    async fn outcome(&self, gid: &Gid) -> Result<Option<PreparedState>> {
        let conn = self.conn.lock().await;
        Self::current_state(&conn, gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prepare_commit() {
        let log = SqliteLog::in_memory().unwrap();
        let gid = Gid::new(1, 42);

        log.prepare(&gid).await.unwrap();
        assert_eq!(log.outcome(&gid).await.unwrap(), Some(PreparedState::Prepared));

        log.precommit(&gid).await.unwrap();
        log.commit_prepared(&gid).await.unwrap();
        assert_eq!(log.outcome(&gid).await.unwrap(), Some(PreparedState::Committed));
        assert!(log.in_doubt().await.unwrap().is_empty());

        // Replayed commit is harmless
        log.commit_prepared(&gid).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_twice_refused() {
        let log = SqliteLog::in_memory().unwrap();
        let gid = Gid::new(1, 7);

        log.prepare(&gid).await.unwrap();
        let err = log.prepare(&gid).await.unwrap_err();
        assert!(matches!(err, Error::Log(_)));
    }

    #[tokio::test]
    async fn test_no_abort_after_precommit() {
        let log = SqliteLog::in_memory().unwrap();
        let gid = Gid::new(1, 8);

        log.prepare(&gid).await.unwrap();
        log.precommit(&gid).await.unwrap();
        assert!(log.abort_prepared(&gid).await.is_err());
        assert_eq!(log.outcome(&gid).await.unwrap(), Some(PreparedState::Precommitted));
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let log = SqliteLog::in_memory().unwrap();
        let gid = Gid::new(2, 1);

        assert_eq!(log.outcome(&gid).await.unwrap(), None);
        assert!(log.precommit(&gid).await.is_err());
        assert!(log.abort_prepared(&gid).await.is_err());
    }

    #[tokio::test]
    async fn test_in_doubt_survives_reopen() {
        let dir = tempdir().unwrap();
        let precommitted = Gid::new(1, 10);
        let prepared = Gid::new(2, 11);
        let aborted = Gid::new(1, 12);

        {
            let log = SqliteLog::open(dir.path()).unwrap();
            log.prepare(&precommitted).await.unwrap();
            log.precommit(&precommitted).await.unwrap();
            log.prepare(&prepared).await.unwrap();
            log.prepare(&aborted).await.unwrap();
            log.abort_prepared(&aborted).await.unwrap();
        }

        let log = SqliteLog::open(dir.path()).unwrap();
        let in_doubt = log.in_doubt().await.unwrap();
        assert_eq!(
            in_doubt,
            vec![
                PreparedRecord { gid: precommitted, state: PreparedState::Precommitted },
                PreparedRecord { gid: prepared, state: PreparedState::Prepared },
            ]
        );
        assert_eq!(log.path(), Some(dir.path().join("txlog.db").as_path()));
    }
}
