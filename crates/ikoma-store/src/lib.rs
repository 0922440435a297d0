use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

const SCHEMA_VERSION: i64 = 1;

const INIT_SQL: &str = "CREATE TABLE IF NOT EXISTS conversation_steps (
    run_id TEXT NOT NULL,
    step INTEGER NOT NULL,
    state TEXT NOT NULL,
    ts TEXT NOT NULL,
    PRIMARY KEY (run_id, step)
 );
 CREATE INDEX IF NOT EXISTS idx_conversation_steps_run_step
    ON conversation_steps (run_id, step);";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("step {step} already exists for run {run_id}")]
    DuplicateStep { run_id: String, step: u32 },
    #[error("no checkpoint found for run {run_id}, step {step}")]
    CheckpointNotFound { run_id: String, step: u32 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub step: u32,
    pub state: serde_json::Value,
    pub created_at: String,
}

impl CheckpointRecord {
    pub fn new(run_id: impl Into<String>, step: u32, state: serde_json::Value) -> Self {
        Self {
            run_id: run_id.into(),
            step,
            state,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub steps: u64,
    pub last_ts: String,
}

/// Durable `(run_id, step) -> state` store on sqlite with WAL journaling.
/// Writes serialize on the connection mutex; WAL keeps readers unblocked.
pub struct Checkpointer {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Checkpointer {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(INIT_SQL)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version={SCHEMA_VERSION};"))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert a new step. Inserting an existing `(run_id, step)` is an
    /// error, never an overwrite.
    pub fn save_step(&self, record: &CheckpointRecord) -> StoreResult<()> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let result = conn.execute(
            "INSERT INTO conversation_steps (run_id, step, state, ts) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.run_id,
                record.step as i64,
                serde_json::to_string(&record.state)?,
                record.created_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateStep {
                    run_id: record.run_id.clone(),
                    step: record.step,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All steps for a run, ordered by step number. Empty when unknown.
    pub fn get_steps(&self, run_id: &str) -> StoreResult<Vec<CheckpointRecord>> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let mut stmt = conn.prepare(
            "SELECT run_id, step, state, ts FROM conversation_steps
             WHERE run_id = ?1 ORDER BY step",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (run_id, step, state, ts) = row?;
            records.push(CheckpointRecord {
                run_id,
                step: step as u32,
                state: serde_json::from_str(&state)?,
                created_at: ts,
            });
        }
        Ok(records)
    }

    pub fn get_step(&self, run_id: &str, step: u32) -> StoreResult<CheckpointRecord> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let mut stmt = conn.prepare(
            "SELECT state, ts FROM conversation_steps WHERE run_id = ?1 AND step = ?2",
        )?;
        let mut rows = stmt.query(params![run_id, step as i64])?;
        match rows.next()? {
            Some(row) => Ok(CheckpointRecord {
                run_id: run_id.to_string(),
                step,
                state: serde_json::from_str(&row.get::<_, String>(0)?)?,
                created_at: row.get(1)?,
            }),
            None => Err(StoreError::CheckpointNotFound {
                run_id: run_id.to_string(),
                step,
            }),
        }
    }

    pub fn update_step(
        &self,
        run_id: &str,
        step: u32,
        state: &serde_json::Value,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let changed = conn.execute(
            "UPDATE conversation_steps SET state = ?1 WHERE run_id = ?2 AND step = ?3",
            params![serde_json::to_string(state)?, run_id, step as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::CheckpointNotFound {
                run_id: run_id.to_string(),
                step,
            });
        }
        Ok(())
    }

    pub fn delete_step(&self, run_id: &str, step: u32) -> StoreResult<()> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let changed = conn.execute(
            "DELETE FROM conversation_steps WHERE run_id = ?1 AND step = ?2",
            params![run_id, step as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::CheckpointNotFound {
                run_id: run_id.to_string(),
                step,
            });
        }
        Ok(())
    }

    /// Remove every step of a run. Deleting an unknown run is not an error.
    pub fn delete_run(&self, run_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("checkpointer lock");
        conn.execute(
            "DELETE FROM conversation_steps WHERE run_id = ?1",
            [run_id],
        )?;
        Ok(())
    }

    pub fn list_runs(&self, limit: u64) -> StoreResult<Vec<RunSummary>> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let mut stmt = conn.prepare(
            "SELECT run_id, COUNT(*), MAX(ts) FROM conversation_steps
             GROUP BY run_id ORDER BY MAX(ts) DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RunSummary {
                run_id: row.get(0)?,
                steps: row.get::<_, i64>(1)? as u64,
                last_ts: row.get(2)?,
            })
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    pub fn clear_all(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().expect("checkpointer lock");
        let deleted = conn.execute("DELETE FROM conversation_steps", [])?;
        Ok(deleted as u64)
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Checkpointer>>>> = OnceLock::new();

/// Process-wide checkpointer per database path. Every caller asking for the
/// same path shares one connection, which keeps writes serialized.
pub fn checkpointer_for(db_path: &Path) -> StoreResult<Arc<Checkpointer>> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("checkpointer registry lock");
    if let Some(existing) = map.get(db_path) {
        return Ok(existing.clone());
    }
    let store = Arc::new(Checkpointer::open(db_path)?);
    map.insert(db_path.to_path_buf(), store.clone());
    Ok(store)
}
