//! The persistent task store contract (§4.4) and its SQLite backing.
//!
//! The Controller never holds a store handle across the time it isn't
//! actively using it: `open` is a cheap, idempotent liveness probe, and
//! every other call acquires its own connection and releases it before
//! returning. Every method's actual SQLite work happens inside
//! `tokio::task::spawn_blocking`, the same rule the teacher's `Db`
//! documents for any critical section that is not cheap and synchronous.

use crate::task::{Task, TaskState};

use async_trait::async_trait;
use std::convert::TryFrom;
use std::fmt;
use std::path::{Path, PathBuf};

/// A store operation failed, or the store is unreachable.
#[derive(Debug)]
pub enum StorageError {
    /// `open()`'s liveness probe failed, or a later call could not obtain
    /// a connection. Per §7, this is always fatal to the Controller: it
    /// sets the shutdown flag and drains rather than retrying in band.
    Unavailable,
    /// The underlying SQLite driver reported an error on an otherwise
    /// reachable database (bad SQL, constraint violation, corruption).
    Backend(rusqlite::Error),
    /// `update` was asked to persist a task whose state isn't one of
    /// `Running`/`Killed`/`Success` (§4.4: "any other state is rejected").
    InvalidUpdateState(TaskState),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable => write!(f, "task store is unavailable"),
            StorageError::Backend(e) => write!(f, "task store error: {}", e),
            StorageError::InvalidUpdateState(s) => {
                write!(f, "cannot persist task in state {:?}", s)
            }
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e)
    }
}

/// The abstract task store the Controller depends on (§4.4). Implemented
/// against SQLite in [`SqliteStore`]; a plain in-memory fake backs unit
/// tests of the dispatch core without touching the filesystem.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Opens and immediately releases a connection. Used both to validate
    /// the store at startup and as the liveness probe in the sweep's step 1.
    async fn open(&self) -> Result<(), StorageError>;

    /// Every task whose `state != Success`. Ordering is unspecified.
    async fn fetch_open_tasks(&self) -> Result<Vec<Task>, StorageError>;

    /// Persists the column subset appropriate for `task.state`:
    /// `Running` -> `state, worker, assign_time`; `Killed` -> `state`;
    /// `Success` -> `state, complete_time`. Any other state is rejected.
    async fn update(&self, task: &Task) -> Result<(), StorageError>;
}

/// A `TaskStore` backed by a SQLite `demo_task` table (§6). The database
/// file is expected to already exist and contain the table; this type
/// never creates it, matching the CLI contract that `-d <database-path>`
/// must exist at startup.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> SqliteStore {
        SqliteStore {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<rusqlite::Connection, StorageError> {
        open_read_write(&self.db_path)
    }
}

/// Opens `path` read-write, with no `SQLITE_OPEN_CREATE` flag: matching
/// `task_db.cc`'s `open_task_db`, and keeping `open()`'s liveness probe
/// meaningful (a missing database file must fail the probe rather than
/// silently create a fresh empty one).
fn open_read_write(path: &Path) -> Result<rusqlite::Connection, StorageError> {
    rusqlite::Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(|_| StorageError::Unavailable)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn open(&self) -> Result<(), StorageError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || open_read_write(&path).map(|_| ()))
            .await
            .map_err(|_| StorageError::Unavailable)?
    }

    async fn fetch_open_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Task>, StorageError> {
            let conn = open_read_write(&path)?;
            let mut stmt = conn.prepare(
                "SELECT task_name, sleep_time, state, worker, assign_time, complete_time \
                 FROM demo_task WHERE state != 3",
            )?;
            let rows = stmt.query_map([], |row| {
                let state_raw: i64 = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    state_raw,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            let mut tasks = Vec::new();
            for row in rows {
                let (task_name, sleep_time, state_raw, worker, assign_time, complete_time) = row?;
                let state = TaskState::try_from(state_raw)
                    .map_err(|_| StorageError::Backend(rusqlite::Error::InvalidQuery))?;
                tasks.push(Task {
                    task_name,
                    sleep_time: sleep_time as u32,
                    state,
                    worker,
                    assign_time: assign_time as u64,
                    complete_time: complete_time as u64,
                });
            }
            Ok(tasks)
        })
        .await
        .map_err(|_| StorageError::Unavailable)?
    }

    async fn update(&self, task: &Task) -> Result<(), StorageError> {
        match task.state {
            TaskState::Running | TaskState::Killed | TaskState::Success => {}
            other => return Err(StorageError::InvalidUpdateState(other)),
        }

        let path = self.db_path.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let conn = open_read_write(&path)?;
            match task.state {
                TaskState::Running => {
                    conn.execute(
                        "UPDATE demo_task SET state = 1, worker = ?1, assign_time = ?2 \
                         WHERE task_name = ?3",
                        rusqlite::params![task.worker, task.assign_time as i64, task.task_name],
                    )?;
                }
                TaskState::Killed => {
                    conn.execute(
                        "UPDATE demo_task SET state = 2 WHERE task_name = ?1",
                        rusqlite::params![task.task_name],
                    )?;
                }
                TaskState::Success => {
                    debug_assert!(task.complete_time >= task.assign_time);
                    conn.execute(
                        "UPDATE demo_task SET state = 3, complete_time = ?1 WHERE task_name = ?2",
                        rusqlite::params![task.complete_time as i64, task.task_name],
                    )?;
                }
                TaskState::Created => unreachable!("rejected above"),
            }
            Ok(())
        })
        .await
        .map_err(|_| StorageError::Unavailable)?
    }
}

/// Whether `path` looks like an existing, openable SQLite database file.
/// Used by the Controller CLI's `-d` validation (§6: "must exist at
/// startup").
pub fn database_file_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_file()
}

#[cfg(test)]
pub mod fake {
    //! An in-memory `TaskStore` fake for unit-testing the dispatch core
    //! without touching the filesystem.

    use super::*;
    use std::sync::Mutex;

    pub struct InMemoryStore {
        tasks: Mutex<Vec<Task>>,
        unavailable: std::sync::atomic::AtomicBool,
    }

    impl InMemoryStore {
        pub fn new(tasks: Vec<Task>) -> InMemoryStore {
            InMemoryStore {
                tasks: Mutex::new(tasks),
                unavailable: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub fn make_unavailable(&self) {
            self.unavailable
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn snapshot(&self) -> Vec<Task> {
            self.tasks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskStore for InMemoryStore {
        async fn open(&self) -> Result<(), StorageError> {
            if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
                Err(StorageError::Unavailable)
            } else {
                Ok(())
            }
        }

        async fn fetch_open_tasks(&self) -> Result<Vec<Task>, StorageError> {
            self.open().await?;
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.state != TaskState::Success)
                .cloned()
                .collect())
        }

        async fn update(&self, task: &Task) -> Result<(), StorageError> {
            match task.state {
                TaskState::Running | TaskState::Killed | TaskState::Success => {}
                other => return Err(StorageError::InvalidUpdateState(other)),
            }
            self.open().await?;
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(existing) = tasks.iter_mut().find(|t| t.task_name == task.task_name) {
                *existing = task.clone();
            } else {
                tasks.push(task.clone());
            }
            Ok(())
        }
    }
}
