//! The Controller's in-memory task table and worker table, and the
//! operations that mutate them (§4.2, §4.3).
//!
//! Every mutation is made under a single `std::sync::Mutex`, per §9's
//! allowance that a multithreaded implementation "must either serialize all
//! mutations through a dedicated owner thread or guard them with one
//! mutex" — directly modeled on the teacher's `Db`/`Shared`/`State` split.
//! The guard is never held across an `.await`: every method either does its
//! work entirely under the lock and returns, or takes the lock twice,
//! cloning a snapshot out in between to hand to the store.

use crate::store::{StorageError, TaskStore};
use crate::task::{Task, TaskState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A registered, currently-connected worker.
struct WorkerEntry {
    worker_id: String,
    /// Signals the owning `Handler` task to send an exit frame and close.
    /// Needed because the liveness sweep can decide a worker must go, but
    /// it doesn't own that worker's socket — only the `Handler` that
    /// accepted the connection does.
    force_exit: mpsc::Sender<()>,
}

struct Inner {
    tasks: HashMap<String, Task>,
    workers: HashMap<u64, WorkerEntry>,
}

/// What the dispatch scan decided for a worker that just went idle.
pub(crate) enum DispatchChoice {
    Assign {
        task_name: String,
        sleep_time: u32,
        /// Whether this is the worker's own previously-owned task coming
        /// back (a resume) rather than a fresh pick.
        resumed: bool,
        /// The task's prior value, restored if the assignment write fails.
        prior: Task,
    },
    Exit,
}

/// Why a status frame's claimed task couldn't be accepted (§7: a protocol
/// error that closes the connection without mutating any task state).
#[derive(Debug)]
pub(crate) enum ClaimError {
    UnknownTask,
    WorkerMismatch,
}

/// Shared Controller state: the task table, the worker table, and the
/// global shutdown flag, guarded by one mutex and backed by a [`TaskStore`].
pub(crate) struct ControllerState<S: TaskStore> {
    store: S,
    inner: Mutex<Inner>,
    shutdown: AtomicBool,
    next_conn_id: AtomicU64,
}

impl<S: TaskStore> ControllerState<S> {
    pub(crate) fn new(store: S, tasks: Vec<Task>) -> ControllerState<S> {
        let tasks = tasks
            .into_iter()
            .map(|t| (t.task_name.clone(), t))
            .collect();
        ControllerState {
            store,
            inner: Mutex::new(Inner {
                tasks,
                workers: HashMap::new(),
            }),
            shutdown: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_tasks_empty(&self) -> bool {
        self.inner.lock().unwrap().tasks.is_empty()
    }

    /// Registers `conn_id` under `worker_id` if it isn't already registered.
    /// A connection's worker identity, once recorded, never changes (it
    /// only ever sees frames from the one peer that opened it).
    pub(crate) fn register_worker(&self, conn_id: u64, worker_id: &str, force_exit: mpsc::Sender<()>) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.entry(conn_id).or_insert_with(|| WorkerEntry {
            worker_id: worker_id.to_string(),
            force_exit,
        });
    }

    /// Removes `conn_id`'s worker-table entry without touching any task.
    /// Used on a protocol error (§7): the connection is closing, but the
    /// task it may have owned is left exactly as is for the liveness sweep
    /// to reclaim.
    pub(crate) fn drop_connection_only(&self, conn_id: u64) {
        self.inner.lock().unwrap().workers.remove(&conn_id);
    }

    /// Validates and applies a worker's completion report (§4.3 branch 2):
    /// the task must exist and be owned by `worker_id`.
    pub(crate) async fn complete_task(
        &self,
        worker_id: &str,
        task_name: &str,
        now: u64,
    ) -> Result<(), ClaimError> {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let task = inner
                .tasks
                .get_mut(task_name)
                .ok_or(ClaimError::UnknownTask)?;
            if task.worker != worker_id {
                return Err(ClaimError::WorkerMismatch);
            }
            task.state = TaskState::Success;
            task.complete_time = now;
            let snapshot = task.clone();
            inner.tasks.remove(task_name);
            snapshot
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Validates a worker's mid-task reconnect (§4.3 branch 3): the task
    /// must exist and still be owned by `worker_id`. `assign_time` is left
    /// untouched — a reconnect doesn't restart the clock.
    pub(crate) async fn reconnect_task(
        &self,
        worker_id: &str,
        task_name: &str,
    ) -> Result<(), ClaimError> {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let task = inner
                .tasks
                .get_mut(task_name)
                .ok_or(ClaimError::UnknownTask)?;
            if task.worker != worker_id {
                return Err(ClaimError::WorkerMismatch);
            }
            task.state = TaskState::Running;
            task.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Picks and atomically reserves a task for `worker_id` (§4.3's dispatch
    /// scan), or decides the worker should exit. Reserving inside the same
    /// lock acquisition as the scan is what keeps two idle workers from
    /// ever being handed the same task: a literal read-then-later-write
    /// translation of the original single-threaded scan would leave a
    /// window between picking a candidate and writing the assignment frame
    /// in which another connection's handler could pick the very same one.
    pub(crate) fn dispatch(&self, worker_id: &str, now: u64) -> DispatchChoice {
        let mut inner = self.inner.lock().unwrap();
        let chosen_name = pick_candidate(&inner.tasks, worker_id);
        let task_name = match chosen_name {
            Some(name) => name,
            None => return DispatchChoice::Exit,
        };
        let task = inner
            .tasks
            .get_mut(&task_name)
            .expect("candidate came from this same table");
        let prior = task.clone();
        let resumed = task.worker == worker_id;
        let sleep_time = task.sleep_time;
        task.worker = worker_id.to_string();
        task.state = TaskState::Running;
        task.assign_time = now;
        DispatchChoice::Assign {
            task_name,
            sleep_time,
            resumed,
            prior,
        }
    }

    /// Persists a dispatch that was successfully written to the wire.
    pub(crate) async fn commit_dispatch(&self, task_name: &str) {
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            inner.tasks.get(task_name).cloned()
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }
    }

    /// Undoes a reservation whose assignment frame failed to send: the task
    /// goes back to whatever it was before `dispatch` touched it, with
    /// nothing persisted (§4.3: "task remains in its current state, sweep
    /// will reclaim").
    pub(crate) fn rollback_dispatch(&self, task_name: &str, prior: Task) {
        self.inner.lock().unwrap().tasks.insert(task_name.to_string(), prior);
    }

    /// The full disconnect procedure for a connection about itself: kill
    /// whatever task it owns (if any), forget it, and optionally send an
    /// exit frame. `send_exit` is false when the peer is already gone
    /// (clean hangup) and true when the Controller is the one ending the
    /// conversation (no more tasks, or a shutdown drain).
    pub(crate) async fn disconnect_local(
        &self,
        conn_id: u64,
        send_exit: bool,
        conn: &mut crate::Connection,
    ) {
        let worker_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.workers.remove(&conn_id).map(|e| e.worker_id)
        };
        if let Some(worker_id) = worker_id {
            self.kill_owned_task(&worker_id).await;
        }
        if send_exit {
            let _ = conn
                .write_assignment_frame(&crate::codec::AssignmentFrame::exit())
                .await;
        }
    }

    /// The sweep's half of the disconnect procedure for a worker it has
    /// decided is delinquent or must leave. Kills the worker's owned task
    /// (if any) and forgets it, same as [`disconnect_local`], but since the
    /// sweep doesn't own the worker's socket, the actual exit frame is sent
    /// by the `Handler` task that does, once notified over its
    /// `force_exit` channel. Returns whether a live connection was found
    /// and signalled.
    pub(crate) async fn reclaim_worker(&self, worker_id: &str) -> bool {
        let notifier = {
            let mut inner = self.inner.lock().unwrap();
            let conn_id = inner
                .workers
                .iter()
                .find(|(_, e)| e.worker_id == worker_id)
                .map(|(id, _)| *id);
            conn_id.and_then(|id| inner.workers.remove(&id)).map(|e| e.force_exit)
        };
        self.kill_owned_task(worker_id).await;
        match notifier {
            Some(tx) => {
                let _ = tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Every worker currently registered, disconnected with an exit signal.
    /// Used once the shutdown flag is set (§4.3 step 5).
    pub(crate) async fn disconnect_all_with_exit(&self) {
        let worker_ids: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.workers.values().map(|e| e.worker_id.clone()).collect()
        };
        for worker_id in worker_ids {
            self.reclaim_worker(&worker_id).await;
        }
    }

    /// Every `Running` task whose worker has overrun its declared
    /// `sleep_time` by more than the grace period (§4.3 step 2, invariant 3).
    pub(crate) fn delinquent_workers(&self, now: u64, grace_secs: u64) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.is_delinquent(now, grace_secs))
            .map(|t| t.worker.clone())
            .collect()
    }

    /// Loads freshly-fetched store rows into the task table, never
    /// overwriting a task already known in memory (§4.3 step 3).
    pub(crate) fn merge_new_tasks(&self, rows: Vec<Task>) {
        let mut inner = self.inner.lock().unwrap();
        for task in rows {
            inner.tasks.entry(task.task_name.clone()).or_insert(task);
        }
    }

    /// Step 1 of the sweep: probe the store; a failure is fatal (§7).
    pub(crate) async fn probe_store(&self) {
        if self.store.open().await.is_err() {
            self.mark_shutdown();
        }
    }

    /// Step 3 of the sweep: reload open tasks from the store.
    pub(crate) async fn reload_from_store(&self) {
        match self.store.fetch_open_tasks().await {
            Ok(rows) => self.merge_new_tasks(rows),
            Err(_) => self.mark_shutdown(),
        }
    }

    async fn kill_owned_task(&self, worker_id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            let owned = inner.tasks.values_mut().find(|t| {
                t.worker == worker_id && matches!(t.state, TaskState::Running | TaskState::Killed)
            });
            owned.map(|t| {
                t.state = TaskState::Killed;
                t.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }
    }

    async fn persist(&self, task: &Task) {
        if let Err(StorageError::Unavailable) | Err(StorageError::Backend(_)) =
            self.store.update(task).await
        {
            self.mark_shutdown();
        }
    }
}

/// Scans `tasks` for the best candidate to hand to `worker_id`: a task the
/// worker already owns (`Running`/`Killed`) takes priority over any fresh
/// `Created`/`Killed` pick, matching §4.3's "prefer resuming the worker's
/// own in-flight task" rule. Tie-break among equally eligible fresh
/// candidates is unspecified beyond determinism within one scan.
fn pick_candidate(tasks: &HashMap<String, Task>, worker_id: &str) -> Option<String> {
    let mut resume = None;
    let mut any = None;
    for task in tasks.values() {
        if task.worker == worker_id && matches!(task.state, TaskState::Running | TaskState::Killed)
        {
            resume = Some(task.task_name.clone());
            break;
        }
        if task.is_dispatchable() {
            any = Some(task.task_name.clone());
        }
    }
    resume.or(any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::InMemoryStore;

    fn state_with(tasks: Vec<Task>) -> ControllerState<InMemoryStore> {
        ControllerState::new(InMemoryStore::new(tasks.clone()), tasks)
    }

    #[tokio::test]
    async fn dispatch_hands_out_a_created_task() {
        let state = state_with(vec![Task::created("t1", 30)]);
        match state.dispatch("w1", 100) {
            DispatchChoice::Assign { task_name, sleep_time, resumed, .. } => {
                assert_eq!(task_name, "t1");
                assert_eq!(sleep_time, 30);
                assert!(!resumed);
            }
            DispatchChoice::Exit => panic!("expected an assignment"),
        }
    }

    #[tokio::test]
    async fn dispatch_exits_when_no_task_is_left() {
        let state: ControllerState<InMemoryStore> = state_with(vec![]);
        assert!(matches!(state.dispatch("w1", 100), DispatchChoice::Exit));
    }

    #[tokio::test]
    async fn dispatch_prefers_the_workers_own_running_task_over_a_fresh_one() {
        let mut owned = Task::created("mine", 30);
        owned.state = TaskState::Running;
        owned.worker = "w1".into();
        owned.assign_time = 50;
        let fresh = Task::created("fresh", 10);
        let state = state_with(vec![owned, fresh]);

        match state.dispatch("w1", 100) {
            DispatchChoice::Assign { task_name, resumed, .. } => {
                assert_eq!(task_name, "mine");
                assert!(resumed);
            }
            DispatchChoice::Exit => panic!("expected the resumed task"),
        }
    }

    #[tokio::test]
    async fn two_concurrent_dispatches_never_pick_the_same_created_task() {
        let state = std::sync::Arc::new(state_with(vec![Task::created("only", 30)]));
        let a = state.clone();
        let b = state.clone();
        let (ra, rb) = tokio::join!(
            tokio::task::spawn_blocking(move || a.dispatch("w1", 10)),
            tokio::task::spawn_blocking(move || b.dispatch("w2", 10)),
        );
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let assigned = outcomes
            .iter()
            .filter(|o| matches!(o, DispatchChoice::Assign { .. }))
            .count();
        assert_eq!(assigned, 1, "exactly one of the two should have won the task");
    }

    #[tokio::test]
    async fn rollback_restores_the_prior_task_after_a_failed_write() {
        let state = state_with(vec![Task::created("t1", 30)]);
        let prior = match state.dispatch("w1", 100) {
            DispatchChoice::Assign { prior, task_name, .. } => {
                state.rollback_dispatch(&task_name, prior.clone());
                prior
            }
            DispatchChoice::Exit => panic!("expected an assignment"),
        };
        assert_eq!(state.inner.lock().unwrap().tasks["t1"], prior);
    }

    #[tokio::test]
    async fn complete_task_rejects_a_worker_mismatch() {
        let mut task = Task::created("t1", 30);
        task.state = TaskState::Running;
        task.worker = "w1".into();
        let state = state_with(vec![task]);
        let err = state
            .complete_task("w2", "t1", 200)
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::WorkerMismatch));
    }

    #[tokio::test]
    async fn complete_task_removes_the_task_on_success() {
        let mut task = Task::created("t1", 30);
        task.state = TaskState::Running;
        task.worker = "w1".into();
        let state = state_with(vec![task]);
        state.complete_task("w1", "t1", 200).await.unwrap();
        assert!(state.is_tasks_empty());
    }

    #[tokio::test]
    async fn delinquent_workers_reports_overrun_tasks() {
        let mut task = Task::created("t1", 10);
        task.state = TaskState::Running;
        task.worker = "w1".into();
        task.assign_time = 0;
        let state = state_with(vec![task]);
        assert_eq!(state.delinquent_workers(100, 10), vec!["w1".to_string()]);
        assert!(state.delinquent_workers(15, 10).is_empty());
    }

    #[tokio::test]
    async fn merge_new_tasks_never_overwrites_an_in_memory_task() {
        let mut in_memory = Task::created("t1", 10);
        in_memory.state = TaskState::Running;
        in_memory.worker = "w1".into();
        let state = state_with(vec![in_memory.clone()]);
        state.merge_new_tasks(vec![Task::created("t1", 999), Task::created("t2", 5)]);
        let inner = state.inner.lock().unwrap();
        assert_eq!(inner.tasks["t1"], in_memory);
        assert!(inner.tasks.contains_key("t2"));
    }
}
