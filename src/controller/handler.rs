//! Per-connection worker handling (§4.3).
//!
//! One `Handler` owns one accepted socket for its entire life. It is the
//! only task that ever touches that socket, which is exactly why the
//! liveness sweep can't disconnect a slacker directly — it has to ask this
//! task to do it, over `force_exit`.

use crate::codec::AssignmentFrame;
use crate::controller::state::{ClaimError, ControllerState, DispatchChoice};
use crate::shutdown::Shutdown;
use crate::store::TaskStore;
use crate::{now_secs, Connection};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct Handler<S: TaskStore> {
    conn_id: u64,
    conn: Connection,
    state: Arc<ControllerState<S>>,
    shutdown: Shutdown,
    force_exit_tx: mpsc::Sender<()>,
    force_exit_rx: mpsc::Receiver<()>,
}

impl<S: TaskStore> Handler<S> {
    pub(crate) fn new(
        conn_id: u64,
        conn: Connection,
        state: Arc<ControllerState<S>>,
        shutdown: Shutdown,
    ) -> Handler<S> {
        let (force_exit_tx, force_exit_rx) = mpsc::channel(1);
        Handler {
            conn_id,
            conn,
            state,
            shutdown,
            force_exit_tx,
            force_exit_rx,
        }
    }

    /// Runs until the connection closes, one way or another. Never
    /// returns an error: every failure mode here is "close this one
    /// connection", not "bring down the Controller".
    pub(crate) async fn run(mut self) {
        if self.state.is_shutdown() {
            self.exit_now().await;
            return;
        }

        loop {
            tokio::select! {
                frame = self.conn.read_status_frame() => {
                    match frame {
                        Ok(Some(frame)) => {
                            if self.state.is_shutdown() {
                                self.state.disconnect_local(self.conn_id, true, &mut self.conn).await;
                                return;
                            }
                            self.state.register_worker(
                                self.conn_id,
                                &frame.worker_id,
                                self.force_exit_tx.clone(),
                            );

                            if frame.task_name.is_empty() {
                                debug!(worker = %frame.worker_id, "idle, requesting work");
                                if !self.dispatch(&frame.worker_id).await {
                                    return;
                                }
                            } else if frame.time_left == 0 {
                                match self
                                    .state
                                    .complete_task(&frame.worker_id, &frame.task_name, now_secs())
                                    .await
                                {
                                    Ok(()) => {
                                        info!(worker = %frame.worker_id, task = %frame.task_name, "completed");
                                        if !self.dispatch(&frame.worker_id).await {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        self.reject(&frame.worker_id, &frame.task_name, e);
                                        return;
                                    }
                                }
                            } else {
                                match self
                                    .state
                                    .reconnect_task(&frame.worker_id, &frame.task_name)
                                    .await
                                {
                                    Ok(()) => {
                                        info!(
                                            worker = %frame.worker_id,
                                            task = %frame.task_name,
                                            time_left = frame.time_left,
                                            "worker reconnected mid-task"
                                        );
                                    }
                                    Err(e) => {
                                        self.reject(&frame.worker_id, &frame.task_name, e);
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            // Clean hangup: the worker is gone, no exit to send.
                            self.state.disconnect_local(self.conn_id, false, &mut self.conn).await;
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "protocol error, closing connection");
                            self.state.drop_connection_only(self.conn_id);
                            return;
                        }
                    }
                }
                _ = self.force_exit_rx.recv() => {
                    // The sweep has already killed and forgotten whatever
                    // task we owned; our only remaining job is to tell the
                    // peer to leave.
                    let _ = self.conn.write_assignment_frame(&AssignmentFrame::exit()).await;
                    return;
                }
                _ = self.shutdown.recv() => {
                    // The whole Controller is draining. A connection that
                    // hasn't sent a frame yet won't be in the worker table,
                    // so drop_connection_only is a harmless no-op for it.
                    self.state.drop_connection_only(self.conn_id);
                    self.exit_now().await;
                    return;
                }
            }
        }
    }

    /// Sends the exit frame and closes, used only when shutdown was
    /// already set before this connection ever sent a frame.
    async fn exit_now(&mut self) {
        let _ = self
            .conn
            .write_assignment_frame(&AssignmentFrame::exit())
            .await;
    }

    /// Runs the dispatch scan for `worker_id` and carries out its decision.
    /// Returns `false` if the connection is now closed and the caller
    /// should stop driving it.
    async fn dispatch(&mut self, worker_id: &str) -> bool {
        match self.state.dispatch(worker_id, now_secs()) {
            DispatchChoice::Exit => {
                self.state
                    .disconnect_local(self.conn_id, true, &mut self.conn)
                    .await;
                false
            }
            DispatchChoice::Assign {
                task_name,
                sleep_time,
                resumed,
                prior,
            } => {
                let frame = AssignmentFrame {
                    task_name: task_name.clone(),
                    sleep_time,
                };
                match self.conn.write_assignment_frame(&frame).await {
                    Ok(()) => {
                        info!(
                            worker = worker_id,
                            task = %task_name,
                            resumed,
                            "dispatched"
                        );
                        self.state.commit_dispatch(&task_name).await;
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "assignment write failed, rolling back");
                        self.state.rollback_dispatch(&task_name, prior);
                        false
                    }
                }
            }
        }
    }

    /// A status frame claimed a task it had no business claiming (§7): log
    /// and close without touching any task state.
    fn reject(&self, worker_id: &str, task_name: &str, err: ClaimError) {
        warn!(
            worker = worker_id,
            task = task_name,
            ?err,
            "rejected status frame, closing connection"
        );
        self.state.drop_connection_only(self.conn_id);
    }
}
