//! The Worker client state machine (§4.5).
//!
//! A Worker holds at most one task at a time. It reports its status to the
//! Controller on every connect (idle, in-flight, or just-completed) and
//! waits for an assignment in reply; there is no other way for it to learn
//! about a task. A `sleep_time` elapsing and the connection dropping are
//! the only two events it reacts to while a task is in flight.

use crate::codec::{AssignmentFrame, StatusFrame};
use crate::{Connection, SLACKER_EXTRA_SECS};

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Delay between reconnect attempts after a failed `connect()`. The
/// original reference implementation retries with no backoff at all
/// because its main loop blocks inside `connect()`'s syscall; an async
/// retry loop would otherwise spin hot against a Controller that is
/// merely slow to come back up.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// What ended a Worker's connection to the Controller.
enum ConnectionOutcome {
    /// The Controller sent an empty task name: no more work, leave.
    Exit,
    /// The connection dropped (or misbehaved); reconnect and resume.
    Reconnect,
}

/// A Worker's state: which task (if any) it's running, and since when.
pub struct Worker {
    controller_addr: SocketAddr,
    worker_id: String,
    is_slacker: bool,
    task_name: String,
    sleep_time: u32,
    sleep_start: Option<Instant>,
}

impl Worker {
    pub fn new(controller_addr: SocketAddr, worker_id: impl Into<String>, is_slacker: bool) -> Worker {
        Worker {
            controller_addr,
            worker_id: worker_id.into(),
            is_slacker,
            task_name: String::new(),
            sleep_time: 0,
            sleep_start: None,
        }
    }

    /// Runs until the Controller tells this worker to exit.
    pub async fn run(mut self) -> crate::Result<()> {
        loop {
            let mut conn = match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            match self.serve_connection(&mut conn).await {
                ConnectionOutcome::Exit => {
                    info!("controller told me to exit");
                    return Ok(());
                }
                ConnectionOutcome::Reconnect => {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Connects, and reports current status: idle if no task is held, or
    /// in-flight with however much time is left if one is. A reconnect
    /// with `time_left > 0` is how the Controller learns this worker is
    /// still alive after a dropped connection.
    async fn connect(&self) -> crate::Result<Connection> {
        let stream = TcpStream::connect(self.controller_addr).await?;
        let mut conn = Connection::new(stream);

        let time_left = self.time_left();
        conn.write_status_frame(&StatusFrame {
            worker_id: self.worker_id.clone(),
            task_name: self.task_name.clone(),
            time_left,
        })
        .await?;

        if time_left > 0 {
            info!(task = %self.task_name, time_left, "reconnected to controller");
        } else {
            info!("connected to controller");
        }
        Ok(conn)
    }

    /// Remaining seconds on the current task, or 0 if idle or overrun.
    fn time_left(&self) -> u32 {
        match self.sleep_start {
            None => 0,
            Some(start) => {
                let elapsed = start.elapsed().as_secs() as u32;
                self.sleep_time.saturating_sub(elapsed)
            }
        }
    }

    /// Drives one connection until it ends, one way or another: an exit
    /// instruction, a dropped/misbehaving socket, or (internally) a task
    /// finishing its sleep and being reported complete.
    async fn serve_connection(&mut self, conn: &mut Connection) -> ConnectionOutcome {
        loop {
            if !self.task_name.is_empty() && self.time_left() == 0 {
                let done = StatusFrame {
                    worker_id: self.worker_id.clone(),
                    task_name: self.task_name.clone(),
                    time_left: 0,
                };
                if let Err(e) = conn.write_status_frame(&done).await {
                    warn!(error = %e, "failed to report completion");
                    return ConnectionOutcome::Reconnect;
                }
                info!(task = %self.task_name, "completed");
                self.task_name.clear();
                self.sleep_start = None;
                continue;
            }

            tokio::select! {
                frame = conn.read_assignment_frame() => {
                    match frame {
                        Ok(Some(AssignmentFrame { task_name, .. })) if task_name.is_empty() => {
                            return ConnectionOutcome::Exit;
                        }
                        Ok(Some(frame)) => self.accept_assignment(frame),
                        Ok(None) | Err(_) => {
                            warn!("lost connection to controller");
                            return ConnectionOutcome::Reconnect;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(u64::from(self.time_left()))),
                    if !self.task_name.is_empty() =>
                {
                    // Falls through to the completion check at the top of
                    // the loop.
                }
            }
        }
    }

    fn accept_assignment(&mut self, frame: AssignmentFrame) {
        let sleep_time = if self.is_slacker {
            frame.sleep_time + SLACKER_EXTRA_SECS as u32
        } else {
            frame.sleep_time
        };
        info!(
            task = %frame.task_name,
            sleep_time,
            slacker = self.is_slacker,
            "received task"
        );
        self.task_name = frame.task_name;
        self.sleep_time = sleep_time;
        self.sleep_start = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_left_is_zero_when_idle() {
        let worker = Worker::new("127.0.0.1:0".parse().unwrap(), "w1", false);
        assert_eq!(worker.time_left(), 0);
    }

    #[test]
    fn accepting_an_assignment_starts_the_clock() {
        let mut worker = Worker::new("127.0.0.1:0".parse().unwrap(), "w1", false);
        worker.accept_assignment(AssignmentFrame {
            task_name: "t1".into(),
            sleep_time: 30,
        });
        assert_eq!(worker.task_name, "t1");
        assert_eq!(worker.sleep_time, 30);
        assert!(worker.time_left() <= 30);
        assert!(worker.time_left() > 0);
    }

    #[test]
    fn a_slacker_pads_its_sleep_time() {
        let mut worker = Worker::new("127.0.0.1:0".parse().unwrap(), "w1", true);
        worker.accept_assignment(AssignmentFrame {
            task_name: "t1".into(),
            sleep_time: 10,
        });
        assert_eq!(worker.sleep_time, 10 + SLACKER_EXTRA_SECS as u32);
    }
}
