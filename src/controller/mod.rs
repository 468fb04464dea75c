//! The Controller: dispatch core and liveness supervisor (§4.2, §4.3).
//!
//! Three things run concurrently for the life of the process: the accept
//! loop (one `Handler` task per connection), the periodic liveness sweep,
//! and a listener for the external shutdown signal. All three share one
//! [`ControllerState`], the same way the teacher's `server::run` shares one
//! `Shared`/`Db` between its `Listener` and every `Handler`.

mod handler;
mod state;

use crate::store::TaskStore;
use crate::{now_secs, Connection, DEFAULT_SWEEP_INTERVAL, LIVENESS_GRACE_SECS};
use handler::Handler;
use state::ControllerState;

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Runs the Controller until `shutdown` resolves or the task table drains
/// to empty after a shutdown was triggered internally (a storage failure).
///
/// `tasks` is the task table loaded at startup (§4.2: "abort startup" is the
/// caller's job if this is empty or couldn't be loaded; `run` itself just
/// assumes it already has something to dispatch).
pub async fn run<S>(
    listener: TcpListener,
    store: S,
    tasks: Vec<crate::Task>,
    shutdown: impl Future,
) -> crate::Result<()>
where
    S: TaskStore + Send + Sync + 'static,
{
    let state = Arc::new(ControllerState::new(store, tasks));
    let (notify_shutdown, _) = broadcast::channel(1);

    let accept = accept_loop(listener, state.clone(), notify_shutdown.clone());
    let sweep = sweep_loop(state.clone());

    tokio::select! {
        res = accept => {
            if let Err(e) = res {
                error!(error = %e, "accept loop failed");
            }
        }
        _ = sweep => {
            info!("task table drained after shutdown, stopping");
        }
        _ = shutdown => {
            info!("shutdown signal received, draining workers");
        }
    }

    state.mark_shutdown();
    state.disconnect_all_with_exit().await;
    let _ = notify_shutdown.send(());

    Ok(())
}

async fn accept_loop<S>(
    listener: TcpListener,
    state: Arc<ControllerState<S>>,
    notify_shutdown: broadcast::Sender<()>,
) -> crate::Result<()>
where
    S: TaskStore + Send + Sync + 'static,
{
    loop {
        let (socket, addr) = listener.accept().await?;
        let conn_id = state.next_conn_id();
        info!(%addr, conn_id, "accepted connection");

        let conn = Connection::new(socket);
        let shutdown = crate::shutdown::Shutdown::new(notify_shutdown.subscribe());
        let handler = Handler::new(conn_id, conn, state.clone(), shutdown);

        tokio::spawn(async move {
            handler.run().await;
        });
    }
}

/// The periodic liveness sweep (§4.3, numbered steps):
///
/// 1. probe the store; a failure sets shutdown.
/// 2. reclaim every delinquent worker's task.
/// 3. reload newly-visible rows from the store.
/// 4. (nothing: a plain timer tick needs no further action here.)
/// 5. if shutdown is set, disconnect everyone with an exit signal.
///
/// Returns once the task table is empty while shutdown is set — the signal
/// to the caller that there is nothing left to do.
async fn sweep_loop<S>(state: Arc<ControllerState<S>>)
where
    S: TaskStore + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(DEFAULT_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;

        state.probe_store().await;

        if !state.is_shutdown() {
            let now = now_secs();
            for worker_id in state.delinquent_workers(now, LIVENESS_GRACE_SECS) {
                warn!(worker = %worker_id, "worker exceeded its grace period, reclaiming");
                state.reclaim_worker(&worker_id).await;
            }
            state.reload_from_store().await;
        }

        if state.is_shutdown() {
            state.disconnect_all_with_exit().await;
        }

        if state.is_shutdown() || state.is_tasks_empty() {
            return;
        }
    }
}
