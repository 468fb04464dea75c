//! task-dispatch: a small distributed task-dispatch service.
//!
//! A single Controller process owns a persistent catalogue of named
//! sleep-tasks and hands them out, one at a time, to Worker processes
//! connected over TCP. Workers simulate work by sleeping for a declared
//! duration and report completion; the Controller tracks worker liveness
//! and redispatches tasks abandoned by unresponsive workers.
//!
//! # Layout
//!
//! - [`codec`]: the length-prefixed wire frames shared by both peers.
//! - [`connection`]: buffered frame I/O over a `TcpStream`.
//! - [`task`]: the `Task` record and its state machine.
//! - [`store`]: the persistent task store contract and its SQLite backing.
//! - [`controller`]: the dispatch core and liveness supervisor.
//! - [`worker`]: the worker client state machine.

pub mod codec;
pub mod connection;
pub use connection::Connection;

pub mod task;
pub use task::{Task, TaskState};

pub mod store;
pub use store::{StorageError, TaskStore};

pub mod controller;

pub mod worker;
pub use worker::Worker;

mod shutdown;
use shutdown::Shutdown;

/// Default port the Controller listens on in examples/doctests.
///
/// Both binaries actually require `-p` explicitly (see §6), so this
/// constant is never consulted by `main` — it exists for tests only.
pub const DEFAULT_PORT: &str = "7878";

/// Maximum port number accepted by either binary's `-p` flag.
pub const MAX_PORT_NUMBER: u16 = 8192;

/// Grace period added to a task's declared `sleep_time` before its worker
/// is considered delinquent (a "slacker").
pub const LIVENESS_GRACE_SECS: u64 = 10;

/// Default interval between liveness sweeps; also the default Controller
/// poll timeout referenced in §5.
pub const DEFAULT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Extra seconds a `-s` slacker worker adds to every task's sleep before it
/// reports completion, used to exercise the Controller's liveness sweep.
pub const SLACKER_EXTRA_SECS: u64 = 20;

/// The error type most functions in this crate return.
///
/// As in the teacher crate, a boxed `std::error::Error` is good enough at
/// the top level (`main`, CLI plumbing); the codec and store each define
/// their own non-boxed error enum for their hot paths, matching how the
/// teacher's `parse::Error` stays unboxed while `crate::Error` doesn't.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` alias specialized to [`Error`], for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Seconds since the Unix epoch, used throughout for `assign_time` /
/// `complete_time`. Kept in one place so tests can reason about it without
/// depending on wall-clock time directly.
pub fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}
