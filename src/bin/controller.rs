//! The Controller binary's entry point (§6).
//!
//! Parses the command line, validates it, loads the initial task table,
//! and hands off to [`task_dispatch::controller::run`].

use task_dispatch::{store, Task, TaskStore};

use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> task_dispatch::Result<()> {
    let cli = Cli::from_args();

    if cli.port == 0 || cli.port > task_dispatch::MAX_PORT_NUMBER {
        eprintln!("Invalid port number {}", cli.port);
        exit(1);
    }
    if !store::database_file_exists(&cli.database) {
        eprintln!("Database file does not exist: {}", cli.database.display());
        exit(1);
    }

    init_logging(cli.verbose);

    let store = store::SqliteStore::new(&cli.database);
    let tasks: Vec<Task> = match store.fetch_open_tasks().await {
        Ok(tasks) if !tasks.is_empty() => tasks,
        Ok(_) => {
            eprintln!("Controller initialization failed: no tasks to run");
            exit(1);
        }
        Err(e) => {
            eprintln!("Controller initialization failed: {}", e);
            exit(1);
        }
    };

    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    task_dispatch::controller::run(listener, store, tasks, signal::ctrl_c()).await
}

fn init_logging(verbose: bool) {
    if verbose {
        let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).try_init();
        return;
    }

    match tempfile::Builder::new()
        .prefix("controller_")
        .suffix(".log")
        .tempfile()
        .and_then(|f| f.keep().map_err(|e| e.error))
    {
        Ok((file, path)) => {
            eprintln!("Controller log file is {}", path.display());
            let _ = tracing_subscriber::fmt()
                .with_writer(move || file.try_clone().expect("clone log file handle"))
                .try_init();
        }
        Err(e) => {
            eprintln!("Cannot open log file: {}, logging to stderr", e);
            let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).try_init();
        }
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "task-controller",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Owns the task catalogue and dispatches tasks to workers"
)]
struct Cli {
    /// Listening port.
    #[structopt(short = "p")]
    port: u16,

    /// Task database file. Must already exist.
    #[structopt(short = "d")]
    database: PathBuf,

    /// Log to stderr instead of a log file.
    #[structopt(short = "v")]
    verbose: bool,
}
