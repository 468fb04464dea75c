//! The Worker binary's entry point (§6).

use task_dispatch::{Worker, MAX_PORT_NUMBER};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::exit;
use structopt::StructOpt;

#[tokio::main]
async fn main() -> task_dispatch::Result<()> {
    let cli = Cli::from_args();

    if cli.port == 0 || cli.port > MAX_PORT_NUMBER {
        eprintln!("Invalid port number {}", cli.port);
        exit(1);
    }
    if cli.worker_id.is_empty() || cli.worker_id.len() > task_dispatch::task::MAX_TASK_NAME_LEN {
        eprintln!("Invalid worker id");
        exit(1);
    }

    init_logging(cli.verbose);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), cli.port);
    let worker = Worker::new(addr, cli.worker_id, cli.slacker);
    worker.run().await
}

fn init_logging(verbose: bool) {
    if verbose {
        let _ = tracing_subscriber::fmt().with_writer(std::io::stderr).try_init();
        return;
    }

    match tempfile::Builder::new()
        .prefix("worker_")
        .suffix(".log")
        .tempfile()
        .and_then(|f| f.keep().map_err(|e| e.error))
    {
        Ok((file, path)) => {
            eprintln!("Worker log file is {}", path.display());
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
    name = "task-worker",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Connects to a task controller and runs the tasks it's handed"
)]
struct Cli {
    /// Port of the task controller.
    #[structopt(short = "p")]
    port: u16,

    /// Unique worker id.
    #[structopt(short = "w")]
    worker_id: String,

    /// Act as a slacker: pad every task's sleep time, to exercise the
    /// controller's liveness sweep.
    #[structopt(short = "s")]
    slacker: bool,

    /// Log to stderr instead of a log file.
    #[structopt(short = "v")]
    verbose: bool,
}
