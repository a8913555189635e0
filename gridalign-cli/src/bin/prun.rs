//! Distributed work-unit dispatcher: master and worker roles.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use gridalign::par::transport::{channel_mesh, TcpMaster, TcpWorker};
use gridalign::par::{
    DispatchConfig, DispatchReport, Dispatcher, ProcessExecutor, WorkUnit, Worker,
};
use gridalign::{GridAlignError, GridAlignResult};
use gridalign_cli::{fail, init_tracing};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dispatch work units across workers")]
struct Cli {
    #[command(subcommand)]
    role: Role,
    /// Enable tracing output.
    #[arg(long)]
    trace: bool,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve a task list to connecting workers.
    Master {
        /// JSON task list: an array of work units.
        #[arg(short, long)]
        tasks: PathBuf,
        /// Listen address for workers.
        #[arg(short, long, default_value = "0.0.0.0:7464")]
        listen: String,
        /// Number of workers that will connect.
        #[arg(short, long)]
        workers: usize,
        /// Requeue limit per failing unit.
        #[arg(long, default_value_t = 3)]
        max_retries: usize,
        /// Per-unit wall-clock timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Directory for per-unit log files.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Connect to a master and execute units as child processes.
    Worker {
        /// Master address.
        #[arg(short, long)]
        connect: String,
    },
    /// Run the task list with in-process worker threads.
    Local {
        /// JSON task list: an array of work units.
        #[arg(short, long)]
        tasks: PathBuf,
        /// Worker thread count.
        #[arg(short, long, default_value_t = 2)]
        workers: usize,
        /// Requeue limit per failing unit.
        #[arg(long, default_value_t = 3)]
        max_retries: usize,
        /// Per-unit wall-clock timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Directory for per-unit log files.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn load_units(path: &PathBuf) -> GridAlignResult<Vec<WorkUnit>> {
    let text =
        std::fs::read_to_string(path).map_err(|err| GridAlignError::io(path.as_path(), err))?;
    serde_json::from_str(&text).map_err(|err| GridAlignError::InvalidConfig {
        reason: format!("{}: {err}", path.display()),
    })
}

fn dispatch_config(
    max_retries: usize,
    timeout_secs: Option<u64>,
    log_dir: Option<PathBuf>,
) -> GridAlignResult<DispatchConfig> {
    if let Some(dir) = &log_dir {
        std::fs::create_dir_all(dir).map_err(|err| GridAlignError::io(dir.as_path(), err))?;
    }
    Ok(DispatchConfig {
        max_retries,
        unit_timeout: timeout_secs.map(Duration::from_secs),
        log_dir,
        ..DispatchConfig::default()
    })
}

fn report_and_exit(report: &DispatchReport) -> ! {
    for outcome in report.failed() {
        eprintln!(
            "unit {} failed after {} attempts: {}",
            outcome.id,
            outcome.attempts,
            outcome.failure.as_deref().unwrap_or("unknown")
        );
    }
    std::process::exit(if report.all_ok() { 0 } else { 1 });
}

fn run(cli: Cli) -> GridAlignResult<()> {
    match cli.role {
        Role::Master {
            tasks,
            listen,
            workers,
            max_retries,
            timeout_secs,
            log_dir,
        } => {
            let units = load_units(&tasks)?;
            let cfg = dispatch_config(max_retries, timeout_secs, log_dir)?;
            let transport = TcpMaster::bind(listen.as_str(), workers)?;
            let worker_ids = transport.workers();
            let mut dispatcher = Dispatcher::new(transport, cfg);
            let report = dispatcher.run(units, &worker_ids)?;
            report_and_exit(&report);
        }
        Role::Worker { connect } => {
            let transport = TcpWorker::connect(connect.as_str())?;
            Worker::new(transport, ProcessExecutor).run()
        }
        Role::Local {
            tasks,
            workers,
            max_retries,
            timeout_secs,
            log_dir,
        } => {
            let units = load_units(&tasks)?;
            let cfg = dispatch_config(max_retries, timeout_secs, log_dir)?;
            let mut mesh = channel_mesh(workers);
            let master = mesh.remove(0);
            let worker_ids: Vec<usize> = (1..=workers).collect();
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|transport| {
                    std::thread::spawn(move || Worker::new(transport, ProcessExecutor).run())
                })
                .collect();
            let mut dispatcher = Dispatcher::new(master, cfg);
            let report = dispatcher.run(units, &worker_ids)?;
            for handle in handles {
                let _ = handle.join();
            }
            report_and_exit(&report);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.trace);
    if let Err(err) = run(cli) {
        fail(err);
    }
}
