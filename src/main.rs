use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use jobqd::config::{BrokerConfig, QueueKind, DEFAULT_BACKLOG, DEFAULT_PORT};
use jobqd::server::Server;
use jobqd::shutdown;

#[derive(Parser, Debug)]
#[command(name = "jobqd")]
#[command(about = "A standalone job-queue broker")]
struct Args {
    /// Port to listen on when no --listen address is given
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to listen on, host:port (repeatable, e.g. one per family)
    #[arg(long)]
    listen: Vec<String>,

    /// Listen backlog
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Number of I/O threads (0 = runtime default)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Reserved: retries before a failing job is dropped
    #[arg(long, default_value_t = 0)]
    job_retries: u32,

    /// Sleeping workers woken per job submission (0 = all)
    #[arg(long, default_value_t = 0)]
    worker_wakeup: u32,

    /// Persistent queue backend: none or file
    #[arg(long, default_value = "none")]
    queue_type: String,

    /// Path of the queue log for --queue-type file
    #[arg(long)]
    queue_file: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let listen: Vec<SocketAddr> = if args.listen.is_empty() {
        vec![SocketAddr::from(([0, 0, 0, 0], args.port))]
    } else {
        args.listen
            .iter()
            .map(|addr| addr.parse())
            .collect::<Result<_, _>>()?
    };

    let queue = match args.queue_type.as_str() {
        "none" => QueueKind::None,
        "file" => {
            let path = args
                .queue_file
                .ok_or("--queue-type file requires --queue-file")?;
            QueueKind::File(path)
        }
        other => return Err(format!("unknown queue type: {}", other).into()),
    };

    let config = BrokerConfig {
        listen,
        backlog: args.backlog,
        threads: args.threads,
        job_retries: args.job_retries,
        worker_wakeup: args.worker_wakeup,
        queue,
        ..Default::default()
    };

    tracing::info!(
        listen = ?config.listen,
        threads = config.threads,
        queue = ?config.queue,
        "Starting jobqd"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.threads > 0 {
        builder.worker_threads(config.threads);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::new(config)?;
        let token = shutdown::install_shutdown_handler();
        server.run(token).await
    })?;

    Ok(())
}
