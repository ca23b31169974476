use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dakv::disk::DiskExecutor;
use dakv::executor::Executor;
use dakv::mem::MemExecutor;
use dakv::{net, server};

/// RESP key-value server with in-memory and disk backends.
#[derive(Parser, Debug)]
#[command(name = "dakv", version, about)]
struct Args {
    /// Data directory; uses the in-memory backend when omitted
    dir: Option<PathBuf>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = server::PORT)]
    port: u16,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(args) {
        error!("server exited: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> dakv::Result<()> {
    let mut executor: Box<dyn Executor> = match &args.dir {
        Some(dir) => {
            info!("opening disk store in {}", dir.display());
            Box::new(DiskExecutor::open(dir)?)
        }
        None => Box::new(MemExecutor::new()),
    };

    let listener = net::tcp_server(&args.bind, args.port, server::BACKLOG)?;
    info!("listening on {}:{}", args.bind, args.port);
    server::run(listener, executor.as_mut())
}
