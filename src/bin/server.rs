use clap::Parser;
use tracing::{error, info};
use yari::{trace, Config, Server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 4)]
    threads: usize,

    /// Port to listen on
    #[arg(short, long, default_value_t = 22000)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging (trace level 1)
    #[arg(short, long)]
    verbose: bool,

    /// Numeric trace level (-1 errors only, 0 default, 1 and 2 verbose)
    #[arg(long, allow_negative_numbers = true)]
    trace_level: Option<i32>,

    /// Pin worker threads to CPUs
    #[arg(long)]
    cpu_affinity: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config {
            bind_addr: args.bind.clone(),
            port: args.port,
            threads: args.threads,
            cpu_affinity: args.cpu_affinity,
            ..Default::default()
        }
    };

    // command line beats environment beats config file
    if let Some(level) = trace::level_from_env() {
        config.trace_level = level;
    }
    if args.verbose {
        config.trace_level = config.trace_level.max(1);
    }
    if let Some(level) = args.trace_level {
        config.trace_level = level;
    }

    trace::init(config.trace_level)?;

    let num_cpus = num_cpus::get();
    if config.threads == 0 {
        config.threads = num_cpus;
    }

    info!(
        "Starting Yari v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.bind_addr,
        config.port
    );
    info!(
        "Detected {} CPUs, using {} worker threads",
        num_cpus, config.threads
    );

    let server = Server::new(config)?;

    // no drain: workers block indefinitely, so stop the whole process
    ctrlc::set_handler(|| {
        info!("Received shutdown signal, exiting");
        std::process::exit(0);
    })?;

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
