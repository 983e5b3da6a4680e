use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use coalescer::{
    apps::{App, ConfigOverrides},
    batcher::{JsonLinesHandler, LoggingHandler},
    config::{ConfigManager, EnvConfigManager},
    logger::init_tracing,
    schema::write_schema,
};
use tokio::io::{BufReader, stdin, stdout};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "coalescer",
    about = "Coalesces bursts of chat messages into conversational turns",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Batch JSON envelopes from stdin, write dispatched turns to stdout
    Run(RunArgs),

    /// Emit JSON-Schema for envelopes, dispatch lines and config
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// .env file to seed the environment from
    #[arg(long, env = "COALESCER_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Batch window in seconds, measured from the first message
    #[arg(long)]
    batch_timeout: Option<f64>,

    /// Messages per batch before the next message forces a flush
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Seconds between sweeps for batches a timer missed
    #[arg(long)]
    cleanup_interval: Option<f64>,

    /// Comma separated keywords that skip batching
    #[arg(long, value_delimiter = ',')]
    urgent_keywords: Option<Vec<String>>,

    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Also write rolling log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4317)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            for file in write_schema(&args.out)? {
                println!("{}", args.out.join(file).display());
            }
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let _log_guard = init_tracing(&args.log_level, args.log_dir.clone(), args.otel_endpoint.clone())?;
    info!("coalescer starting up");

    let config = ConfigManager(EnvConfigManager::new(Some(args.env_file.clone())));
    let overrides = ConfigOverrides {
        batch_timeout_secs: args.batch_timeout,
        max_batch_size: args.max_batch_size,
        cleanup_interval_secs: args.cleanup_interval,
        urgent_keywords: args.urgent_keywords,
    };

    let app = App::bootstrap(&config, overrides)
        .await?
        .with_handler(Arc::new(LoggingHandler))
        .with_handler(Arc::new(JsonLinesHandler::new(stdout())));
    app.start();

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handler available; rely on end of input
            std::future::pending::<()>().await;
        }
    };
    let served = app.serve_lines(BufReader::new(stdin()), ctrl_c).await;

    // drain even if ingress failed so pending turns still go out
    app.shutdown().await;
    let report = served?;
    info!(?report, "coalescer stopped");
    Ok(())
}
