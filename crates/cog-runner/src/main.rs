//! cog-runner binary: supervise a file-protocol worker and serve it over HTTP.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cog_runner::transport::{ServerConfig, serve};
use cog_runner::{Runner, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "cog-runner")]
#[command(about = "Run a Cog predictor behind an HTTP server", long_about = None)]
struct Args {
    /// Directory shared with the worker for request and response files
    #[arg(long, env = "COG_WORKING_DIR")]
    working_dir: PathBuf,

    /// Python module containing the predictor
    #[arg(long, default_value = "predict")]
    module_name: String,

    /// Predictor class name
    #[arg(long, default_value = "Predictor")]
    class_name: String,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Keep serving after the worker exits until /shutdown or SIGINT
    #[arg(long, env = "COG_AWAIT_EXPLICIT_SHUTDOWN")]
    await_explicit_shutdown: bool,

    /// Python interpreter used to launch the worker
    #[arg(long, default_value = "python3")]
    python: String,

    /// Seconds to wait for the worker to stop before killing it
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("COG_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("cog_runner={level}", level = level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = RunnerConfig::new(&args.working_dir, &args.module_name, &args.class_name)
        .with_python(&args.python)
        .with_await_explicit_shutdown(args.await_explicit_shutdown)
        .with_shutdown_timeout(args.shutdown_timeout.map(Duration::from_secs));
    let runner = Runner::new(config);

    // Handlers must be in place before the worker can raise its first signal.
    #[cfg(unix)]
    cog_runner::events::forward_os_signals(runner.event_sender())?;

    if let Err(e) = runner.start() {
        tracing::error!(error = %e, "Worker failed to start");
        if !args.await_explicit_shutdown {
            return Err(e.into());
        }
        // Keep serving health checks reporting SETUP_FAILED until told to stop.
    }

    let server_config = ServerConfig {
        host: args.host,
        port: args.port,
        await_explicit_shutdown: args.await_explicit_shutdown,
    };
    serve(server_config, std::sync::Arc::clone(&runner)).await?;

    let code = runner.exit_code().unwrap_or(0);
    tracing::info!(code, "Exiting");
    std::process::exit(code);
}
