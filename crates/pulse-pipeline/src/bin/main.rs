//! Pulsewatch pipeline executable

use clap::{Arg, ArgAction, Command};
use pulse_common::{Config, Error};
use pulse_pipeline::{AppContext, Scheduler, Server};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Exit codes for CLI harnesses.
const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 64;
const EXIT_UPSTREAM_UNAVAILABLE: i32 = 69;
const EXIT_RETRYABLE: i32 = 75;
const EXIT_UNEXPECTED: i32 = 1;

#[tokio::main]
async fn main() {
    let matches = Command::new("pulsewatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-tenant time-series observability pipeline")
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (default from PULSE_BIND_ADDRESS or 0.0.0.0)"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Listen port (default from PULSE_PORT or 8080)"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("PATH")
                .help("SQLite database path (default from PULSE_DATABASE_PATH)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    init_tracing(matches.get_flag("verbose"));

    let mut config = Config::from_env();
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.server.bind_address = bind.clone();
    }
    if let Some(port) = matches.get_one::<String>("port") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => {
                error!("invalid port '{}'", port);
                std::process::exit(EXIT_USAGE);
            }
        }
    }
    if let Some(database) = matches.get_one::<String>("database") {
        config.database.path = database.clone();
    }

    info!("starting pulsewatch v{}", env!("CARGO_PKG_VERSION"));
    std::process::exit(run(config).await);
}

async fn run(config: Config) -> i32 {
    let context = match AppContext::initialize(config).await {
        Ok(context) => context,
        Err(e) => {
            error!("failed to initialize: {}", e);
            return exit_code_for(&e);
        }
    };

    let scheduler = Scheduler::start(context.clone());
    let server = Server::new(context.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
        }
        info!("shutdown signal received");
    };

    let result = server.run(shutdown).await;

    scheduler.stop().await;
    if let Err(e) = context.shutdown(Duration::from_secs(10)).await {
        error!("error draining pool: {}", e);
    }

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("server failed: {}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Configuration(_) | Error::Validation(_) => EXIT_USAGE,
        Error::UpstreamUnavailable(_) => EXIT_UPSTREAM_UNAVAILABLE,
        e if e.is_retryable() => EXIT_RETRYABLE,
        _ => EXIT_UNEXPECTED,
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "pulse_pipeline=debug,pulse_ingest=debug,pulse_alerts=debug,pulse_forecast=debug,pulse_store=debug,info"
    } else {
        "pulse_pipeline=info,pulse_ingest=info,pulse_alerts=info,pulse_forecast=info,info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
