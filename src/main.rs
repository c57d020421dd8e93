use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use omnidesk::{open_store, App, AppState, Cli, Config, Result, Storage, SyncStatusReporter};

pub fn initialize_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .format_module_path(true)
        .init();

    info!("Logger initialized");
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let status = Arc::new(SyncStatusReporter::new());
    let store = open_store(&config, Arc::clone(&status)).await?;
    let storage = Arc::new(Storage::new(store));

    let mut state = AppState::new(storage, status, config.request_timeout());
    state.load().await?;
    if !state.watch_changes() {
        info!("Backend has no change notifications, state is refreshed after each command");
    }

    let mut app = App::new(state, config, cli.verbose);
    let result = app.run(cli.command).await;
    let closed = app.shutdown().await;
    result.and(closed)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_logger(cli.verbose);
    info!("Application starting up");

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("{} {}", console::style("error:").red().bold(), e);
        std::process::exit(1);
    }

    info!("Application shutting down");
}
