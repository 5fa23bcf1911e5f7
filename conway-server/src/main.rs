use clap::Parser;
use conway_core::LifeGame;
use conway_sync::SyncServer;
use log::info;

mod cli;

use cli::CliArgs;

fn init_logging(filter: Option<&str>) {
    let mut builder = match filter {
        Some(filter) => {
            let mut builder = env_logger::Builder::new();
            builder.parse_filters(filter);
            builder
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    builder.init();
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Cannot listen for SIGTERM: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    init_logging(args.log_level.as_deref());

    let settings = args.game_settings();
    info!(
        "Starting Conway server: {}x{} board, tick {} ms, {} seed cell(s)",
        settings.width,
        settings.height,
        settings.tick_interval_ms,
        args.seed.len()
    );

    let game = LifeGame::with_cells(settings, args.seed.iter().copied());
    let server = SyncServer::new(args.server_config(), game);

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connection(s) served, {} mutation(s) accepted",
                stats.total_connections, stats.accepted_mutations
            );
        }
    }

    Ok(())
}
