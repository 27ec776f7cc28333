use color_eyre::eyre::{Result, WrapErr};
use reservd::{ReloadConfig, Reservations, spawn_reloader};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reservd=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1).map(String::as_str) {
        None => ReloadConfig::default(),
        Some("-h" | "--help") => {
            eprintln!("Usage: {} [reservation_file]", args[0]);
            eprintln!("  reservation_file: one `<family> <socktype> <protocol> <address> [rebind]` per line");
            eprintln!("                    (default: /etc/reservd.conf)");
            eprintln!();
            eprintln!("Send SIGHUP to reload the file, SIGINT or SIGTERM to exit.");
            return Ok(());
        }
        Some(path) => ReloadConfig::new(path),
    };

    info!(path = %config.path.display(), quiescence = ?config.quiescence, "Starting reservation daemon");
    let reservations = Arc::new(Reservations::new(config));
    let shutdown = CancellationToken::new();

    let outcome = reservations
        .reload(&shutdown)
        .await
        .wrap_err("Failed to load initial reservations")?;
    info!(?outcome, "Initial reservations loaded");

    let (trigger, reloader) = spawn_reloader(reservations.clone(), shutdown.clone());

    let mut hangup = signal(SignalKind::hangup()).wrap_err("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading reservations");
                if !trigger.trigger_reload() {
                    warn!("Reload already queued, ignoring SIGHUP");
                }
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                result.wrap_err("Failed to listen for SIGINT")?;
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    reloader.await.wrap_err("Reloader task panicked")?;
    info!(generation = reservations.current().id(), "Reservation daemon stopped");
    Ok(())
}
