use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use takesync_server::config::AppConfig;
use takesync_server::{Cli, Session, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();
    log::info!("takesync-server {}", VERSION);

    let config = AppConfig::load(args.config.as_deref()).into_diagnostic()?;
    if args.write_config {
        let path = config.save().into_diagnostic()?;
        println!("settings written to {}", path.display());
        return Ok(());
    }

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("Session", |subsys| async move {
            let session = Session::new(&subsys, args, config).await?;
            log::info!(
                "ready: {} recorder(s) configured, capture source {}",
                session.config.active_devices().len(),
                session.capture.state()
            );
            subsys.on_shutdown_requested().await;
            log::info!("shutting down");
            Ok::<(), takesync_server::error::SyncError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
