#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use tracing::info;

use px_core::config::Config;
use px_daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    if std::env::var("PHOENIX_LOG_JSON").is_ok() {
        px_telemetry::init_logging_json("phoenix-daemon", "info");
    } else {
        px_telemetry::init_logging("phoenix-daemon", "info");
    }

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });

    daemon.run().await
}
