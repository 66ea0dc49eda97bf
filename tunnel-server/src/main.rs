#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use tunnel_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    let pool = tunnel_server::startup(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");

    pool.stop_all().await;
    Ok(())
}
