#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use tunnel_client::{Connector, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.services.is_empty() {
        log::warn!(
            "No services are configured, the client will connect and then have nothing to do :-)"
        );
    }

    let connector = Connector::new(config);

    let handle = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.run().await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");

    connector.stop();
    handle.await??;
    Ok(())
}
