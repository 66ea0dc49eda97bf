pub mod api;
pub mod config;
pub mod observer;
pub mod proxy;
pub mod repository;
pub mod runtime;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, repository::Repository, runtime::ServerPool};

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "tunnel-rs.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests use the tunnel-server crate and
/// start the broker directly, a function is opened to replace the main
/// function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<Arc<ServerPool>> {
    let pool = Arc::new(ServerPool::new(Repository::in_memory()));
    pool.start(config.clone()).await?;

    if let Some(api) = &config.api {
        let listen = api.listen;
        let pool = pool.clone();

        tokio::spawn(async move {
            if let Err(e) = api::start_server(listen, pool).await {
                log::error!("api server failed: {}", e);
            }
        });
    }

    Ok(pool)
}
