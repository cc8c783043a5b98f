use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::Connection;
use crate::proxy::ForwardProxy;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let proxy = Arc::new(ForwardProxy::new(cfg)?);

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(
        "Listening on {} (endpoint {}, allowed hosts: {})",
        cfg.listen_addr,
        proxy.endpoint(),
        proxy.allow_list().hosts().join(", ")
    );

    serve(listener, proxy, cfg.max_request_body).await;
    Ok(())
}

/// Accepts connections forever, one task per connection. Failures stay
/// inside the task that hit them.
pub async fn serve(listener: TcpListener, proxy: Arc<ForwardProxy>, max_body: usize) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };
        debug!(%peer, "Accepted connection");

        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, proxy, max_body);
            if let Err(e) = conn.run().await {
                debug!(%peer, error = %e, "Connection error");
            }
        });
    }
}
