//! Serve command implementation.

use datasync_server::{IngestServer, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the ingestion service until Ctrl-C.
pub fn run(
    bind: SocketAddr,
    store_dir: &Path,
    max_connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new(bind, store_dir).with_max_connections(max_connections);
    let server = IngestServer::new(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = server.bind().await?;
        info!(addr = %listener.local_addr()?, store = %store_dir.display(), "serving");

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.cancel();
            }
        });

        server.serve(listener, shutdown).await?;
        println!("stored {} upload(s)", server.received().len());
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
