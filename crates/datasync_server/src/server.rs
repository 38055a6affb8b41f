//! TCP front end of the ingestion service.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, StoredUpload, UploadHandler};
use datasync_protocol::{ServerCodec, UploadRequest, UploadResponse};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// The ingestion server.
///
/// Each connection carries exactly one upload stream: a metadata message,
/// any number of chunks, then `Complete`. The server answers with a single
/// `Ack` or `Error` and closes the connection.
///
/// # Example
///
/// ```no_run
/// use datasync_server::{IngestServer, ServerConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> datasync_server::ServerResult<()> {
/// let server = IngestServer::new(ServerConfig::default());
/// let listener = server.bind().await?;
/// server.serve(listener, CancellationToken::new()).await
/// # }
/// ```
pub struct IngestServer {
    context: Arc<HandlerContext>,
}

impl IngestServer {
    /// Creates a new ingestion server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            context: Arc::new(HandlerContext::new(config)),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Binds a listener on the configured address.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        Ok(TcpListener::bind(self.context.config.bind_addr).await?)
    }

    /// Returns every upload stored so far.
    pub fn received(&self) -> Vec<StoredUpload> {
        self.context.received()
    }

    /// Accepts connections until `shutdown` fires, then waits for open
    /// connections to finish.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> ServerResult<()> {
        tokio::fs::create_dir_all(&self.context.config.store_dir)
            .await
            .map_err(|e| {
                ServerError::Internal(format!(
                    "create {}: {}",
                    self.context.config.store_dir.display(),
                    e
                ))
            })?;

        let limit = Arc::new(Semaphore::new(self.context.config.max_connections.max(1)));
        let tasks = TaskTracker::new();
        info!(addr = ?listener.local_addr().ok(), "ingestion server listening");

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let context = Arc::clone(&self.context);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = handle_connection(context, socket, peer, shutdown).await {
                    debug!(%peer, error = %e, "connection ended with error");
                }
                drop(permit);
            });
        }

        info!("ingestion server shutting down");
        tasks.close();
        tasks.wait().await;
        Ok(())
    }
}

async fn handle_connection(
    context: Arc<HandlerContext>,
    socket: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) -> ServerResult<()> {
    let read_timeout = context.config.read_timeout;
    let mut framed = Framed::new(socket, ServerCodec::new());
    let mut handler = UploadHandler::new(context);
    debug!(%peer, "connection accepted");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            next = tokio::time::timeout(read_timeout, framed.next()) => match next {
                Ok(next) => next,
                Err(_) => {
                    debug!(%peer, "connection idle too long");
                    None
                }
            },
        };

        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                handler.abort().await;
                let status = ServerError::InvalidRequest(e.to_string()).to_status();
                let _ = framed.send(UploadResponse::Error(status)).await;
                return Err(ServerError::InvalidRequest(e.to_string()));
            }
            None => {
                handler.abort().await;
                return Ok(());
            }
        };

        match handler.handle(request).await {
            Ok(None) => {}
            Ok(Some(response)) => {
                framed
                    .send(response)
                    .await
                    .map_err(|e| ServerError::Internal(e.to_string()))?;
                return Ok(());
            }
            Err(e) => {
                handler.abort().await;
                warn!(%peer, error = %e, "upload rejected");
                framed
                    .send(UploadResponse::Error(e.to_status()))
                    .await
                    .map_err(|e| ServerError::Internal(e.to_string()))?;
                drain(&mut framed, read_timeout, &shutdown).await;
                return Err(e);
            }
        }
    }
}

/// Reads and discards the rest of a rejected stream so the client sees the
/// error reply instead of a reset connection.
async fn drain(
    framed: &mut Framed<TcpStream, ServerCodec>,
    timeout: Duration,
    shutdown: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            next = tokio::time::timeout(timeout, framed.next()) => next,
        };
        match next {
            Ok(Some(Ok(UploadRequest::Complete { .. }))) => return,
            Ok(Some(Ok(_))) => {}
            _ => return,
        }
    }
}
