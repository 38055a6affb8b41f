//! TCP transport implementation.
//!
//! Each upload stream runs over its own TCP connection carrying
//! length-delimited CBOR frames. Securing the socket (TLS, credentials) is
//! left to whatever sits in front of the service.

use crate::error::{SyncError, SyncResult};
use crate::transport::{DataSyncClient, UploadStream};
use async_trait::async_trait;
use datasync_protocol::{ClientCodec, UploadRequest, UploadResponse};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// A client that reaches the ingestion service over TCP.
#[derive(Debug)]
pub struct TcpClient {
    addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpClient {
    /// Creates a client for the service at `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the service address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl DataSyncClient for TcpClient {
    async fn open_upload(&self) -> SyncResult<Box<dyn UploadStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }

        let socket = TcpStream::connect(self.addr)
            .await
            .map_err(|e| SyncError::transport_retryable(format!("connect {}: {}", self.addr, e)))?;
        socket
            .set_nodelay(true)
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        debug!(addr = %self.addr, "upload connection opened");

        Ok(Box::new(TcpUploadStream {
            framed: Framed::new(socket, ClientCodec::new()),
        }))
    }

    async fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct TcpUploadStream {
    framed: Framed<TcpStream, ClientCodec>,
}

#[async_trait]
impl UploadStream for TcpUploadStream {
    async fn send(&mut self, request: UploadRequest) -> SyncResult<()> {
        request.validate()?;
        self.framed.send(request).await?;
        Ok(())
    }

    async fn close_and_recv(mut self: Box<Self>) -> SyncResult<UploadResponse> {
        self.framed.flush().await?;
        match self.framed.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(SyncError::transport_retryable(
                "connection closed before response",
            )),
        }
    }
}
