//! Client Server
//!
//! TCP accept loop for chat clients. Every connection runs in its own
//! task; stopping the server waits for all of them.

use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Listener for chat client connections
pub struct ClientServer {
    /// Bound listener
    listener: TcpListener,
    /// Stops accepting when cancelled
    cancel: CancellationToken,
}

impl ClientServer {
    /// Bind the client port
    pub async fn bind(address: &str, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind client port {}: {}", address, e)))?;
        tracing::info!("Client server listening on {}", listener.local_addr()?);
        Ok(Self { listener, cancel })
    }

    /// Local listening address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled, handing each to `handler`.
    ///
    /// Handlers receive a child token of the server's cancellation token
    /// and are expected to return promptly once it fires.
    pub async fn run<F, Fut>(self, handler: F) -> Result<()>
    where
        F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let connection = handler(socket, peer, self.cancel.child_token());
                        connections.spawn(async move {
                            if let Err(e) = connection.await {
                                tracing::warn!("Connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        // Stop accepting before waiting on open connections
        drop(self.listener);
        let open = connections.len();
        if open > 0 {
            tracing::info!("Closing {} client connections", open);
        }
        while connections.join_next().await.is_some() {}

        tracing::info!("Client server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accepts_and_stops() {
        let cancel = CancellationToken::new();
        let server = ClientServer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&served);
        let task = tokio::spawn(server.run(move |mut socket, _peer, token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4];
                tokio::select! {
                    _ = token.cancelled() => {}
                    read = socket.read_exact(&mut buf) => {
                        read?;
                        socket.write_all(&buf).await?;
                    }
                }
                Ok::<(), Error>(())
            }
        }));

        let mut echo = TcpStream::connect(addr).await.unwrap();
        echo.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        echo.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Held open until shutdown
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 2);
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
