//! Datagram Transport
//!
//! Connectionless, best-effort cluster channel. Sending and receiving
//! are separate halves: nothing here waits for a peer's reply, so a slow
//! or dead peer never stalls a sender.

use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{decode_datagram, encode_datagram, MAX_DATAGRAM_BODY};
use crate::replication::{ClusterMessage, FrameHeader};
use crate::state::Member;
use crate::error::{Error, Result};

/// Send-only half of the cluster channel
#[async_trait]
pub trait DatagramSender: Send + Sync {
    /// Fire a message at one member's cluster port
    async fn send_to(&self, target: &Member, message: &ClusterMessage) -> Result<()>;
}

/// Receive-only half of the cluster channel
#[async_trait]
pub trait DatagramReceiver: Send {
    /// Wait for the next valid message
    async fn recv(&mut self) -> Result<ClusterMessage>;
}

/// Send a message to every target concurrently.
///
/// Failures are logged and counted, never retried; the next periodic
/// send covers any loss. Returns the number of successful sends.
pub async fn broadcast(
    sender: &dyn DatagramSender,
    targets: &[Member],
    message: &ClusterMessage,
) -> usize {
    let sends = targets.iter().map(|target| async move {
        let result = sender.send_to(target, message).await;
        (target, result)
    });

    let mut delivered = 0;
    for (target, result) in futures::future::join_all(sends).await {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => tracing::debug!(
                "Failed to send {} to {}: {}",
                message.type_name(),
                target.id,
                e
            ),
        }
    }
    delivered
}

/// UDP sending half
#[derive(Clone)]
pub struct UdpSender {
    socket: Arc<UdpSocket>,
}

/// UDP receiving half
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    buffer: Vec<u8>,
}

/// Bind the cluster port and split it into send and receive halves
pub async fn bind_datagram(address: &str) -> Result<(UdpSender, UdpReceiver)> {
    let socket = UdpSocket::bind(address)
        .await
        .map_err(|e| Error::Network(format!("Failed to bind cluster port {}: {}", address, e)))?;
    let socket = Arc::new(socket);

    tracing::info!("Cluster channel listening on {}", socket.local_addr()?);

    Ok((
        UdpSender {
            socket: Arc::clone(&socket),
        },
        UdpReceiver {
            socket,
            buffer: vec![0u8; FrameHeader::SIZE + MAX_DATAGRAM_BODY],
        },
    ))
}

impl UdpSender {
    /// Local address of the shared socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramSender for UdpSender {
    async fn send_to(&self, target: &Member, message: &ClusterMessage) -> Result<()> {
        let packet = encode_datagram(message)?;
        self.socket
            .send_to(&packet, (target.host.as_str(), target.cluster_port))
            .await?;
        tracing::trace!("Sent {} to {}", message.type_name(), target.id);
        Ok(())
    }
}

#[async_trait]
impl DatagramReceiver for UdpReceiver {
    async fn recv(&mut self) -> Result<ClusterMessage> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buffer).await {
                Ok(received) => received,
                // ICMP port-unreachable from an earlier send surfaces here on some platforms
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };

            match decode_datagram(&self.buffer[..len]) {
                Ok(message) => {
                    tracing::trace!("Received {} from {}", message.type_name(), from);
                    return Ok(message);
                }
                Err(e) => {
                    tracing::debug!("Dropping invalid datagram from {}: {}", from, e);
                }
            }
        }
    }
}

/// In-memory cluster channel with switchable links
#[cfg(test)]
pub(crate) mod loopback {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{DatagramReceiver, DatagramSender};
    use crate::replication::ClusterMessage;
    use crate::state::Member;
    use crate::error::{Error, Result};

    #[derive(Default)]
    struct Hub {
        inboxes: HashMap<String, mpsc::UnboundedSender<ClusterMessage>>,
        cut: HashSet<(String, String)>,
    }

    /// Shared switchboard connecting loopback endpoints
    #[derive(Clone, Default)]
    pub struct LoopbackNetwork {
        hub: Arc<Mutex<Hub>>,
    }

    pub struct LoopbackSender {
        from: String,
        hub: Arc<Mutex<Hub>>,
    }

    pub struct LoopbackReceiver {
        inbox: mpsc::UnboundedReceiver<ClusterMessage>,
    }

    impl LoopbackNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Attach a member and return its channel halves
        pub fn attach(&self, id: &str) -> (LoopbackSender, LoopbackReceiver) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.hub.lock().unwrap().inboxes.insert(id.to_string(), tx);
            (
                LoopbackSender {
                    from: id.to_string(),
                    hub: Arc::clone(&self.hub),
                },
                LoopbackReceiver { inbox: rx },
            )
        }

        /// Drop all traffic from `a` to `b`
        pub fn cut(&self, a: &str, b: &str) {
            self.hub
                .lock()
                .unwrap()
                .cut
                .insert((a.to_string(), b.to_string()));
        }
    }

    #[async_trait]
    impl DatagramSender for LoopbackSender {
        async fn send_to(&self, target: &Member, message: &ClusterMessage) -> Result<()> {
            let hub = self.hub.lock().unwrap();
            if hub.cut.contains(&(self.from.clone(), target.id.clone())) {
                return Ok(());
            }
            match hub.inboxes.get(&target.id) {
                Some(inbox) => {
                    let _ = inbox.send(message.clone());
                    Ok(())
                }
                None => Err(Error::Network(format!("{} is not attached", target.id))),
            }
        }
    }

    #[async_trait]
    impl DatagramReceiver for LoopbackReceiver {
        async fn recv(&mut self) -> Result<ClusterMessage> {
            self.inbox.recv().await.ok_or(Error::ShuttingDown)
        }
    }

    impl LoopbackReceiver {
        /// Take everything already delivered
        pub fn drain(&mut self) -> Vec<ClusterMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.inbox.try_recv() {
                out.push(message);
            }
            out
        }
    }
}
