//! Network Module
//!
//! Datagram transport for cluster traffic and framed TCP streams for
//! chat clients. Both use the same header: body length and CRC-32.

pub mod datagram;
mod server;
mod client;

pub use datagram::{DatagramReceiver, DatagramSender, UdpReceiver, UdpSender, bind_datagram, broadcast};
pub use server::ClientServer;
pub use client::{ChatConnection, ChatReader, ChatWriter};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::replication::{ClusterMessage, FrameHeader};
use crate::error::{Error, Result};

/// Largest datagram body accepted
pub const MAX_DATAGRAM_BODY: usize = 64 * 1024;

/// Largest client stream frame accepted
pub const MAX_FRAME_BODY: usize = 1024 * 1024;

/// Encode a cluster message into a single datagram
pub fn encode_datagram(message: &ClusterMessage) -> Result<Vec<u8>> {
    let body = message.serialize()?;
    if body.len() > MAX_DATAGRAM_BODY {
        return Err(Error::FrameTooLarge {
            size: body.len(),
            max: MAX_DATAGRAM_BODY,
        });
    }

    let header = FrameHeader::new(&body);
    let mut packet = Vec::with_capacity(FrameHeader::SIZE + body.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Decode and verify a datagram
pub fn decode_datagram(packet: &[u8]) -> Result<ClusterMessage> {
    let (head, body) = packet
        .split_first_chunk::<{ FrameHeader::SIZE }>()
        .ok_or_else(|| Error::Protocol(format!("datagram too short: {} bytes", packet.len())))?;
    let header = FrameHeader::from_bytes(head);

    if !header.verify(body) {
        return Err(Error::Protocol("datagram checksum mismatch".into()));
    }

    Ok(ClusterMessage::deserialize(body)?)
}

/// Read a framed message from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_BODY {
        return Err(Error::FrameTooLarge {
            size: header.length as usize,
            max: MAX_FRAME_BODY,
        });
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if !header.verify(&body) {
        return Err(Error::Protocol("frame checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_BODY {
        return Err(Error::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_BODY,
        });
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ClientRequest;

    #[test]
    fn test_datagram_rejects_corruption() {
        let msg = ClusterMessage::Heartbeat {
            sender_id: "server1".to_string(),
            lamport_ts: 7,
            leader_id: Some("server3".to_string()),
        };
        let mut packet = encode_datagram(&msg).unwrap();
        assert_eq!(decode_datagram(&packet).unwrap(), msg);

        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(matches!(decode_datagram(&packet), Err(Error::Protocol(_))));
        assert!(decode_datagram(&packet[..4]).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, &ClientRequest::Ping).await.unwrap();
        write_frame(
            &mut a,
            &ClientRequest::JoinRoom {
                room: "general".to_string(),
            },
        )
        .await
        .unwrap();

        let first: ClientRequest = read_frame(&mut b).await.unwrap();
        let second: ClientRequest = read_frame(&mut b).await.unwrap();
        assert_eq!(first, ClientRequest::Ping);
        assert_eq!(
            second,
            ClientRequest::JoinRoom {
                room: "general".to_string()
            }
        );

        drop(a);
        let closed: Result<ClientRequest> = read_frame(&mut b).await;
        assert!(matches!(closed, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(64);
        let header = FrameHeader {
            length: (MAX_FRAME_BODY + 1) as u32,
            checksum: 0,
        };
        a.write_all(&header.to_bytes()).await.unwrap();

        let result: Result<ClientRequest> = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
    }
}
