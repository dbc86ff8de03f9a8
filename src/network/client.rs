//! Chat Client Connection
//!
//! Framed TCP connection from a chat client to one server.

use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_frame, write_frame};
use crate::chat::{ClientRequest, ServerEvent, ServerMessage};
use crate::coordinator::ClusterStatus;
use crate::state::Member;
use crate::error::{Error, Result};

/// Receiving half of a chat connection
pub struct ChatReader {
    inner: OwnedReadHalf,
}

/// Sending half of a chat connection
pub struct ChatWriter {
    inner: OwnedWriteHalf,
}

/// Connection to one server's client port
pub struct ChatConnection {
    /// Member this connection points at
    member: Member,
    reader: ChatReader,
    writer: ChatWriter,
}

impl ChatConnection {
    /// Connect with a timeout
    pub async fn open(member: &Member, connect_timeout: Duration) -> Result<Self> {
        let address = member.client_address();
        let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address)),
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        tracing::debug!("Connected to {}", member);
        Ok(Self {
            member: member.clone(),
            reader: ChatReader { inner: reader },
            writer: ChatWriter { inner: writer },
        })
    }

    /// Member this connection points at
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Send a request
    pub async fn send(&mut self, request: &ClientRequest) -> Result<()> {
        self.writer.send(request).await
    }

    /// Wait for the next server message
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        self.reader.recv().await
    }

    /// Wait for the next server message, giving up after `limit`
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<ServerMessage> {
        timeout(limit, self.reader.recv())
            .await
            .map_err(|_| Error::ConnectionTimeout(self.member.client_address()))?
    }

    /// Send a request and wait for the first reply
    pub async fn request(&mut self, request: &ClientRequest, limit: Duration) -> Result<ServerMessage> {
        self.send(request).await?;
        self.recv_timeout(limit).await
    }

    /// Ask the member for its own view of the cluster
    pub async fn status(&mut self, limit: Duration) -> Result<ClusterStatus> {
        match self.request(&ClientRequest::Status, limit).await?.event {
            ServerEvent::Status(status) => Ok(status),
            other => Err(Error::Protocol(format!("expected status, got {:?}", other))),
        }
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (ChatReader, ChatWriter) {
        (self.reader, self.writer)
    }
}

impl ChatReader {
    /// Wait for the next server message
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        read_frame(&mut self.inner).await
    }
}

impl ChatWriter {
    /// Send a request
    pub async fn send(&mut self, request: &ClientRequest) -> Result<()> {
        write_frame(&mut self.inner, request).await
    }
}
