//! Client Connection Handler
//!
//! One task per accepted connection. Requests are read with an idle
//! timeout; replies and fan-out traffic go through a bounded outbox
//! drained by a separate writer task. A client that stops reading until
//! its outbox fills is disconnected, so it never blocks other sessions or
//! grows the leader's memory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientRequest, ServerEvent, ServerMessage};
use super::service::{Outbox, OUTBOX_CAPACITY};
use crate::coordinator::ClusterCoordinator;
use crate::network::{read_frame, write_frame};
use crate::state::SessionId;
use crate::error::{Error, Result};

/// How long queued replies may take to flush once a connection ends
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// What the read loop does after a request
enum Flow {
    Continue,
    Close,
}

/// Serve one client connection until it closes, idles out, is
/// redirected, or `cancel` fires.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<ClusterCoordinator>,
    cancel: CancellationToken,
) -> Result<()> {
    let idle = coordinator.timings().client_idle_timeout;
    let (mut reader, writer) = stream.into_split();
    // Cancelled on shutdown or when the outbox overflows
    let connection = cancel.child_token();
    let (outbox, inbox) = Outbox::new(OUTBOX_CAPACITY, connection.clone());
    let mut writer_task = tokio::spawn(write_loop(writer, inbox));
    let mut session: Option<SessionId> = None;

    tracing::debug!("Client connected from {}", peer);

    let result = loop {
        let request = tokio::select! {
            _ = connection.cancelled() => break Ok(()),
            read = timeout(idle, read_frame::<_, ClientRequest>(&mut reader)) => match read {
                Err(_) => {
                    tracing::debug!("Client {} idle for {:?}, closing", peer, idle);
                    send(&outbox, coordinator.chat().stamp(ServerEvent::Error {
                        message: "idle timeout".to_string(),
                    }));
                    break Ok(());
                }
                Ok(Err(Error::ConnectionClosed)) => break Ok(()),
                Ok(Err(e)) => break Err(e),
                Ok(Ok(request)) => request,
            },
        };

        tracing::trace!("{} from {}", request.name(), peer);
        if let Flow::Close = dispatch(&coordinator, &mut session, request, &outbox).await {
            break Ok(());
        }
    };

    if outbox.is_overflowed() {
        tracing::warn!("Client {} stopped reading, disconnecting", peer);
    }
    if let Some(id) = session {
        coordinator.chat().end_session(&id).await;
    }

    // The writer exits once every outbox sender is gone
    drop(outbox);
    if timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        writer_task.abort();
    }

    tracing::debug!("Client {} disconnected", peer);
    result
}

async fn dispatch(
    coordinator: &ClusterCoordinator,
    session: &mut Option<SessionId>,
    request: ClientRequest,
    outbox: &Outbox,
) -> Flow {
    let chat = coordinator.chat();

    // Status is answered by any server; everything else needs the leader
    if request != ClientRequest::Status && !coordinator.is_self_leader() {
        send(outbox, chat.stamp(coordinator.redirect_event()));
        return Flow::Close;
    }

    let result = match (session.clone(), request) {
        (_, ClientRequest::Status) => Ok(vec![
            chat.stamp(ServerEvent::Status(coordinator.status().await)),
        ]),
        (_, ClientRequest::Ping) => Ok(vec![chat.stamp(ServerEvent::Pong)]),
        (None, ClientRequest::Hello { display_name, room }) => chat
            .open_session(&display_name, room.as_deref(), outbox.clone())
            .await
            .map(|(id, replies)| {
                *session = Some(id);
                replies
            }),
        (Some(_), ClientRequest::Hello { .. }) => {
            Err(Error::Rejected("session already established".into()))
        }
        (None, _) => Err(Error::Rejected("send Hello first".into())),
        (Some(id), ClientRequest::CreateRoom { room }) => {
            chat.create_room(&id, &room).await.map(|m| vec![m])
        }
        (Some(id), ClientRequest::JoinRoom { room }) => {
            chat.join_room(&id, &room).await.map(|m| vec![m])
        }
        (Some(id), ClientRequest::LeaveRoom) => chat.leave_room(&id).await.map(|m| vec![m]),
        (Some(_), ClientRequest::ListRooms) => Ok(vec![chat.list_rooms().await]),
        // Delivered through the outbox, including back to the sender
        (Some(id), ClientRequest::Chat { text }) => chat.chat(&id, &text).await.map(|_| Vec::new()),
        (Some(id), ClientRequest::WhereAmI) => Ok(vec![chat.where_am_i(&id).await]),
    };

    match result {
        Ok(replies) => {
            for reply in replies {
                send(outbox, reply);
            }
            Flow::Continue
        }
        Err(Error::NotLeader(_)) | Err(Error::NoLeader) => {
            send(outbox, chat.stamp(coordinator.redirect_event()));
            Flow::Close
        }
        Err(Error::Rejected(message)) => {
            send(outbox, chat.stamp(ServerEvent::Error { message }));
            Flow::Continue
        }
        Err(e) => {
            tracing::warn!("Client request failed: {}", e);
            send(
                outbox,
                chat.stamp(ServerEvent::Error {
                    message: e.to_string(),
                }),
            );
            Flow::Continue
        }
    }
}

fn send(outbox: &Outbox, message: ServerMessage) {
    // A full outbox cancels the connection; the read loop sees it next
    outbox.push(message);
}

async fn write_loop(mut writer: OwnedWriteHalf, mut inbox: mpsc::Receiver<ServerMessage>) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            tracing::debug!("Client write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
