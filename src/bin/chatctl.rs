//! ChatCtl - Interactive client and status tool for ChatSync clusters
//!
//! Usage:
//!   chatctl --name alice     - Chat through whichever member leads
//!   chatctl status           - Show every member's coordination view

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;

use chatsync::chat::{ClientRequest, ServerEvent, ServerMessage};
use chatsync::config::ChatSyncConfig;
use chatsync::failover::{FailoverAgent, SessionState};
use chatsync::network::ChatConnection;

/// ChatSync cluster client
#[derive(Parser)]
#[command(name = "chatctl")]
#[command(about = "Chat on and inspect ChatSync clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chatsync.toml")]
    config: PathBuf,

    /// Display name for the chat session
    #[arg(short, long)]
    name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask every member for its view of the cluster
    Status,
}

/// A parsed line of user input
#[derive(Debug, PartialEq)]
enum Input {
    Send(ClientRequest),
    Help,
    Quit,
    Nothing,
}

const HELP: &str = "\
Commands:
  /create <room>   create a room and join it
  /join <room>     join an existing room
  /leave           leave the current room
  /rooms           list rooms
  /where           show current room and server
  /quit            exit
Anything else is sent to the current room.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ChatSyncConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match (cli.command, cli.name) {
        (Some(Commands::Status), _) => show_status(&config).await,
        (None, Some(name)) => chat(&config, name).await,
        (None, None) => bail!("pass --name <NAME> to chat, or use the status command"),
    }
}

/// Print every member's coordination view
async fn show_status(config: &ChatSyncConfig) -> anyhow::Result<()> {
    let timings = config.timings();
    let mut members = config.members.clone();
    members.sort_by(|a, b| b.ring_position.cmp(&a.ring_position));

    println!();
    println!("ChatSync Cluster Status (chatctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!(
        "{:<12} {:<6} {:<10} {:<12} {:<24} {:<8} {:<6}",
        "MEMBER", "RING", "ROLE", "LEADER", "REACHABLE", "LAMPORT", "ROOMS"
    );
    println!("{}", "-".repeat(82));

    for member in &members {
        let reply = async {
            let mut conn = ChatConnection::open(member, timings.connect_timeout).await?;
            conn.status(timings.connect_timeout).await
        }
        .await;

        match reply {
            Ok(status) => println!(
                "{:<12} {:<6} {:<10} {:<12} {:<24} {:<8} {:<6}",
                status.server_id,
                status.ring_position,
                if status.is_leader { "LEADER" } else { "follower" },
                status.leader_id.as_deref().unwrap_or("-"),
                status.reachable.join(","),
                status.lamport_time,
                status.rooms
            ),
            Err(e) => println!("{:<12} {:<6} DOWN ({})", member.id, member.ring_position, e),
        }
    }
    println!();
    Ok(())
}

/// Interactive chat session with automatic failover
async fn chat(config: &ChatSyncConfig, name: String) -> anyhow::Result<()> {
    let mut agent = FailoverAgent::new(config.members.clone(), config.timings());
    let mut session = SessionState::new(name);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", HELP);

    'connect: loop {
        let (conn, welcome) = agent
            .connect(&session)
            .await
            .context("no leader reachable")?;
        session.on_event(&welcome.event);
        render(&welcome);

        let (mut reader, mut writer) = conn.into_split();
        let mut keepalive = interval(agent.keepalive_interval());
        keepalive.tick().await;

        loop {
            tokio::select! {
                line = stdin.next_line() => {
                    let Some(line) = line? else { break 'connect };
                    match parse_input(&line) {
                        Input::Send(request) => {
                            if writer.send(&request).await.is_err() {
                                agent.connection_lost();
                                continue 'connect;
                            }
                        }
                        Input::Help => println!("{}", HELP),
                        Input::Quit => break 'connect,
                        Input::Nothing => {}
                    }
                }
                received = reader.recv() => match received {
                    Ok(message) => {
                        session.on_event(&message.event);
                        render(&message);
                        if agent.note_redirect(&message.event) || message.event.is_terminal() {
                            continue 'connect;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Receive failed: {}", e);
                        agent.connection_lost();
                        println!("* connection lost, looking for the leader...");
                        continue 'connect;
                    }
                },
                _ = keepalive.tick() => {
                    if writer.send(&ClientRequest::Ping).await.is_err() {
                        agent.connection_lost();
                        continue 'connect;
                    }
                }
            }
        }
    }

    println!("Bye.");
    Ok(())
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Nothing;
    }
    if !line.starts_with('/') {
        return Input::Send(ClientRequest::Chat {
            text: line.to_string(),
        });
    }

    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };
    match (command, arg) {
        ("/create", room) if !room.is_empty() => Input::Send(ClientRequest::CreateRoom {
            room: room.to_string(),
        }),
        ("/join", room) if !room.is_empty() => Input::Send(ClientRequest::JoinRoom {
            room: room.to_string(),
        }),
        ("/leave", _) => Input::Send(ClientRequest::LeaveRoom),
        ("/rooms", _) => Input::Send(ClientRequest::ListRooms),
        ("/where", _) => Input::Send(ClientRequest::WhereAmI),
        ("/quit", _) | ("/exit", _) => Input::Quit,
        _ => Input::Help,
    }
}

fn render(message: &ServerMessage) {
    let ts = message.lamport_ts;
    match &message.event {
        ServerEvent::Welcome { room, server_id, .. } => match room {
            Some(room) => println!("[{}] * connected to {}, back in '{}'", ts, server_id, room),
            None => println!("[{}] * connected to {}", ts, server_id),
        },
        ServerEvent::RoomJoined { room, created } => {
            let verb = if *created { "created" } else { "joined" };
            println!("[{}] * {} '{}'", ts, verb, room)
        }
        ServerEvent::RoomLeft { room } => println!("[{}] * left '{}'", ts, room),
        ServerEvent::RoomList { rooms } if rooms.is_empty() => println!("[{}] * no rooms yet", ts),
        ServerEvent::RoomList { rooms } => {
            for room in rooms {
                println!("[{}] * {} ({} members)", ts, room.name, room.members);
            }
        }
        ServerEvent::ChatMessage {
            room,
            sender,
            text,
            sent_at,
        } => println!("[{}] {} #{} <{}> {}", ts, local_time(sent_at), room, sender, text),
        ServerEvent::Info { text } => println!("[{}] * {}", ts, text),
        ServerEvent::Pong => {}
        ServerEvent::Error { message } => println!("[{}] ! {}", ts, message),
        ServerEvent::Redirect { leader_id, .. } => {
            println!("[{}] * leader is {}, reconnecting", ts, leader_id)
        }
        ServerEvent::Status(status) => println!("[{}] * {:?}", ts, status),
        ServerEvent::Unavailable { reason } => {
            println!("[{}] * cluster unavailable ({}), retrying", ts, reason)
        }
    }
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("   "), Input::Nothing);
        assert_eq!(
            parse_input("hello there"),
            Input::Send(ClientRequest::Chat {
                text: "hello there".to_string()
            })
        );
        assert_eq!(
            parse_input("/join  general "),
            Input::Send(ClientRequest::JoinRoom {
                room: "general".to_string()
            })
        );
        assert_eq!(parse_input("/join"), Input::Help);
        assert_eq!(parse_input("/leave"), Input::Send(ClientRequest::LeaveRoom));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/dance"), Input::Help);
    }

    #[test]
    fn test_keepalive_under_idle_timeout() {
        let config = ChatSyncConfig::local_three_node();
        let agent = FailoverAgent::new(config.members.clone(), config.timings());
        assert!(agent.keepalive_interval() < Duration::from_millis(config.cluster.client_idle_timeout_ms));
    }
}
