//! Newline-delimited JSON server over TCP.

use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::ClusterEngine;
use crate::hub::HubMessage;
use crate::protocol::{Command, CommandType, ProtocolError, ProtocolHandler, ResponseStatus};

// Outbound lines queued per connection before the reader waits on the writer
const OUTBOUND_BUFFER: usize = 64;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct ClusterServer {
    engine: ClusterEngine,
    listener: TcpListener,
    max_line_bytes: usize,
}

impl ClusterServer {
    pub async fn bind(engine: ClusterEngine, address: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let max_line_bytes = engine.config().server.max_line_bytes;
        Ok(Self {
            engine,
            listener,
            max_line_bytes,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self) -> std::io::Result<()> {
        info!("🌐 TCP server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("🔗 New client connected: {}", addr);
                    let engine = self.engine.clone();
                    let max_line_bytes = self.max_line_bytes;
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, addr, engine, max_line_bytes).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("🔌 Client {} disconnected", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// An active snapshot stream on one connection.
struct Subscription {
    id: u64,
    forwarder: JoinHandle<()>,
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    engine: ClusterEngine,
    max_line_bytes: usize,
) -> Result<(), BoxError> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let handler = ProtocolHandler::new(max_line_bytes);

    // Responses and pushed snapshots share one writer task
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let mut subscription: Option<Subscription> = None;
    let mut line = String::new();
    let result = loop {
        line.clear();
        match read_bounded_line(&mut buf_reader, &mut line, max_line_bytes).await {
            Ok(LineRead::Eof) => break Ok(()),
            Ok(LineRead::Oversized(size)) => {
                let err = ProtocolError::MessageTooLarge {
                    size,
                    limit: max_line_bytes,
                };
                warn!("Rejected line from {}: {}", addr, err);
                let json = handler.serialize_response(&handler.parse_error_response(&err))?;
                if out_tx.send(json).await.is_err() {
                    break Ok(());
                }
            }
            Ok(LineRead::Line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match handler.parse_command(trimmed) {
                    Ok(command) => {
                        debug!("📨 {} from {}", command.command_type.name(), addr);
                        match command.command_type {
                            CommandType::Subscribe => {
                                subscribe(&engine, &handler, &command, addr, &out_tx, &mut subscription).await
                            }
                            CommandType::Unsubscribe => {
                                let removed = unsubscribe(&engine, &mut subscription).await;
                                handler.create_response(
                                    command.id,
                                    ResponseStatus::Success,
                                    Some(if removed { "unsubscribed" } else { "not subscribed" }),
                                    None,
                                )
                            }
                            _ => engine.execute(&command).await,
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse command from {}: {}", addr, e);
                        handler.parse_error_response(&e)
                    }
                };

                let json = handler.serialize_response(&response)?;
                if out_tx.send(json).await.is_err() {
                    break Ok(());
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    unsubscribe(&engine, &mut subscription).await;
    drop(out_tx);
    if let Err(e) = writer_task.await {
        debug!("writer task for {} ended: {}", addr, e);
    }
    result
}

enum LineRead {
    Eof,
    Line,
    /// Line longer than the limit; it was discarded up to its newline.
    Oversized(usize),
}

/// Read one line into `line` without buffering more than `limit` bytes of it.
async fn read_bounded_line<R>(reader: &mut R, line: &mut String, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut bytes = Vec::new();
    let read = (&mut *reader).take(cap).read_until(b'\n', &mut bytes).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if read <= limit || bytes.ends_with(b"\n") {
        line.push_str(&String::from_utf8_lossy(&bytes));
        return Ok(LineRead::Line);
    }

    let mut size = read;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                size += pos;
                reader.consume(pos + 1);
                break;
            }
            None => {
                let len = available.len();
                size += len;
                reader.consume(len);
            }
        }
    }
    Ok(LineRead::Oversized(size))
}

async fn subscribe(
    engine: &ClusterEngine,
    handler: &ProtocolHandler,
    command: &Command,
    addr: SocketAddr,
    out_tx: &mpsc::Sender<String>,
    subscription: &mut Option<Subscription>,
) -> crate::protocol::CommandResponse {
    if let Some(existing) = subscription.take() {
        if !existing.forwarder.is_finished() && engine.is_subscribed(existing.id).await {
            let id = existing.id;
            *subscription = Some(existing);
            return handler.create_response(
                command.id,
                ResponseStatus::Success,
                Some("already subscribed"),
                Some(serde_json::json!({ "subscriber_id": id })),
            );
        }
        // Dropped by the hub; replace it
        debug!("subscriber {} for {} is gone, re-registering", existing.id, addr);
        existing.forwarder.abort();
    }

    match engine.subscribe(Some(addr.to_string())).await {
        Ok((subscriber, rx)) => {
            let forwarder = tokio::spawn(forward_messages(subscriber.id, rx, out_tx.clone()));
            *subscription = Some(Subscription {
                id: subscriber.id,
                forwarder,
            });
            handler.create_response(
                command.id,
                ResponseStatus::Success,
                Some("subscribed"),
                Some(serde_json::json!({ "subscriber_id": subscriber.id })),
            )
        }
        Err(e) => handler.create_response(command.id, ResponseStatus::for_error(&e), Some(&e.to_string()), None),
    }
}

async fn unsubscribe(engine: &ClusterEngine, subscription: &mut Option<Subscription>) -> bool {
    match subscription.take() {
        Some(active) => {
            active.forwarder.abort();
            engine.unsubscribe(active.id).await
        }
        None => false,
    }
}

/// Relay hub messages onto the connection until either side goes away.
/// When the hub closes the stream the client gets a final `closed` line.
async fn forward_messages(
    subscriber_id: u64,
    mut rx: mpsc::Receiver<HubMessage>,
    out_tx: mpsc::Sender<String>,
) {
    while let Some(message) = rx.recv().await {
        if !send_message(&out_tx, &message).await {
            return;
        }
    }
    debug!("hub closed stream for subscriber {}", subscriber_id);
    send_message(&out_tx, &HubMessage::Closed { subscriber_id }).await;
}

async fn send_message(out_tx: &mpsc::Sender<String>, message: &HubMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(line) => out_tx.send(line).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize hub message: {}", e);
            true
        }
    }
}

async fn write_lines(mut writer: OwnedWriteHalf, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Failed to write to client: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            warn!("Failed to write newline to client: {}", e);
            break;
        }
    }
}
