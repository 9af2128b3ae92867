use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use warp::ws::{Message as WsMessage, WebSocket};

use crate::config::ServerConfig;
use crate::core::hub::HubHandle;
use crate::core::message::{Message, MessageType};
use crate::core::session::Session;
use crate::error::{Result, RustyChatError};

const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

// Handle a WebSocket connection from upgrade to teardown
pub async fn handle_ws_client(ws: WebSocket, hub: HubHandle, config: Arc<ServerConfig>) {
    if !hub.can_accept_new_connection() {
        warn!(
            "Connection rejected: server at capacity ({} clients)",
            hub.client_count()
        );
        reject_at_capacity(ws).await;
        return;
    }

    let (session, rx) = Session::new(&config);
    let session_id = session.id();
    info!("Client connected: {}", session_id);

    let (ws_tx, ws_rx) = ws.split();
    let writer = tokio::spawn(write_pump(ws_tx, rx, session.clone(), config.clone()));
    let reader = tokio::spawn(read_pump(ws_rx, session.clone(), hub.clone(), config));

    // A panicking reader still gets cleaned up below
    if let Err(e) = reader.await {
        error!("Read pump for {} ended abnormally: {}", session_id, e);
    }

    if let Err(e) = hub.unregister(&session).await {
        debug!("Could not unregister {}: {}", session_id, e);
    }
    session.close_transport();

    if let Err(e) = writer.await {
        error!("Write pump for {} ended abnormally: {}", session_id, e);
    }

    info!(
        "Client disconnected: {} ({} connected)",
        session_id,
        hub.client_count()
    );
}

async fn reject_at_capacity(mut ws: WebSocket) {
    let frame = WsMessage::close_with(CLOSE_TRY_AGAIN_LATER, "Server at capacity");
    if let Err(e) = ws.send(frame).await {
        debug!("Failed to send capacity close frame: {}", e);
    }
    if let Err(e) = ws.close().await {
        debug!("Failed to close rejected socket: {}", e);
    }
}

// Read frames until the peer goes away, the read deadline passes or the
// session is torn down from elsewhere
async fn read_pump(
    mut ws_rx: SplitStream<WebSocket>,
    session: Arc<Session>,
    hub: HubHandle,
    config: Arc<ServerConfig>,
) {
    let mut closed = session.closed_signal();

    loop {
        if *closed.borrow() {
            break;
        }

        // Every frame, pongs included, restarts the deadline
        let next = tokio::select! {
            _ = closed.changed() => break,
            next = timeout(config.pong_wait, ws_rx.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(
                    "No traffic from {} for {:?}, closing",
                    session.id(),
                    config.pong_wait
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for {}: {}", session.id(), e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        if frame.is_close() {
            debug!("Close frame received from {}", session.id());
            break;
        }
        if frame.is_ping() || frame.is_pong() {
            continue;
        }
        if frame.as_bytes().len() > config.max_message_size {
            warn!(
                "{} from {}, closing",
                RustyChatError::MessageTooLarge(frame.as_bytes().len()),
                session.id()
            );
            break;
        }
        if frame.is_binary() {
            session.send_error(RustyChatError::BinaryFrame.to_string());
            continue;
        }

        let text = match frame.to_str() {
            Ok(text) => text,
            Err(()) => continue,
        };

        if let Err(e) = process_frame(text, &session, &hub).await {
            if e.is_client_error() {
                debug!("Rejected frame from {}: {}", session.id(), e);
                session.send_error(e.to_string());
            } else {
                error!("Failed to process frame from {}: {}", session.id(), e);
                break;
            }
        }
    }

    debug!("Read pump for {} stopped", session.id());
}

// Decode, validate and dispatch a single text frame
async fn process_frame(text: &str, session: &Arc<Session>, hub: &HubHandle) -> Result<()> {
    let message = Message::from_json(text)?;
    message.validate().map_err(|e| match message.kind {
        MessageType::Join => RustyChatError::InvalidDisplayName(e),
        _ => RustyChatError::ValidationError(e),
    })?;
    session.touch();

    match message.kind {
        MessageType::Join => handle_join(message, session, hub).await,
        MessageType::Chat => handle_chat(message, session, hub).await,
        MessageType::Private => handle_private(message, session, hub).await,
        other => Err(RustyChatError::UnsupportedMessageType(other.to_string())),
    }
}

async fn handle_join(message: Message, session: &Arc<Session>, hub: &HubHandle) -> Result<()> {
    // The name was checked by `Message::validate`
    let name = message.content.as_deref().unwrap_or_default().trim();
    hub.register(session, name).await
}

async fn handle_chat(mut message: Message, session: &Arc<Session>, hub: &HubHandle) -> Result<()> {
    ensure_joined(session)?;
    ensure_within_rate(session)?;

    message.from = Some(session.display_name());
    message.stamp();
    message.sanitize_input();

    hub.broadcast(message).await
}

async fn handle_private(mut message: Message, session: &Arc<Session>, hub: &HubHandle) -> Result<()> {
    ensure_joined(session)?;

    let sender = session.display_name();
    let recipient = message.to.as_deref().unwrap_or_default().trim().to_string();
    if recipient == sender {
        return Err(RustyChatError::SelfMessage);
    }

    // Recipient lookup happens on the hub, so an unknown name still spends a slot
    ensure_within_rate(session)?;

    message.from = Some(sender);
    message.stamp();
    message.sanitize_input();

    debug!(
        "[PRIVATE_MSG] Routing: from={} to={}",
        session.display_name(),
        recipient
    );
    hub.send_directed(session, &recipient, message).await
}

fn ensure_joined(session: &Session) -> Result<()> {
    if session.is_joined() {
        Ok(())
    } else {
        Err(RustyChatError::NotJoined)
    }
}

fn ensure_within_rate(session: &Session) -> Result<()> {
    if session.rate_limiter().check_and_record() {
        Ok(())
    } else {
        warn!("Rate limit exceeded for user: {}", session.display_name());
        Err(RustyChatError::RateLimited)
    }
}

// Forward queued frames to the socket and keep the peer probed
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    session: Arc<Session>,
    config: Arc<ServerConfig>,
) {
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_batch(&mut ws_tx, &mut rx, frame, config.write_wait).await {
                        warn!("Write to {} failed: {}", session.id(), e);
                        break;
                    }
                }
                None => {
                    // Queue closed by the hub or the connection handler
                    if let Ok(Err(e)) = timeout(config.write_wait, ws_tx.send(WsMessage::close())).await {
                        debug!("Failed to send close frame to {}: {}", session.id(), e);
                    }
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(config.write_wait, ws_tx.send(WsMessage::ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Ping to {} failed: {}", session.id(), e);
                        break;
                    }
                    Err(_) => {
                        warn!("Ping to {} timed out", session.id());
                        break;
                    }
                }
            }
        }
    }

    session.close_transport();
    if let Err(e) = ws_tx.close().await {
        debug!("Error closing socket for {}: {}", session.id(), e);
    }
    debug!("Write pump for {} stopped", session.id());
}

// Write one frame plus whatever was already queued behind it, then flush once
async fn write_batch(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    rx: &mut mpsc::Receiver<String>,
    first: String,
    write_wait: Duration,
) -> Result<()> {
    let queued = rx.len();

    let write = async {
        ws_tx.feed(WsMessage::text(first)).await?;
        for _ in 0..queued {
            match rx.try_recv() {
                Ok(frame) => ws_tx.feed(WsMessage::text(frame)).await?,
                Err(_) => break,
            }
        }
        ws_tx.flush().await
    };

    match timeout(write_wait, write).await {
        Ok(result) => result.map_err(|e| RustyChatError::ConnectionError(e.to_string())),
        Err(_) => Err(RustyChatError::ConnectionError(format!(
            "write deadline of {:?} exceeded",
            write_wait
        ))),
    }
}
