//! One WebSocket connection: a reader task and a writer task.
//!
//! ```text
//!            ┌──────────── reader ────────────┐
//! socket ──► │ deadline / size limit / route  │ ──► MessageRouter ──► Hub
//!            └────────────────────────────────┘
//!            ┌──────────── writer ────────────┐
//! socket ◄── │ coalesce queued frames / ping  │ ◄── client queue ◄── Hub
//!            └────────────────────────────────┘
//! ```
//!
//! The reader is the only task that reads the socket and the writer the only
//! one that writes it. Whichever side stops first brings the other down:
//! the reader unregisters the client and signals the writer when it exits,
//! and the writer signals the reader when the hub closes its queue or a
//! write fails, so an evicted client can no longer commit.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::hub::{ClientHandle, ClientId, Frame, HubHandle};
use crate::router::{ClientContext, MessageRouter};
use crate::UserId;

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest inbound frame in bytes; bigger frames close the connection.
    pub max_message_size: usize,
    /// How long to wait for a pong before giving up on the peer.
    pub pong_wait: Duration,
    /// Ping interval; must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Upper bound on any single write.
    pub write_wait: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_message_size: 4096,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Protocol-level limits for the upgrade, so an oversized message is
    /// refused while it is read instead of after it is buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write timed out")]
    Timeout,
    #[error(transparent)]
    Socket(#[from] tungstenite::Error),
}

/// Handles to a running connection's tasks.
pub struct ClientConnection {
    id: ClientId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Register a new client with `hub` and start its reader and writer.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        user_id: UserId,
        hub: HubHandle,
        router: Arc<MessageRouter>,
        config: ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (client, queue) = ClientHandle::new(user_id, config.queue_capacity);
        let ctx = ClientContext {
            id: client.id(),
            user_id,
            hub: hub.clone(),
        };
        if !hub.register(client) {
            // The handle was dropped with the request, so the writer will
            // find its queue closed and shut the socket.
            log::warn!("room {}: could not register client {}", hub.room_id(), ctx.id);
        }

        let (sink, stream) = ws.split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let id = ctx.id;
        let writer = tokio::spawn(write_pump(
            sink,
            queue,
            shutdown_rx,
            stopped_tx,
            config.clone(),
            id,
        ));
        let reader = tokio::spawn(read_pump(stream, ctx, router, config, shutdown_tx, stopped_rx));

        Self { id, reader, writer }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Wait until both tasks have finished.
    pub async fn closed(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Unregisters the client and wakes the writer however the reader exits.
struct ReaderGuard {
    ctx: ClientContext,
    _shutdown: oneshot::Sender<()>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.ctx.hub.unregister(self.ctx.id);
    }
}

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    ctx: ClientContext,
    router: Arc<MessageRouter>,
    config: ConnectionConfig,
    shutdown: oneshot::Sender<()>,
    mut writer_stopped: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = ReaderGuard {
        ctx: ctx.clone(),
        _shutdown: shutdown,
    };
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let read = tokio::select! {
            biased;
            _ = &mut writer_stopped => {
                log::debug!("client {}: writer stopped, no longer reading", ctx.id);
                break;
            }
            read = timeout_at(deadline, stream.next()) => read,
        };
        let message = match read {
            Err(_) => {
                log::info!("client {}: no pong within {:?}", ctx.id, config.pong_wait);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::info!("client {}: read error: {e}", ctx.id);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if !handle_frame(&ctx, &router, &config, text.as_str()) {
                    break;
                }
            }
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if !handle_frame(&ctx, &router, &config, text) {
                        break;
                    }
                }
                Err(_) => {
                    if bytes.len() > config.max_message_size {
                        break;
                    }
                    log::debug!("client {}: ignoring non-UTF-8 binary frame", ctx.id);
                }
            },
            Message::Pong(_) => deadline = Instant::now() + config.pong_wait,
            Message::Close(_) => break,
            // Pings are answered by tungstenite itself.
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }

    log::info!("client {} (user {}) disconnected", ctx.id, ctx.user_id);
}

/// Route one text frame. Returns false when the connection must close.
fn handle_frame(
    ctx: &ClientContext,
    router: &MessageRouter,
    config: &ConnectionConfig,
    text: &str,
) -> bool {
    if text.len() > config.max_message_size {
        log::warn!(
            "client {}: {} byte frame exceeds limit of {}",
            ctx.id,
            text.len(),
            config.max_message_size
        );
        return false;
    }
    let text = text.replace('\n', " ");
    let text = text.trim();
    if !text.is_empty() {
        router.route(ctx, text);
    }
    true
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut queue: mpsc::Receiver<Frame>,
    mut shutdown: oneshot::Receiver<()>,
    stopped: oneshot::Sender<()>,
    config: ConnectionConfig,
    id: ClientId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(first) = frame else {
                    // Queue closed by the hub
                    let _ = send(&mut sink, Message::Close(None), config.write_wait).await;
                    break;
                };
                let text = coalesce(first, &mut queue);
                if let Err(e) = send(&mut sink, Message::text(text), config.write_wait).await {
                    log::info!("client {id}: write failed: {e}");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = send(&mut sink, Message::Ping(Vec::new().into()), config.write_wait).await {
                    log::info!("client {id}: ping failed: {e}");
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    // Stop the reader before the close handshake, which may take write_wait.
    drop(stopped);
    let _ = timeout(config.write_wait, sink.close()).await;
}

/// Join `first` with every frame already waiting, newline separated, so a
/// burst goes out as one WebSocket message.
fn coalesce(first: Frame, queue: &mut mpsc::Receiver<Frame>) -> String {
    let mut text = String::from(&*first);
    for _ in 0..queue.len() {
        match queue.try_recv() {
            Ok(next) => {
                text.push('\n');
                text.push_str(&next);
            }
            Err(_) => break,
        }
    }
    text
}

async fn send<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    wait: Duration,
) -> Result<(), WriteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(wait, sink.send(message))
        .await
        .map_err(|_| WriteError::Timeout)??;
    Ok(())
}
