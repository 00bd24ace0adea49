// WebSocket push hub: per-auction rooms relaying the shown player and
// result announcements to every connected viewer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auction::model::Player;
use crate::protocol::{ClientMessage, HubMessage};

/// Per-room broadcast buffer. Slow viewers that fall further behind skip
/// ahead; they re-pull the snapshot anyway.
const ROOM_CAPACITY: usize = 64;

/// Where the operator session sends its push messages.
#[async_trait]
pub trait PushPublisher: Send + Sync {
    /// Announce the player now on display (`None` clears it).
    async fn publish_current(&self, auction_id: &str, player: Option<Player>) -> anyhow::Result<()>;

    async fn announce(&self, auction_id: &str, message: String) -> anyhow::Result<()>;
}

struct Room {
    tx: broadcast::Sender<HubMessage>,
    current: Option<HubMessage>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ROOM_CAPACITY);
        Self { tx, current: None }
    }
}

/// In-process hub. Rooms are keyed by auction id and created on first use.
#[derive(Default)]
pub struct PushHub {
    rooms: Mutex<HashMap<String, Room>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().expect("push hub mutex poisoned")
    }

    /// Subscribe to a room. Also returns the cached `CURRENT_ITEM` so the new
    /// member can be seeded before live traffic arrives.
    pub fn join(&self, auction_id: &str) -> (broadcast::Receiver<HubMessage>, Option<HubMessage>) {
        let mut rooms = self.rooms();
        let room = rooms
            .entry(auction_id.to_string())
            .or_insert_with(Room::new);
        (room.tx.subscribe(), room.current.clone())
    }

    /// Cache and broadcast the shown player.
    pub fn show_item(&self, auction_id: &str, player: Option<Player>) -> HubMessage {
        let msg = HubMessage::current_item(auction_id, player);
        let mut rooms = self.rooms();
        let room = rooms
            .entry(auction_id.to_string())
            .or_insert_with(Room::new);
        room.current = Some(msg.clone());
        // No subscribers is fine: the cache seeds whoever joins next.
        let delivered = room.tx.send(msg.clone()).unwrap_or(0);
        debug!("CURRENT_ITEM for {auction_id} delivered to {delivered} members");
        msg
    }

    /// Broadcast an announcement. Announcements are not cached.
    pub fn announce(&self, auction_id: &str, message: impl Into<String>) -> HubMessage {
        let msg = HubMessage::announcement(auction_id, message);
        let rooms = self.rooms();
        if let Some(room) = rooms.get(auction_id) {
            let delivered = room.tx.send(msg.clone()).unwrap_or(0);
            debug!("ANNOUNCEMENT for {auction_id} delivered to {delivered} members");
        }
        msg
    }

    /// Number of live members in a room.
    pub fn member_count(&self, auction_id: &str) -> usize {
        self.rooms()
            .get(auction_id)
            .map(|room| room.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PushPublisher for PushHub {
    async fn publish_current(&self, auction_id: &str, player: Option<Player>) -> anyhow::Result<()> {
        self.show_item(auction_id, player);
        Ok(())
    }

    async fn announce(&self, auction_id: &str, message: String) -> anyhow::Result<()> {
        PushHub::announce(self, auction_id, message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind the hub's listener on all interfaces. Port 0 picks a free port.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Push hub listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Run the hub on `port` until the task is cancelled.
pub async fn run(port: u16, hub: Arc<PushHub>) -> anyhow::Result<()> {
    let listener = bind(port).await?;
    serve(listener, hub).await
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, hub: Arc<PushHub>) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let addr_str = addr.to_string();
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {addr_str}: {e}");
                    return;
                }
            };
            info!("Push client connected: {addr_str}");
            handle_connection(ws_stream, hub, &addr_str).await;
            info!("Push client disconnected: {addr_str}");
        });
    }
}

/// Drive one connection: client messages go to the hub, room traffic goes
/// back out. A connection is a member of at most one room; a second `JOIN`
/// moves it.
async fn handle_connection<S>(ws_stream: WebSocketStream<S>, hub: Arc<PushHub>, addr: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, read) = ws_stream.split();
    let (join_tx, mut join_rx) = mpsc::channel::<String>(8);

    let reader = process_client_stream(read, &hub, &join_tx, addr);
    tokio::pin!(reader);

    let mut room: Option<broadcast::Receiver<HubMessage>> = None;
    loop {
        let outgoing = tokio::select! {
            _ = &mut reader => break,
            Some(auction_id) = join_rx.recv() => {
                let (rx, seed) = hub.join(&auction_id);
                room = Some(rx);
                info!("{addr} joined room {auction_id}");
                match seed {
                    Some(seed) => seed,
                    None => continue,
                }
            }
            received = recv_room(&mut room) => match received {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{addr} lagged behind, skipped {skipped} push messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    room = None;
                    continue;
                }
            },
        };

        let text = match serde_json::to_string(&outgoing) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode push message: {e}");
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(text.into())).await {
            warn!("Failed to send to {addr}: {e}");
            break;
        }
    }
}

async fn recv_room(
    room: &mut Option<broadcast::Receiver<HubMessage>>,
) -> Result<HubMessage, broadcast::error::RecvError> {
    match room {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Apply client messages from any [`Stream`] to the hub. `JOIN` requests are
/// forwarded through `joins` to the connection's writer. Returns `Err(())` if
/// the join channel is closed.
///
/// Generic over the stream so it can be tested with in-memory streams.
pub async fn process_client_stream<St>(
    mut stream: St,
    hub: &PushHub,
    joins: &mpsc::Sender<String>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Join { auction_id }) => {
                    if joins.send(auction_id).await.is_err() {
                        return Err(());
                    }
                }
                Ok(ClientMessage::ShowItem { auction_id, player }) => {
                    hub.show_item(&auction_id, player);
                }
                Ok(ClientMessage::Announce {
                    auction_id,
                    message,
                }) => {
                    hub.announce(&auction_id, message);
                }
                Err(e) => warn!("Ignoring malformed message from {addr}: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}
