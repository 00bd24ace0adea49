// Client side of the push hub: the operator's publisher and the viewer's
// subscription, both over tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use gavel_core::auction::Player;
use gavel_core::protocol::{ClientMessage, HubMessage};
use gavel_core::ws_server::PushPublisher;

/// Delay between reconnect attempts to a remote hub.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publishes to a hub running in another process. Messages are queued to a
/// background task that owns the connection and reconnects on failure.
pub struct WsPublisher {
    tx: mpsc::Sender<ClientMessage>,
}

impl WsPublisher {
    /// Spawn the connection task for `url`. Messages queued while the hub is
    /// unreachable are dropped once the connection attempt fails.
    pub fn spawn(url: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(publish_loop(url.into(), rx));
        Self { tx }
    }

    async fn enqueue(&self, msg: ClientMessage) -> anyhow::Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("push publisher task has stopped"))
    }
}

#[async_trait]
impl PushPublisher for WsPublisher {
    async fn publish_current(&self, auction_id: &str, player: Option<Player>) -> anyhow::Result<()> {
        self.enqueue(ClientMessage::ShowItem {
            auction_id: auction_id.to_string(),
            player,
        })
        .await
    }

    async fn announce(&self, auction_id: &str, message: String) -> anyhow::Result<()> {
        self.enqueue(ClientMessage::Announce {
            auction_id: auction_id.to_string(),
            message,
        })
        .await
    }
}

async fn publish_loop(url: String, mut rx: mpsc::Receiver<ClientMessage>) {
    while let Some(first) = rx.recv().await {
        let (mut ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Push hub {url} unreachable, dropping message: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!("Connected to push hub {url}");

        let mut pending = Some(first);
        loop {
            let msg = match pending.take() {
                Some(msg) => msg,
                None => match rx.recv().await {
                    Some(msg) => msg,
                    None => return,
                },
            };
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode push message: {e}");
                    continue;
                }
            };
            if let Err(e) = ws.send(Message::Text(text.into())).await {
                warn!("Lost push hub connection: {e}");
                break;
            }
            debug!("Published push message");
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Join `auction_id` on the hub at `url` and forward every hub message to
/// `tx`, reconnecting until the receiver is dropped.
pub async fn subscribe(url: String, auction_id: String, tx: mpsc::Sender<HubMessage>) {
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("Subscribed to push hub {url} for {auction_id}");
                let (mut write, read) = ws.split();
                let join = ClientMessage::Join {
                    auction_id: auction_id.clone(),
                };
                match serde_json::to_string(&join) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            warn!("Failed to join room {auction_id}: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to encode JOIN: {e}"),
                }
                if forward_hub_stream(read, &tx).await.is_err() {
                    return;
                }
                warn!("Push hub connection closed, reconnecting");
            }
            Err(e) => warn!("Push hub {url} unreachable: {e}"),
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Decode hub messages from any [`Stream`] and forward them. Returns
/// `Err(())` when the receiver is gone.
pub async fn forward_hub_stream<St>(mut stream: St, tx: &mpsc::Sender<HubMessage>) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<HubMessage>(&text) {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        return Err(());
                    }
                }
                Err(e) => warn!("Ignoring malformed hub message: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("Push hub error: {e}");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures_util::stream;
    use gavel_core::ws_server::{bind, serve, PushHub};
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn hub_text(msg: &HubMessage) -> Result<Message, WsError> {
        Ok(Message::Text(serde_json::to_string(msg).unwrap().into()))
    }

    #[tokio::test]
    async fn hub_messages_are_decoded_and_forwarded() {
        let (tx, mut rx) = mpsc::channel(8);
        let messages = vec![
            hub_text(&HubMessage::announcement("a1", "first")),
            Ok(Message::Text("garbage".into())),
            hub_text(&HubMessage::current_item("a1", None)),
            Ok(Message::Close(None)),
            hub_text(&HubMessage::announcement("a1", "after close")),
        ];

        forward_hub_stream(stream::iter(messages), &tx).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), HubMessage::Announcement { .. }));
        assert!(matches!(rx.recv().await.unwrap(), HubMessage::CurrentItem { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarding_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let messages = vec![hub_text(&HubMessage::announcement("a1", "orphan"))];
        assert!(forward_hub_stream(stream::iter(messages), &tx).await.is_err());
    }

    #[tokio::test]
    async fn publisher_reaches_subscriber_through_hub() {
        let hub = Arc::new(PushHub::new());
        let listener = bind(0).await.unwrap();
        let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(serve(listener, Arc::clone(&hub)));

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(subscribe(url.clone(), "a1".into(), tx));
        // Wait until the subscriber has joined the room.
        for _ in 0..100 {
            if hub.member_count("a1") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.member_count("a1"), 1);

        let publisher = WsPublisher::spawn(url);
        publisher
            .announce("a1", "Player 1 went unsold".into())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            HubMessage::Announcement { message, .. } => assert_eq!(message, "Player 1 went unsold"),
            other => panic!("expected announcement, got {other:?}"),
        }
    }
}
