// Passive viewer: follows an auction through the public snapshot.
//
// Push messages are hints. They never change the phase directly; each one
// only triggers a re-pull, and the phase is derived from whatever snapshot
// that pull returns.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use gavel_core::auction::{compute_phase, Phase, Player, Snapshot};
use gavel_core::protocol::HubMessage;
use gavel_core::store::AuctionStore;

use crate::session::SessionError;

/// How many announcements a viewer keeps for display.
const ANNOUNCEMENT_HISTORY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Viewer {
    auction_id: String,
    store: Arc<dyn AuctionStore>,
    snapshot: Option<Snapshot>,
    shown: Option<Player>,
    announcements: VecDeque<Announcement>,
}

impl Viewer {
    pub fn new(auction_id: impl Into<String>, store: Arc<dyn AuctionStore>) -> Self {
        Self {
            auction_id: auction_id.into(),
            store,
            snapshot: None,
            shown: None,
            announcements: VecDeque::new(),
        }
    }

    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn phase(&self) -> Phase {
        compute_phase(self.snapshot.as_ref(), false)
    }

    /// The player the operator last announced as shown.
    pub fn shown(&self) -> Option<&Player> {
        self.shown.as_ref()
    }

    /// Most recent first.
    pub fn announcements(&self) -> impl Iterator<Item = &Announcement> {
        self.announcements.iter()
    }

    /// Pull the public snapshot. Returns whether it replaced the current one.
    pub async fn refresh(&mut self) -> Result<bool, SessionError> {
        let snapshot = self.store.fetch_public_snapshot(&self.auction_id).await?;
        Ok(self.accept(snapshot))
    }

    /// Keep `snapshot` unless it is older than the one already held.
    pub fn accept(&mut self, snapshot: Snapshot) -> bool {
        if let Some(current) = &self.snapshot {
            if snapshot.version < current.version {
                debug!(
                    "Ignoring stale snapshot v{} (holding v{})",
                    snapshot.version, current.version
                );
                return false;
            }
        }
        self.snapshot = Some(snapshot);
        true
    }

    /// React to a hub message: note it, then re-pull. Messages for other
    /// auctions are ignored.
    pub async fn handle_push(&mut self, msg: HubMessage) -> Result<bool, SessionError> {
        if msg.auction_id() != self.auction_id {
            return Ok(false);
        }
        match msg {
            HubMessage::CurrentItem { player, .. } => {
                self.shown = player;
            }
            HubMessage::Announcement {
                message, timestamp, ..
            } => {
                self.announcements.push_front(Announcement { message, timestamp });
                self.announcements.truncate(ANNOUNCEMENT_HISTORY);
            }
        }
        self.refresh().await
    }
}
