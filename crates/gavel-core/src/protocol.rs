// Push-channel wire messages.
//
// The push channel is advisory: it tells viewers which player is on the
// floor and announces results, but the phase is always recomputed from a
// pulled snapshot. Messages are JSON objects tagged by `type`; every message
// carries the auction id that scopes it to one room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auction::model::{Money, Player, PlayerStatus, Team};

/// Messages a client sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Subscribe to an auction's room.
    #[serde(rename_all = "camelCase")]
    Join { auction_id: String },
    /// "This is the player I am now displaying." Seeds later joiners.
    #[serde(rename_all = "camelCase")]
    ShowItem {
        auction_id: String,
        player: Option<Player>,
    },
    /// Broadcast a human-readable result line.
    #[serde(rename_all = "camelCase")]
    Announce { auction_id: String, message: String },
}

/// Messages the hub delivers to every member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubMessage {
    #[serde(rename_all = "camelCase")]
    CurrentItem {
        auction_id: String,
        player: Option<Player>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Announcement {
        auction_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl HubMessage {
    pub fn current_item(auction_id: &str, player: Option<Player>) -> Self {
        HubMessage::CurrentItem {
            auction_id: auction_id.to_string(),
            player,
            timestamp: Utc::now(),
        }
    }

    pub fn announcement(auction_id: &str, message: impl Into<String>) -> Self {
        HubMessage::Announcement {
            auction_id: auction_id.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn auction_id(&self) -> &str {
        match self {
            HubMessage::CurrentItem { auction_id, .. }
            | HubMessage::Announcement { auction_id, .. } => auction_id,
        }
    }
}

/// Format an amount with thousands separators (`1500000` -> `1,500,000`).
pub fn format_money(amount: Money) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// The result line broadcast after a player is resolved.
pub fn announcement_for(player: &Player, teams: &[Team]) -> String {
    match (player.status, player.team_id.as_deref(), player.sold_price) {
        (PlayerStatus::Sold, Some(team_id), Some(price)) => {
            let team = teams
                .iter()
                .find(|t| t.id == team_id)
                .map(|t| t.name.as_str())
                .unwrap_or(team_id);
            format!("{} sold to {} for {}", player.name, team, format_money(price))
        }
        (PlayerStatus::Unsold, _, _) => format!("{} went unsold", player.name),
        _ => format!("{} is {}", player.name, player.status),
    }
}
