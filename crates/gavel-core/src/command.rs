// Operator commands.
//
// Every operator action is expressed as one `Command` value, validated
// against a freshly pulled snapshot before anything is sent to the store.
// On the wire a command is `{"kind": "...", "payload": {...}}`.

use serde::{Deserialize, Serialize};

use crate::auction::model::{AuctionSettings, Money, NewPlayer, NewSet, NewTeam};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum Command {
    /// Start an idle set. Accepts a set id or name.
    SelectSet { set: String },
    /// Open a random idle player from the running set for bidding.
    PickPlayer,
    /// Bid for `team` (id or name) on the player being auctioned.
    #[serde(rename_all = "camelCase")]
    PlaceBid {
        team: String,
        #[serde(default)]
        amount: Option<Money>,
    },
    UndoBid,
    /// Close bidding on the current player.
    Resolve,
    /// Sell the current player outright, bypassing bidding.
    ForceAssign { team: String, price: Money },
    UpdateSettings(AuctionSettings),
    CreateTeam(NewTeam),
    RemoveTeam { team: String },
    CreateSet(NewSet),
    RemoveSet { set: String },
    CreatePlayers(Vec<NewPlayer>),
    #[serde(rename_all = "camelCase")]
    RemovePlayers { player_ids: Vec<String> },
    /// Bulk import of player rows (already parsed from tabular data).
    ImportPlayers(Vec<NewPlayer>),
}

/// Coarse grouping used for phase legality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    SelectSet,
    PickPlayer,
    Bidding,
    Admin,
}

impl Command {
    pub fn class(&self) -> CommandClass {
        match self {
            Command::SelectSet { .. } => CommandClass::SelectSet,
            Command::PickPlayer => CommandClass::PickPlayer,
            Command::PlaceBid { .. }
            | Command::UndoBid
            | Command::Resolve
            | Command::ForceAssign { .. } => CommandClass::Bidding,
            Command::UpdateSettings(_)
            | Command::CreateTeam(_)
            | Command::RemoveTeam { .. }
            | Command::CreateSet(_)
            | Command::RemoveSet { .. }
            | Command::CreatePlayers(_)
            | Command::RemovePlayers { .. }
            | Command::ImportPlayers(_) => CommandClass::Admin,
        }
    }

    /// Short label for logs and notices.
    pub fn label(&self) -> &'static str {
        match self {
            Command::SelectSet { .. } => "select set",
            Command::PickPlayer => "pick player",
            Command::PlaceBid { .. } => "place bid",
            Command::UndoBid => "undo bid",
            Command::Resolve => "resolve",
            Command::ForceAssign { .. } => "assign",
            Command::UpdateSettings(_) => "update settings",
            Command::CreateTeam(_) => "create team",
            Command::RemoveTeam { .. } => "remove team",
            Command::CreateSet(_) => "create set",
            Command::RemoveSet { .. } => "remove set",
            Command::CreatePlayers(_) => "create players",
            Command::RemovePlayers { .. } => "remove players",
            Command::ImportPlayers(_) => "import players",
        }
    }
}
