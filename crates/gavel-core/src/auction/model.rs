// Auction domain records: auction, teams, sets, players and their bid lists.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Prices and budgets, in whole currency units.
pub type Money = u64;

/// Name of the set the store synthesizes for the second pass over leftovers.
pub const UNSOLD_SET_NAME: &str = "unsold";

// ---------------------------------------------------------------------------
// Auction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Setup,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub id: String,
    pub name: String,
    pub status: AuctionStatus,
    /// Starting budget handed to every team.
    pub budget: Money,
    pub min_team_member: u32,
    pub max_team_member: u32,
    pub is_public: bool,
}

impl Auction {
    pub fn settings(&self) -> AuctionSettings {
        AuctionSettings {
            budget: self.budget,
            min_team_member: self.min_team_member,
            max_team_member: self.max_team_member,
            is_public: self.is_public,
        }
    }
}

/// The operator-editable part of an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSettings {
    pub budget: Money,
    pub min_team_member: u32,
    pub max_team_member: u32,
    pub is_public: bool,
}

impl AuctionSettings {
    /// Budget must be positive and `0 < min_team_member <= max_team_member`.
    pub fn validate(&self) -> Result<(), crate::auction::ValidationError> {
        use crate::auction::ValidationError::InvalidSettings;
        if self.budget == 0 {
            return Err(InvalidSettings("budget must be greater than 0".into()));
        }
        if self.min_team_member == 0 {
            return Err(InvalidSettings("minimum squad size must be greater than 0".into()));
        }
        if self.min_team_member > self.max_team_member {
            return Err(InvalidSettings(format!(
                "minimum squad size {} exceeds maximum {}",
                self.min_team_member, self.max_team_member
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Team
// ---------------------------------------------------------------------------

/// A bidder. Remaining budget is never stored; see
/// [`crate::auction::grouping::group_by_team`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub budget: Money,
    #[serde(default)]
    pub logo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTeam {
    pub name: String,
    pub owner: String,
    /// Defaults to the auction budget when absent.
    #[serde(default)]
    pub budget: Option<Money>,
    #[serde(default)]
    pub logo: Option<String>,
}

// ---------------------------------------------------------------------------
// Set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetStatus {
    Idle,
    Running,
    Completed,
}

impl fmt::Display for SetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetStatus::Idle => "idle",
            SetStatus::Running => "running",
            SetStatus::Completed => "completed",
        };
        f.pad(s)
    }
}

/// A named group of players auctioned together as one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSet {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub status: SetStatus,
}

impl AuctionSet {
    /// Whether this is the store-synthesized second-pass set.
    pub fn is_unsold(&self) -> bool {
        self.name.eq_ignore_ascii_case(UNSOLD_SET_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSet {
    pub name: String,
    /// Appended after the last existing set when absent.
    #[serde(default)]
    pub order: Option<u32>,
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Idle,
    Bidding,
    Sold,
    Unsold,
}

impl PlayerStatus {
    /// Sold and unsold are final outcomes.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerStatus::Sold | PlayerStatus::Unsold)
    }

    /// Idle and bidding players keep a set open.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlayerStatus::Idle => "idle",
            PlayerStatus::Bidding => "bidding",
            PlayerStatus::Sold => "sold",
            PlayerStatus::Unsold => "unsold",
        };
        f.write_str(s)
    }
}

/// One entry in a player's bid list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidEntry {
    pub team_id: String,
    pub price: Money,
}

/// An auction item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    /// Free-form display attribute (e.g. "Batter", "Bowler").
    #[serde(default)]
    pub role: Option<String>,
    pub base_price: Money,
    pub set_id: String,
    pub status: PlayerStatus,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub sold_price: Option<Money>,
    /// Ordered by submission; the last entry is the current high bid.
    #[serde(default)]
    pub bids: Vec<BidEntry>,
}

impl Player {
    /// The current high bid, if any.
    pub fn leading_bid(&self) -> Option<&BidEntry> {
        self.bids.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlayer {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub base_price: Money,
    pub set_id: String,
}

/// A batched partial update for one player. `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PlayerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bids: Option<Vec<BidEntry>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub team_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub sold_price: Option<Option<Money>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_price: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,
}

impl PlayerUpdate {
    /// A full-record update carrying every mutable field of `player`.
    pub fn from_player(player: &Player) -> Self {
        PlayerUpdate {
            id: player.id.clone(),
            status: Some(player.status),
            bids: Some(player.bids.clone()),
            team_id: Some(player.team_id.clone()),
            sold_price: Some(player.sold_price),
            base_price: Some(player.base_price),
            set_id: Some(player.set_id.clone()),
        }
    }

    /// Only the bid list changes.
    pub fn bids_only(player: &Player) -> Self {
        PlayerUpdate {
            id: player.id.clone(),
            bids: Some(player.bids.clone()),
            ..Default::default()
        }
    }
}

/// Distinguishes an explicit `null` (clear) from an absent key (untouched).
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The full pulled state of one auction at a point in time.
///
/// Every derived view (groupings, phase) is a pure function of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Store revision; increases with every mutation.
    pub version: u64,
    pub auction: Auction,
    pub teams: Vec<Team>,
    pub players: Vec<Player>,
    pub sets: Vec<AuctionSet>,
    #[serde(default)]
    pub last_resolved: Option<Player>,
}

impl Snapshot {
    pub fn team(&self, team_id: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.id == team_id)
    }

    pub fn player(&self, player_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn set(&self, set_id: &str) -> Option<&AuctionSet> {
        self.sets.iter().find(|s| s.id == set_id)
    }

    /// Look up a set by id first, then by case-insensitive name.
    pub fn find_set(&self, key: &str) -> Option<&AuctionSet> {
        self.set(key)
            .or_else(|| self.sets.iter().find(|s| s.name.eq_ignore_ascii_case(key)))
    }

    /// Look up a team by id first, then by case-insensitive name.
    pub fn find_team(&self, key: &str) -> Option<&Team> {
        self.team(key)
            .or_else(|| self.teams.iter().find(|t| t.name.eq_ignore_ascii_case(key)))
    }

    /// The set currently being auctioned, if any.
    pub fn running_set(&self) -> Option<&AuctionSet> {
        self.sets.iter().find(|s| s.status == SetStatus::Running)
    }

    /// The store-synthesized unsold set, if it exists.
    pub fn unsold_set(&self) -> Option<&AuctionSet> {
        self.sets.iter().find(|s| s.is_unsold())
    }

    /// Players belonging to `set_id`, in snapshot order.
    pub fn players_in_set<'a>(&'a self, set_id: &'a str) -> impl Iterator<Item = &'a Player> + 'a {
        self.players.iter().filter(move |p| p.set_id == set_id)
    }

    /// The player currently open for bidding in the running set.
    pub fn bidding_player(&self) -> Option<&Player> {
        let running = self.running_set()?;
        self.players_in_set(&running.id)
            .find(|p| p.status == PlayerStatus::Bidding)
    }

    /// Whether every set other than the unsold set has completed.
    pub fn ordinary_sets_completed(&self) -> bool {
        self.sets
            .iter()
            .filter(|s| !s.is_unsold())
            .all(|s| s.status == SetStatus::Completed)
    }
}
