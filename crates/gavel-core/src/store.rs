// Request/response boundary to the auction store.
//
// The store owns persistence. The engine never mutates local state
// optimistically: every call below is followed by a fresh `fetch_snapshot`.

use async_trait::async_trait;
use thiserror::Error;

use crate::auction::model::{
    AuctionSet, AuctionSettings, NewPlayer, NewSet, NewTeam, Player, PlayerUpdate, SetStatus,
    Snapshot, Team,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Network or connection failure; the mutation is treated as not applied.
    #[error("store unreachable: {0}")]
    Transport(String),

    /// The session's authorization expired or was refused.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The store refused a mutation that conflicts with its own rules.
    #[error("rejected by store: {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Session failures force re-authentication and are never retried.
    pub fn is_session(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The store calls the engine depends on. Implementations:
/// [`crate::db::Database`] (SQLite) and an HTTP client in the app crate.
///
/// Store-side rules every implementation keeps:
/// - at most one set is `running`; starting a second one is a `Conflict`;
/// - `last_resolved` is set when a player turns sold/unsold and cleared when
///   a player turns bidding;
/// - once every ordinary set is completed and unsold players remain, an
///   `unsold` set is created holding them relisted as idle, and
///   `last_resolved` is cleared.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn fetch_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot>;

    /// Read-only view for passive viewers; refused for private auctions.
    async fn fetch_public_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot>;

    async fn update_auction(&self, auction_id: &str, settings: AuctionSettings)
        -> StoreResult<()>;

    /// Apply several player updates as one batch.
    async fn update_players(&self, auction_id: &str, updates: Vec<PlayerUpdate>)
        -> StoreResult<()>;

    async fn update_set_status(
        &self,
        auction_id: &str,
        set_id: &str,
        status: SetStatus,
    ) -> StoreResult<()>;

    async fn create_team(&self, auction_id: &str, team: NewTeam) -> StoreResult<Team>;

    async fn remove_team(&self, auction_id: &str, team_id: &str) -> StoreResult<()>;

    async fn create_set(&self, auction_id: &str, set: NewSet) -> StoreResult<AuctionSet>;

    async fn remove_set(&self, auction_id: &str, set_id: &str) -> StoreResult<()>;

    async fn create_players(&self, auction_id: &str, players: Vec<NewPlayer>)
        -> StoreResult<Vec<Player>>;

    async fn remove_players(&self, auction_id: &str, player_ids: Vec<String>)
        -> StoreResult<()>;

    /// Bulk import of parsed tabular rows.
    async fn import_players(&self, auction_id: &str, players: Vec<NewPlayer>)
        -> StoreResult<usize>;
}
