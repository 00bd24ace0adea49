// Validation failures returned by the bid engine and the progression rules.
//
// These are expected, locally recoverable outcomes. Callers translate them
// into operator notices; none of them is fatal.

use thiserror::Error;

use super::model::{Money, PlayerStatus, SetStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bid of {offered} is below the minimum of {minimum}")]
    BelowMinimum { offered: Money, minimum: Money },

    #[error("{team} cannot afford {price} (remaining budget {remaining})")]
    InsufficientBudget {
        team: String,
        price: Money,
        remaining: Money,
    },

    #[error("{team} already has {max} players")]
    SquadFull { team: String, max: u32 },

    #[error("{team} already holds the highest bid")]
    ConsecutiveBid { team: String },

    #[error("there are no bids to undo")]
    NoBidsToUndo,

    #[error("no idle players left in set {set}")]
    NoIdlePlayers { set: String },

    #[error("player {player} is {status}, not open for bidding")]
    NotBidding { player: String, status: PlayerStatus },

    #[error("player {player} is already {status}")]
    AlreadyResolved { player: String, status: PlayerStatus },

    #[error("unknown team: {0}")]
    UnknownTeam(String),

    #[error("unknown set: {0}")]
    UnknownSet(String),

    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    #[error("set {set} is {status} and cannot be started")]
    SetNotIdle { set: String, status: SetStatus },

    #[error("set {0} is already running")]
    SetAlreadyRunning(String),

    #[error("the unsold set opens only after every other set is completed")]
    UnsoldSetLocked,

    #[error("no set is running")]
    NoRunningSet,

    #[error("no player is open for bidding")]
    NoPlayerBidding,

    #[error("player {0} is already open for bidding")]
    BiddingInProgress(String),

    #[error("{action} is not allowed while {phase}")]
    NotAllowed { action: String, phase: String },

    #[error("another action is still in flight")]
    MutationInFlight,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{0} cannot be removed while the auction is under way")]
    InUse(String),
}
