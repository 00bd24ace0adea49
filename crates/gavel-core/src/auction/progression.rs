// Progression state machine.
//
// The phase is never stored. It is recomputed from the latest snapshot each
// time one arrives, so two identical snapshots always yield the same phase no
// matter which path delivered them.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::error::ValidationError;
use super::grouping::{group_by_set, group_by_team};
use super::model::{AuctionSet, Money, Player, PlayerStatus, SetStatus, Snapshot};
use crate::command::{Command, CommandClass};

/// The externally observable step of the auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// No snapshot yet, or a mutation is in flight.
    Loading,
    /// No set has been started.
    NoSet,
    /// A set is running and waiting for the next pick.
    #[serde(rename_all = "camelCase")]
    Idle { set_id: String },
    #[serde(rename_all = "camelCase")]
    Bidding { set_id: String, player_id: String },
    /// A player was just resolved; shown until the next pick.
    #[serde(rename_all = "camelCase")]
    Sold { set_id: String, player_id: String },
    /// The running set is exhausted, or the last set to finish when nothing
    /// runs and ordinary sets remain.
    #[serde(rename_all = "camelCase")]
    SetComplete { set_id: String },
    /// Every ordinary set is done and the unsold set awaits its start.
    #[serde(rename_all = "camelCase")]
    UnsoldSetCreated { set_id: String },
    AuctionComplete,
}

impl Phase {
    /// Whether `command` is legal in this phase.
    pub fn allows(&self, command: &Command) -> bool {
        match (self, command.class()) {
            (Phase::Loading, _) | (Phase::AuctionComplete, _) => false,
            (_, CommandClass::Admin) => true,
            (
                Phase::NoSet | Phase::SetComplete { .. } | Phase::UnsoldSetCreated { .. },
                CommandClass::SelectSet,
            ) => true,
            (Phase::Idle { .. } | Phase::Sold { .. }, CommandClass::PickPlayer) => true,
            (Phase::Bidding { .. }, CommandClass::Bidding) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::NoSet => "waiting for a set",
            Phase::Idle { .. } => "waiting for a pick",
            Phase::Bidding { .. } => "bidding",
            Phase::Sold { .. } => "showing the last result",
            Phase::SetComplete { .. } => "set complete",
            Phase::UnsoldSetCreated { .. } => "unsold set ready",
            Phase::AuctionComplete => "auction complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute the phase from the latest snapshot.
pub fn compute_phase(snapshot: Option<&Snapshot>, in_flight: bool) -> Phase {
    let Some(snapshot) = snapshot else {
        return Phase::Loading;
    };
    if in_flight {
        return Phase::Loading;
    }

    if is_auction_complete(snapshot) {
        return Phase::AuctionComplete;
    }

    let by_set = group_by_set(&snapshot.players);

    if let Some(running) = snapshot.running_set() {
        if let Some(player) = snapshot.bidding_player() {
            return Phase::Bidding {
                set_id: running.id.clone(),
                player_id: player.id.clone(),
            };
        }
        if check_set_complete(&running.id, &by_set) {
            return Phase::SetComplete {
                set_id: running.id.clone(),
            };
        }
        if let Some(last) = snapshot
            .last_resolved
            .as_ref()
            .filter(|p| p.set_id == running.id && p.status.is_terminal())
        {
            return Phase::Sold {
                set_id: running.id.clone(),
                player_id: last.id.clone(),
            };
        }
        return Phase::Idle {
            set_id: running.id.clone(),
        };
    }

    if snapshot.ordinary_sets_completed() {
        if let Some(unsold) = snapshot
            .unsold_set()
            .filter(|s| s.status == SetStatus::Idle)
        {
            return Phase::UnsoldSetCreated {
                set_id: unsold.id.clone(),
            };
        }
    }

    let last_completed = snapshot
        .sets
        .iter()
        .filter(|s| s.status == SetStatus::Completed)
        .max_by_key(|s| s.order);
    match last_completed {
        Some(set) => Phase::SetComplete {
            set_id: set.id.clone(),
        },
        None => Phase::NoSet,
    }
}

/// Every set is completed, or the unsold set has itself completed.
pub fn is_auction_complete(snapshot: &Snapshot) -> bool {
    if snapshot.sets.is_empty() {
        return false;
    }
    let all_done = snapshot
        .sets
        .iter()
        .all(|s| s.status == SetStatus::Completed);
    let unsold_done = snapshot
        .unsold_set()
        .is_some_and(|s| s.status == SetStatus::Completed);
    all_done || unsold_done
}

/// True iff no player in `set_id` is idle or bidding.
pub fn check_set_complete(set_id: &str, by_set: &HashMap<&str, Vec<&Player>>) -> bool {
    by_set
        .get(set_id)
        .map(|players| players.iter().all(|p| p.status.is_terminal()))
        .unwrap_or(true)
}

/// The running set, if it has nothing left to auction and should be closed
/// without operator action.
pub fn set_to_auto_complete(snapshot: &Snapshot) -> Option<&AuctionSet> {
    let running = snapshot.running_set()?;
    let by_set = group_by_set(&snapshot.players);
    check_set_complete(&running.id, &by_set).then_some(running)
}

/// Resolve `key` (id or name) to a set that may be started now.
pub fn validate_select_set<'a>(
    snapshot: &'a Snapshot,
    key: &str,
) -> Result<&'a AuctionSet, ValidationError> {
    let set = snapshot
        .find_set(key)
        .ok_or_else(|| ValidationError::UnknownSet(key.to_string()))?;

    if let Some(running) = snapshot.running_set() {
        return Err(ValidationError::SetAlreadyRunning(running.name.clone()));
    }
    if set.status != SetStatus::Idle {
        return Err(ValidationError::SetNotIdle {
            set: set.name.clone(),
            status: set.status,
        });
    }
    if set.is_unsold() && !snapshot.ordinary_sets_completed() {
        return Err(ValidationError::UnsoldSetLocked);
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

/// A disagreement between the snapshot and the auction's rules. Never
/// repaired locally; the session answers with a fresh pull.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("{count} sets are running at once")]
    MultipleRunningSets { count: usize },

    #[error("set {set} has {count} players open for bidding")]
    MultipleBidding { set: String, count: usize },

    #[error("player {player} is bidding outside the running set")]
    BiddingOutsideRunningSet { player: String },

    #[error("player {player} is sold without a team or price")]
    SoldWithoutBuyer { player: String },

    #[error("player {player} has consecutive bids from {team}")]
    ConsecutiveBids { player: String, team: String },

    #[error("team {team} spent {spent} of a {budget} budget")]
    Overspent {
        team: String,
        spent: Money,
        budget: Money,
    },

    #[error("unsold set is running before every other set completed")]
    UnsoldSetEarly,
}

/// Every rule the snapshot breaks. Empty for a consistent snapshot.
pub fn check_invariants(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let running: Vec<&AuctionSet> = snapshot
        .sets
        .iter()
        .filter(|s| s.status == SetStatus::Running)
        .collect();
    if running.len() > 1 {
        violations.push(InvariantViolation::MultipleRunningSets {
            count: running.len(),
        });
    }
    if running.iter().any(|s| s.is_unsold()) && !snapshot.ordinary_sets_completed() {
        violations.push(InvariantViolation::UnsoldSetEarly);
    }

    let by_set = group_by_set(&snapshot.players);
    let mut set_ids: Vec<&&str> = by_set.keys().collect();
    set_ids.sort();
    for set_id in set_ids {
        let bidding: Vec<&&Player> = by_set[*set_id]
            .iter()
            .filter(|p| p.status == PlayerStatus::Bidding)
            .collect();
        if bidding.len() > 1 {
            violations.push(InvariantViolation::MultipleBidding {
                set: set_id.to_string(),
                count: bidding.len(),
            });
        }
        let in_running = running.iter().any(|s| s.id == **set_id);
        if !in_running {
            for player in bidding {
                violations.push(InvariantViolation::BiddingOutsideRunningSet {
                    player: player.name.clone(),
                });
            }
        }
    }

    for player in &snapshot.players {
        if player.status == PlayerStatus::Sold
            && (player.team_id.is_none() || player.sold_price.is_none())
        {
            violations.push(InvariantViolation::SoldWithoutBuyer {
                player: player.name.clone(),
            });
        }
        if let Some(pair) = player
            .bids
            .windows(2)
            .find(|pair| pair[0].team_id == pair[1].team_id)
        {
            violations.push(InvariantViolation::ConsecutiveBids {
                player: player.name.clone(),
                team: pair[1].team_id.clone(),
            });
        }
    }

    let standings = group_by_team(&snapshot.players, &snapshot.teams);
    for team in &snapshot.teams {
        if let Some(standing) = standings.get(&team.id).filter(|s| s.is_overspent()) {
            violations.push(InvariantViolation::Overspent {
                team: team.name.clone(),
                spent: standing.spent,
                budget: team.budget,
            });
        }
    }

    violations
}
