// Derived lookups over a snapshot's flat player list: players by set, and
// players plus remaining budget by team. Recomputed from scratch on every
// snapshot; auctions hold at most a few hundred players.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use super::error::ValidationError;
use super::model::{Money, Player, PlayerStatus, Team};

/// A team together with the players it has won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamStanding {
    pub team: Team,
    /// Players sold to this team.
    pub players: Vec<Player>,
    /// Sum of sold prices.
    pub spent: Money,
    /// `team.budget - spent`, floored at zero.
    pub remaining: Money,
}

impl TeamStanding {
    pub fn squad_size(&self) -> usize {
        self.players.len()
    }

    /// Whether the sold prices exceed the starting budget. Only reachable
    /// through a store-side inconsistency.
    pub fn is_overspent(&self) -> bool {
        self.spent > self.team.budget
    }
}

/// Players keyed by set id, each list in snapshot order.
pub fn group_by_set(players: &[Player]) -> HashMap<&str, Vec<&Player>> {
    let mut groups: HashMap<&str, Vec<&Player>> = HashMap::new();
    for player in players {
        groups.entry(player.set_id.as_str()).or_default().push(player);
    }
    groups
}

/// Standing for every team, keyed by team id. Teams without purchases are
/// present with an empty list and their full budget.
pub fn group_by_team(players: &[Player], teams: &[Team]) -> HashMap<String, TeamStanding> {
    let mut standings: HashMap<String, TeamStanding> = teams
        .iter()
        .map(|team| {
            (
                team.id.clone(),
                TeamStanding {
                    team: team.clone(),
                    players: Vec::new(),
                    spent: 0,
                    remaining: team.budget,
                },
            )
        })
        .collect();

    for player in players.iter().filter(|p| p.status == PlayerStatus::Sold) {
        let Some(team_id) = player.team_id.as_deref() else {
            continue;
        };
        if let Some(standing) = standings.get_mut(team_id) {
            standing.spent += player.sold_price.unwrap_or(0);
            standing.players.push(player.clone());
        }
    }

    for standing in standings.values_mut() {
        standing.remaining = standing.team.budget.saturating_sub(standing.spent);
    }

    standings
}

/// Uniformly pick one idle player from `set_id`.
pub fn pick_random_idle<'a>(
    set_id: &str,
    by_set: &HashMap<&str, Vec<&'a Player>>,
) -> Result<&'a Player, ValidationError> {
    pick_random_idle_with(set_id, by_set, &mut rand::thread_rng())
}

/// [`pick_random_idle`] with a caller-supplied rng.
pub fn pick_random_idle_with<'a, R: Rng + ?Sized>(
    set_id: &str,
    by_set: &HashMap<&str, Vec<&'a Player>>,
    rng: &mut R,
) -> Result<&'a Player, ValidationError> {
    let pool: Vec<&'a Player> = by_set
        .get(set_id)
        .map(|players| {
            players
                .iter()
                .copied()
                .filter(|p| p.status == PlayerStatus::Idle)
                .collect()
        })
        .unwrap_or_default();

    pool.choose(rng)
        .copied()
        .ok_or_else(|| ValidationError::NoIdlePlayers {
            set: set_id.to_string(),
        })
}
