// Bid engine: price ladder, bidder eligibility, and the bid/undo/resolve
// operations on a single player.
//
// Every operation is copy-on-write: it reads a `&Player` and returns the
// updated record, leaving the input untouched.

use tracing::warn;

use super::error::ValidationError;
use super::grouping::TeamStanding;
use super::model::{BidEntry, Money, Player, PlayerStatus};

// ---------------------------------------------------------------------------
// Price ladder
// ---------------------------------------------------------------------------

const TIER_1_CEILING: Money = 10_000_000;
const TIER_2_CEILING: Money = 20_000_000;
const TIER_3_CEILING: Money = 50_000_000;

/// The minimum raise over `price`. Tiers switch exactly at their lower bound.
pub fn bid_increment(price: Money) -> Money {
    if price < TIER_1_CEILING {
        500_000
    } else if price < TIER_2_CEILING {
        1_000_000
    } else if price < TIER_3_CEILING {
        2_000_000
    } else {
        2_500_000
    }
}

/// Smallest acceptable bid after a bid of `last_price`.
pub fn next_minimum_bid(last_price: Money) -> Money {
    last_price.saturating_add(bid_increment(last_price))
}

/// Price of the next bid on `player`: the base price for an opening bid,
/// otherwise one ladder step above the current high bid.
pub fn next_bid_price(player: &Player) -> Money {
    match player.leading_bid() {
        Some(bid) => next_minimum_bid(bid.price),
        None => player.base_price,
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Whether `standing`'s team may bid `price` on `player`.
///
/// Squad capacity, budget and the consecutive-bidder rule are checked
/// independently; the first failing rule is reported.
pub fn can_bid(
    standing: &TeamStanding,
    player: &Player,
    price: Money,
    max_team_member: u32,
) -> Result<(), ValidationError> {
    check_capacity(standing, max_team_member)?;
    check_budget(standing, price)?;

    if let Some(last) = player.leading_bid() {
        if last.team_id == standing.team.id {
            return Err(ValidationError::ConsecutiveBid {
                team: standing.team.name.clone(),
            });
        }
    }

    Ok(())
}

fn check_capacity(standing: &TeamStanding, max_team_member: u32) -> Result<(), ValidationError> {
    if standing.squad_size() >= max_team_member as usize {
        return Err(ValidationError::SquadFull {
            team: standing.team.name.clone(),
            max: max_team_member,
        });
    }
    Ok(())
}

fn check_budget(standing: &TeamStanding, price: Money) -> Result<(), ValidationError> {
    if price > standing.remaining {
        return Err(ValidationError::InsufficientBudget {
            team: standing.team.name.clone(),
            price,
            remaining: standing.remaining,
        });
    }
    Ok(())
}

fn ensure_bidding(player: &Player) -> Result<(), ValidationError> {
    if player.status != PlayerStatus::Bidding {
        return Err(ValidationError::NotBidding {
            player: player.name.clone(),
            status: player.status,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Place a bid for `standing`'s team on `player`.
///
/// Without an `offer` the bid is placed at [`next_bid_price`]. An explicit
/// offer (a jump bid) must be at least that price. The returned player's bid
/// list stays sorted ascending by price.
pub fn apply_bid(
    player: &Player,
    standing: &TeamStanding,
    max_team_member: u32,
    offer: Option<Money>,
) -> Result<Player, ValidationError> {
    ensure_bidding(player)?;

    let minimum = next_bid_price(player);
    let price = match offer {
        Some(offered) if offered < minimum => {
            return Err(ValidationError::BelowMinimum { offered, minimum });
        }
        Some(offered) => offered,
        None => minimum,
    };

    can_bid(standing, player, price, max_team_member)?;

    let mut updated = player.clone();
    updated.bids.push(BidEntry {
        team_id: standing.team.id.clone(),
        price,
    });
    // Stable: equal prices from a racing duplicate keep arrival order.
    updated.bids.sort_by_key(|b| b.price);
    Ok(updated)
}

/// Remove the current high bid. Single-level only.
pub fn undo_bid(player: &Player) -> Result<Player, ValidationError> {
    ensure_bidding(player)?;
    if player.bids.is_empty() {
        return Err(ValidationError::NoBidsToUndo);
    }
    let mut updated = player.clone();
    updated.bids.pop();
    Ok(updated)
}

/// How a player left the auction floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sold { team_id: String, price: Money },
    Unsold,
}

/// Close bidding on `player`: sold to the last bidder at the last price, or
/// unsold when nobody bid. Terminal.
pub fn resolve(player: &Player) -> Result<(Player, Outcome), ValidationError> {
    ensure_bidding(player)?;

    let mut updated = player.clone();
    let outcome = match player.leading_bid() {
        Some(bid) => {
            updated.status = PlayerStatus::Sold;
            updated.team_id = Some(bid.team_id.clone());
            updated.sold_price = Some(bid.price);
            Outcome::Sold {
                team_id: bid.team_id.clone(),
                price: bid.price,
            }
        }
        None => {
            updated.status = PlayerStatus::Unsold;
            updated.team_id = None;
            updated.sold_price = None;
            Outcome::Unsold
        }
    };
    Ok((updated, outcome))
}

/// Administrative override: sell `player` to `standing`'s team at `price`
/// without a bid history.
///
/// Skips the ladder and the consecutive-bidder rule. Terminal players, full
/// squads and prices beyond the remaining budget are still refused.
pub fn force_assign(
    player: &Player,
    standing: &TeamStanding,
    price: Money,
    max_team_member: u32,
) -> Result<Player, ValidationError> {
    if player.status.is_terminal() {
        return Err(ValidationError::AlreadyResolved {
            player: player.name.clone(),
            status: player.status,
        });
    }
    check_capacity(standing, max_team_member)?;
    check_budget(standing, price)?;

    warn!(
        "Override: assigning {} to {} for {} (bypassing bidding)",
        player.name, standing.team.name, price
    );

    let mut updated = player.clone();
    updated.status = PlayerStatus::Sold;
    updated.team_id = Some(standing.team.id.clone());
    updated.sold_price = Some(price);
    Ok(updated)
}
