// Operator session: the single writer of one auction.
//
// Every command goes through the same pipeline: refuse while another is in
// flight, re-pull, check the phase, validate against the fresh snapshot,
// mutate the store, re-pull, check invariants, close an exhausted set, then
// push. The local snapshot is only ever replaced by a pulled one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use gavel_core::auction::bid::{self, Outcome};
use gavel_core::auction::grouping::{group_by_set, group_by_team, pick_random_idle, TeamStanding};
use gavel_core::auction::progression::{check_invariants, set_to_auto_complete, validate_select_set};
use gavel_core::auction::{
    compute_phase, AuctionSettings, NewPlayer, NewSet, NewTeam, Phase, Player, PlayerStatus,
    PlayerUpdate, SetStatus, Snapshot, ValidationError, UNSOLD_SET_NAME,
};
use gavel_core::command::Command;
use gavel_core::import::{missing_sets, to_new_players, ImportRow};
use gavel_core::protocol::announcement_for;
use gavel_core::store::{AuctionStore, StoreError};
use gavel_core::ws_server::PushPublisher;

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Failures that are not the operator's fault. `Unauthorized` ends the
/// session; the rest leave the last good snapshot in place.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session expired, sign in again: {0}")]
    Unauthorized(String),

    #[error("store request failed: {0}")]
    Store(StoreError),
}

impl SessionError {
    pub fn requires_reauth(&self) -> bool {
        matches!(self, SessionError::Unauthorized(_))
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        if err.is_session() {
            SessionError::Unauthorized(err.to_string())
        } else {
            SessionError::Store(err)
        }
    }
}

/// What happened to a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The store accepted the change; `phase` is derived from the re-pulled
    /// snapshot.
    Applied { phase: Phase },
    /// Nothing was sent to the store.
    Rejected(ValidationError),
}

/// A store call derived from a validated command.
#[derive(Debug, Clone, PartialEq)]
enum Mutation {
    Players(Vec<PlayerUpdate>),
    SetStatus { set_id: String, status: SetStatus },
    Settings(AuctionSettings),
    CreateTeam(NewTeam),
    RemoveTeam(String),
    CreateSet(NewSet),
    RemoveSet(String),
    CreatePlayers(Vec<NewPlayer>),
    RemovePlayers(Vec<String>),
    Import(Vec<NewPlayer>),
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// OperatorSession
// ---------------------------------------------------------------------------

pub struct OperatorSession {
    auction_id: String,
    store: Arc<dyn AuctionStore>,
    publisher: Arc<dyn PushPublisher>,
    snapshot: Mutex<Option<Snapshot>>,
    in_flight: AtomicBool,
}

impl OperatorSession {
    pub fn new(
        auction_id: impl Into<String>,
        store: Arc<dyn AuctionStore>,
        publisher: Arc<dyn PushPublisher>,
    ) -> Self {
        Self {
            auction_id: auction_id.into(),
            store,
            publisher,
            snapshot: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    /// The last pulled snapshot.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The phase as the operator sees it right now.
    pub fn phase(&self) -> Phase {
        let snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
        compute_phase(snapshot.as_ref(), self.is_in_flight())
    }

    /// Pull the full snapshot and make it current. A running set with
    /// nothing left in it is completed on the way, unless an action in
    /// flight will do that itself.
    pub async fn refresh(&self) -> Result<Snapshot, SessionError> {
        let snapshot = self.pull().await?;
        if set_to_auto_complete(&snapshot).is_none() {
            return Ok(snapshot);
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Ok(snapshot);
        };
        let snapshot = self.settle(snapshot).await?;
        self.push(&snapshot, None).await;
        Ok(snapshot)
    }

    async fn pull(&self) -> Result<Snapshot, SessionError> {
        let snapshot = self.store.fetch_snapshot(&self.auction_id).await?;
        debug!("Pulled snapshot v{} for {}", snapshot.version, self.auction_id);
        *self.snapshot.lock().expect("snapshot mutex poisoned") = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Complete the running set if every player in it is resolved, then
    /// re-pull. Must be called with the in-flight flag held.
    async fn settle(&self, snapshot: Snapshot) -> Result<Snapshot, SessionError> {
        let Some(set) = set_to_auto_complete(&snapshot) else {
            return Ok(snapshot);
        };
        info!("Set {} has no players left, completing it", set.name);
        let set_id = set.id.clone();
        self.store
            .update_set_status(&self.auction_id, &set_id, SetStatus::Completed)
            .await?;
        self.pull().await
    }

    /// Run one operator command through the full pipeline.
    pub async fn dispatch(&self, command: Command) -> Result<Dispatch, SessionError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            warn!("Rejected {}: another action is in flight", command.label());
            return Ok(Dispatch::Rejected(ValidationError::MutationInFlight));
        };
        self.run_locked(command).await
    }

    /// The pipeline behind `dispatch`, for callers already holding the
    /// in-flight flag.
    async fn run_locked(&self, command: Command) -> Result<Dispatch, SessionError> {
        info!("Operator command: {}", command.label());

        let snapshot = self.pull().await?;
        let snapshot = self.settle(snapshot).await?;
        let phase = compute_phase(Some(&snapshot), false);
        if !phase.allows(&command) {
            let err = ValidationError::NotAllowed {
                action: command.label().to_string(),
                phase: phase.name().to_string(),
            };
            warn!("Rejected {}: {}", command.label(), err);
            return Ok(Dispatch::Rejected(err));
        }

        let (mutation, resolved) = match plan(&snapshot, &command) {
            Ok(planned) => planned,
            Err(err) => {
                warn!("Rejected {}: {}", command.label(), err);
                return Ok(Dispatch::Rejected(err));
            }
        };

        self.apply(mutation).await?;

        let mut snapshot = self.pull().await?;
        let violations = check_invariants(&snapshot);
        if !violations.is_empty() {
            for violation in &violations {
                warn!("Invariant violated after {}: {}", command.label(), violation);
            }
            snapshot = self.pull().await?;
        }

        let snapshot = self.settle(snapshot).await?;
        self.push(&snapshot, resolved.as_ref()).await;

        let phase = compute_phase(Some(&snapshot), false);
        info!("Applied {}; now {}", command.label(), phase);
        Ok(Dispatch::Applied { phase })
    }

    /// Import parsed CSV rows. Sets the rows name that do not exist yet are
    /// created first, in file order. The whole import is one action: no
    /// other command runs until it is done.
    pub async fn import_rows(&self, rows: &[ImportRow]) -> Result<Dispatch, SessionError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            warn!("Rejected import: another action is in flight");
            return Ok(Dispatch::Rejected(ValidationError::MutationInFlight));
        };

        let snapshot = self.pull().await?;
        for set in missing_sets(&snapshot, rows) {
            info!("Creating set {} for import", set.name);
            let outcome = self.run_locked(Command::CreateSet(set)).await?;
            if let Dispatch::Rejected(_) = outcome {
                return Ok(outcome);
            }
        }
        let snapshot = self.pull().await?;
        match to_new_players(&snapshot, rows) {
            Ok(players) => self.run_locked(Command::ImportPlayers(players)).await,
            Err(err) => Ok(Dispatch::Rejected(err)),
        }
    }

    async fn apply(&self, mutation: Mutation) -> Result<(), StoreError> {
        let id = self.auction_id.as_str();
        match mutation {
            Mutation::Players(updates) => self.store.update_players(id, updates).await,
            Mutation::SetStatus { set_id, status } => {
                self.store.update_set_status(id, &set_id, status).await
            }
            Mutation::Settings(settings) => self.store.update_auction(id, settings).await,
            Mutation::CreateTeam(team) => self.store.create_team(id, team).await.map(|_| ()),
            Mutation::RemoveTeam(team_id) => self.store.remove_team(id, &team_id).await,
            Mutation::CreateSet(set) => self.store.create_set(id, set).await.map(|_| ()),
            Mutation::RemoveSet(set_id) => self.store.remove_set(id, &set_id).await,
            Mutation::CreatePlayers(players) => {
                self.store.create_players(id, players).await.map(|_| ())
            }
            Mutation::RemovePlayers(ids) => self.store.remove_players(id, ids).await,
            Mutation::Import(players) => {
                let count = self.store.import_players(id, players).await?;
                info!("Imported {count} players");
                Ok(())
            }
        }
    }

    /// Tell viewers what is on the floor. `resolved` is the outcome the
    /// command just produced, as planned; the re-pulled row may already
    /// have been relisted. Push failures never fail the command; viewers
    /// re-pull anyway.
    async fn push(&self, snapshot: &Snapshot, resolved: Option<&Player>) {
        let shown = snapshot
            .bidding_player()
            .or(resolved)
            .or(snapshot.last_resolved.as_ref())
            .cloned();
        if let Err(e) = self.publisher.publish_current(&self.auction_id, shown).await {
            warn!("Failed to push current item: {e:#}");
        }

        if let Some(resolved) = resolved {
            let message = announcement_for(resolved, &snapshot.teams);
            info!("{message}");
            if let Err(e) = self.publisher.announce(&self.auction_id, message).await {
                warn!("Failed to push announcement: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Turn a command into a store mutation, validated against `snapshot`.
/// Commands that resolve a player also return the resolved record.
fn plan(
    snapshot: &Snapshot,
    command: &Command,
) -> Result<(Mutation, Option<Player>), ValidationError> {
    let max = snapshot.auction.max_team_member;
    let mutation = match command {
        Command::SelectSet { set } => {
            let set = validate_select_set(snapshot, set)?;
            Mutation::SetStatus {
                set_id: set.id.clone(),
                status: SetStatus::Running,
            }
        }
        Command::PickPlayer => {
            let running = snapshot.running_set().ok_or(ValidationError::NoRunningSet)?;
            if let Some(open) = snapshot.bidding_player() {
                return Err(ValidationError::BiddingInProgress(open.name.clone()));
            }
            let by_set = group_by_set(&snapshot.players);
            let player = pick_random_idle(&running.id, &by_set)?;
            info!("Picked {} from set {}", player.name, running.name);
            Mutation::Players(vec![PlayerUpdate {
                id: player.id.clone(),
                status: Some(PlayerStatus::Bidding),
                ..Default::default()
            }])
        }
        Command::PlaceBid { team, amount } => {
            let player = current_player(snapshot)?;
            let standing = standing_for(snapshot, team)?;
            let updated = bid::apply_bid(player, &standing, max, *amount)?;
            if let Some(bid) = updated.leading_bid() {
                info!("{} bids {} on {}", standing.team.name, bid.price, player.name);
            }
            Mutation::Players(vec![PlayerUpdate::bids_only(&updated)])
        }
        Command::UndoBid => {
            let player = current_player(snapshot)?;
            let updated = bid::undo_bid(player)?;
            Mutation::Players(vec![PlayerUpdate::bids_only(&updated)])
        }
        Command::Resolve => {
            let player = current_player(snapshot)?;
            let (updated, outcome) = bid::resolve(player)?;
            match outcome {
                Outcome::Sold { price, .. } => info!("Resolving {}: sold for {price}", player.name),
                Outcome::Unsold => info!("Resolving {}: unsold", player.name),
            }
            let mutation = Mutation::Players(vec![PlayerUpdate::from_player(&updated)]);
            return Ok((mutation, Some(updated)));
        }
        Command::ForceAssign { team, price } => {
            let player = current_player(snapshot)?;
            let standing = standing_for(snapshot, team)?;
            let updated = bid::force_assign(player, &standing, *price, max)?;
            info!("Assigning {} to {} for {price}", player.name, standing.team.name);
            let mutation = Mutation::Players(vec![PlayerUpdate::from_player(&updated)]);
            return Ok((mutation, Some(updated)));
        }
        Command::UpdateSettings(settings) => {
            settings.validate()?;
            let standings = group_by_team(&snapshot.players, &snapshot.teams);
            if let Some(largest) = standings.values().map(TeamStanding::squad_size).max() {
                if largest > settings.max_team_member as usize {
                    return Err(ValidationError::InvalidSettings(format!(
                        "a team already has {largest} players, above the new maximum {}",
                        settings.max_team_member
                    )));
                }
            }
            Mutation::Settings(*settings)
        }
        Command::CreateTeam(team) => {
            if team.name.trim().is_empty() {
                return Err(ValidationError::InvalidSettings("team name is empty".into()));
            }
            if snapshot
                .teams
                .iter()
                .any(|t| t.name.eq_ignore_ascii_case(&team.name))
            {
                return Err(ValidationError::InvalidSettings(format!(
                    "team {} already exists",
                    team.name
                )));
            }
            if team.budget == Some(0) {
                return Err(ValidationError::InvalidSettings("team budget is zero".into()));
            }
            Mutation::CreateTeam(team.clone())
        }
        Command::RemoveTeam { team } => {
            let found = snapshot
                .find_team(team)
                .ok_or_else(|| ValidationError::UnknownTeam(team.clone()))?;
            let involved = snapshot.players.iter().any(|p| {
                p.team_id.as_deref() == Some(found.id.as_str())
                    || (p.status == PlayerStatus::Bidding
                        && p.bids.iter().any(|b| b.team_id == found.id))
            });
            if involved {
                return Err(ValidationError::InUse(found.name.clone()));
            }
            Mutation::RemoveTeam(found.id.clone())
        }
        Command::CreateSet(set) => {
            if set.name.trim().is_empty() {
                return Err(ValidationError::InvalidSettings("set name is empty".into()));
            }
            if set.name.eq_ignore_ascii_case(UNSOLD_SET_NAME) {
                return Err(ValidationError::InvalidSettings(format!(
                    "{UNSOLD_SET_NAME:?} is reserved for leftover players"
                )));
            }
            if snapshot
                .sets
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(&set.name))
            {
                return Err(ValidationError::InvalidSettings(format!(
                    "set {} already exists",
                    set.name
                )));
            }
            Mutation::CreateSet(set.clone())
        }
        Command::RemoveSet { set } => {
            let found = snapshot
                .find_set(set)
                .ok_or_else(|| ValidationError::UnknownSet(set.clone()))?;
            if found.status != SetStatus::Idle || snapshot.players_in_set(&found.id).next().is_some()
            {
                return Err(ValidationError::InUse(found.name.clone()));
            }
            Mutation::RemoveSet(found.id.clone())
        }
        Command::CreatePlayers(players) => {
            check_new_players(snapshot, players)?;
            Mutation::CreatePlayers(players.clone())
        }
        Command::RemovePlayers { player_ids } => {
            for id in player_ids {
                let player = snapshot
                    .player(id)
                    .ok_or_else(|| ValidationError::UnknownPlayer(id.clone()))?;
                if !matches!(player.status, PlayerStatus::Idle | PlayerStatus::Unsold) {
                    return Err(ValidationError::InUse(player.name.clone()));
                }
            }
            Mutation::RemovePlayers(player_ids.clone())
        }
        Command::ImportPlayers(players) => {
            check_new_players(snapshot, players)?;
            Mutation::Import(players.clone())
        }
    };
    Ok((mutation, None))
}

/// The player open for bidding.
fn current_player(snapshot: &Snapshot) -> Result<&Player, ValidationError> {
    if snapshot.running_set().is_none() {
        return Err(ValidationError::NoRunningSet);
    }
    snapshot
        .bidding_player()
        .ok_or(ValidationError::NoPlayerBidding)
}

fn standing_for(snapshot: &Snapshot, team_key: &str) -> Result<TeamStanding, ValidationError> {
    let team = snapshot
        .find_team(team_key)
        .ok_or_else(|| ValidationError::UnknownTeam(team_key.to_string()))?;
    let mut standings = group_by_team(&snapshot.players, &snapshot.teams);
    standings
        .remove(&team.id)
        .ok_or_else(|| ValidationError::UnknownTeam(team_key.to_string()))
}

fn check_new_players(snapshot: &Snapshot, players: &[NewPlayer]) -> Result<(), ValidationError> {
    for player in players {
        if player.name.trim().is_empty() {
            return Err(ValidationError::InvalidSettings("player name is empty".into()));
        }
        let set = snapshot
            .set(&player.set_id)
            .ok_or_else(|| ValidationError::UnknownSet(player.set_id.clone()))?;
        if set.status == SetStatus::Completed {
            return Err(ValidationError::SetNotIdle {
                set: set.name.clone(),
                status: set.status,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gavel_core::auction::{AuctionSet, AuctionSettings, Team};
    use gavel_core::db::Database;
    use gavel_core::protocol::HubMessage;
    use gavel_core::store::StoreResult;
    use gavel_core::ws_server::PushHub;
    use std::sync::{OnceLock, Weak};
    use tokio::sync::broadcast;

    struct Fixture {
        session: Arc<OperatorSession>,
        db: Arc<Database>,
        hub: Arc<PushHub>,
        auction_id: String,
    }

    /// Helper: in-memory auction with teams A (10M) and B (5M) and one set.
    async fn fixture(players: usize) -> Fixture {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let auction = db
            .create_auction(
                "Session Test",
                AuctionSettings {
                    budget: 10_000_000,
                    min_team_member: 1,
                    max_team_member: 5,
                    is_public: true,
                },
            )
            .unwrap();
        let hub = Arc::new(PushHub::new());
        let session = Arc::new(OperatorSession::new(
            auction.id.clone(),
            db.clone(),
            hub.clone(),
        ));

        let applied = |d: Dispatch| assert!(matches!(d, Dispatch::Applied { .. }), "{d:?}");
        applied(
            session
                .dispatch(Command::CreateTeam(NewTeam {
                    name: "A".into(),
                    owner: "owner a".into(),
                    budget: None,
                    logo: None,
                }))
                .await
                .unwrap(),
        );
        applied(
            session
                .dispatch(Command::CreateTeam(NewTeam {
                    name: "B".into(),
                    owner: "owner b".into(),
                    budget: Some(5_000_000),
                    logo: None,
                }))
                .await
                .unwrap(),
        );
        applied(
            session
                .dispatch(Command::CreateSet(NewSet {
                    name: "Marquee".into(),
                    order: None,
                }))
                .await
                .unwrap(),
        );
        let set_id = session.snapshot().unwrap().sets[0].id.clone();
        let new_players = (0..players)
            .map(|i| NewPlayer {
                name: format!("Player {i}"),
                role: None,
                base_price: 1_000_000,
                set_id: set_id.clone(),
            })
            .collect();
        if players > 0 {
            applied(
                session
                    .dispatch(Command::CreatePlayers(new_players))
                    .await
                    .unwrap(),
            );
        }

        Fixture {
            session,
            db,
            hub,
            auction_id: auction.id,
        }
    }

    async fn run(session: &OperatorSession, command: Command) -> Dispatch {
        session.dispatch(command).await.unwrap()
    }

    fn bid(team: &str, amount: Option<u64>) -> Command {
        Command::PlaceBid {
            team: team.into(),
            amount,
        }
    }

    fn rejected(dispatch: Dispatch) -> ValidationError {
        match dispatch {
            Dispatch::Rejected(err) => err,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn selecting_a_set_moves_to_idle() {
        let f = fixture(2).await;
        assert_eq!(f.session.phase(), Phase::NoSet);

        let d = run(&f.session, Command::SelectSet { set: "marquee".into() }).await;
        assert!(matches!(d, Dispatch::Applied { phase: Phase::Idle { .. } }));
    }

    #[tokio::test]
    async fn bidding_out_of_phase_is_rejected_without_store_call() {
        let f = fixture(1).await;
        let before = f.session.snapshot().unwrap().version;

        let err = rejected(run(&f.session, bid("A", None)).await);
        assert!(matches!(err, ValidationError::NotAllowed { .. }));
        assert_eq!(f.session.refresh().await.unwrap().version, before);
    }

    #[tokio::test]
    async fn full_bidding_round_sells_to_last_bidder() {
        let f = fixture(2).await;
        let (mut viewer_rx, _) = f.hub.join(&f.auction_id);
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        let d = run(&f.session, Command::PickPlayer).await;
        let Dispatch::Applied {
            phase: Phase::Bidding { player_id, .. },
        } = d
        else {
            panic!("expected bidding, got {d:?}");
        };

        run(&f.session, bid("A", None)).await;
        run(&f.session, bid("B", None)).await;
        let snapshot = f.session.snapshot().unwrap();
        let prices: Vec<u64> = snapshot
            .player(&player_id)
            .unwrap()
            .bids
            .iter()
            .map(|b| b.price)
            .collect();
        assert_eq!(prices, vec![1_000_000, 1_500_000]);

        let d = run(&f.session, Command::Resolve).await;
        assert!(matches!(d, Dispatch::Applied { phase: Phase::Sold { .. } }));
        let snapshot = f.session.snapshot().unwrap();
        let sold = snapshot.player(&player_id).unwrap();
        let team_b = snapshot.find_team("B").unwrap();
        assert_eq!(sold.status, PlayerStatus::Sold);
        assert_eq!(sold.team_id.as_deref(), Some(team_b.id.as_str()));
        assert_eq!(sold.sold_price, Some(1_500_000));

        let mut saw_announcement = false;
        while let Ok(msg) = viewer_rx.try_recv() {
            if let HubMessage::Announcement { message, .. } = msg {
                assert!(message.contains("sold to B for 1,500,000"), "{message}");
                saw_announcement = true;
            }
        }
        assert!(saw_announcement);
    }

    #[tokio::test]
    async fn consecutive_bid_is_rejected() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        run(&f.session, bid("A", None)).await;

        let err = rejected(run(&f.session, bid("a", None)).await);
        assert_eq!(err, ValidationError::ConsecutiveBid { team: "A".into() });
    }

    #[tokio::test]
    async fn unknown_team_is_rejected() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        let err = rejected(run(&f.session, bid("Nobody", None)).await);
        assert_eq!(err, ValidationError::UnknownTeam("Nobody".into()));
    }

    #[tokio::test]
    async fn jump_bid_below_ladder_is_rejected() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        run(&f.session, bid("A", Some(2_000_000))).await;

        let err = rejected(run(&f.session, bid("B", Some(2_100_000))).await);
        assert_eq!(
            err,
            ValidationError::BelowMinimum {
                offered: 2_100_000,
                minimum: 2_500_000
            }
        );
    }

    #[tokio::test]
    async fn undo_restores_previous_bid_list() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        run(&f.session, bid("A", None)).await;
        let before = f.session.snapshot().unwrap().bidding_player().unwrap().bids.clone();

        run(&f.session, bid("B", None)).await;
        run(&f.session, Command::UndoBid).await;

        let after = f.session.snapshot().unwrap().bidding_player().unwrap().bids.clone();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn last_resolution_completes_the_set() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        run(&f.session, bid("A", None)).await;

        let d = run(&f.session, Command::Resolve).await;
        assert_eq!(
            d,
            Dispatch::Applied {
                phase: Phase::AuctionComplete
            }
        );
        let snapshot = f.session.snapshot().unwrap();
        assert_eq!(snapshot.sets[0].status, SetStatus::Completed);
    }

    #[tokio::test]
    async fn force_assign_skips_the_ladder() {
        let f = fixture(2).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        let d = run(
            &f.session,
            Command::ForceAssign {
                team: "B".into(),
                price: 1_234_567,
            },
        )
        .await;
        assert!(matches!(d, Dispatch::Applied { phase: Phase::Sold { .. } }));
        let snapshot = f.session.snapshot().unwrap();
        assert_eq!(snapshot.last_resolved.unwrap().sold_price, Some(1_234_567));
    }

    #[tokio::test]
    async fn force_assign_beyond_budget_is_rejected() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;
        let err = rejected(
            run(
                &f.session,
                Command::ForceAssign {
                    team: "B".into(),
                    price: 6_000_000,
                },
            )
            .await,
        );
        assert!(matches!(err, ValidationError::InsufficientBudget { .. }));
    }

    #[tokio::test]
    async fn admin_validation() {
        let f = fixture(1).await;
        let err = rejected(
            run(
                &f.session,
                Command::CreateSet(NewSet {
                    name: "UNSOLD".into(),
                    order: None,
                }),
            )
            .await,
        );
        assert!(matches!(err, ValidationError::InvalidSettings(_)));

        let err = rejected(
            run(
                &f.session,
                Command::RemoveSet {
                    set: "Marquee".into(),
                },
            )
            .await,
        );
        assert_eq!(err, ValidationError::InUse("Marquee".into()));

        let err = rejected(
            run(
                &f.session,
                Command::UpdateSettings(AuctionSettings {
                    budget: 0,
                    min_team_member: 1,
                    max_team_member: 5,
                    is_public: true,
                }),
            )
            .await,
        );
        assert!(matches!(err, ValidationError::InvalidSettings(_)));

        let d = run(&f.session, Command::RemoveTeam { team: "b".into() }).await;
        assert!(matches!(d, Dispatch::Applied { .. }));
        assert_eq!(f.session.snapshot().unwrap().teams.len(), 1);
    }

    #[tokio::test]
    async fn second_dispatch_while_in_flight_is_rejected() {
        let f = fixture(0).await;
        let _held = InFlight::acquire(&f.session.in_flight).unwrap();
        assert_eq!(f.session.phase(), Phase::Loading);

        let err = rejected(run(&f.session, Command::PickPlayer).await);
        assert_eq!(err, ValidationError::MutationInFlight);
    }

    #[tokio::test]
    async fn in_flight_flag_clears_after_store_failure() {
        let f = fixture(0).await;
        let orphan = OperatorSession::new("missing", f.db.clone(), f.hub.clone());

        let err = orphan.dispatch(Command::PickPlayer).await.unwrap_err();
        assert!(matches!(err, SessionError::Store(StoreError::NotFound { .. })));
        assert!(!orphan.is_in_flight());
    }

    #[test]
    fn unauthorized_maps_to_reauth() {
        let err = SessionError::from(StoreError::Unauthorized("expired".into()));
        assert!(err.requires_reauth());
        assert!(err.to_string().contains("expired"), "{err}");
        let err = SessionError::from(StoreError::Transport("down".into()));
        assert!(!err.requires_reauth());
    }

    #[tokio::test]
    async fn import_creates_missing_sets() {
        let f = fixture(0).await;
        let rows = gavel_core::import::parse_players_csv(
            "name,role,base_price,set\nVirat,Batter,2000000,Marquee\nJasprit,Bowler,1500000,Bowlers\n"
                .as_bytes(),
        )
        .unwrap();

        let d = f.session.import_rows(&rows).await.unwrap();
        assert!(matches!(d, Dispatch::Applied { .. }));
        let snapshot = f.session.snapshot().unwrap();
        assert_eq!(snapshot.sets.len(), 2);
        assert_eq!(snapshot.players.len(), 2);
        let bowlers = snapshot.find_set("bowlers").unwrap();
        assert_eq!(snapshot.players_in_set(&bowlers.id).count(), 1);
    }

    #[tokio::test]
    async fn import_while_in_flight_is_rejected() {
        let f = fixture(0).await;
        let rows = gavel_core::import::parse_players_csv(
            "name,role,base_price,set\nJasprit,Bowler,1500000,Bowlers\n".as_bytes(),
        )
        .unwrap();
        let _held = InFlight::acquire(&f.session.in_flight).unwrap();

        let err = rejected(f.session.import_rows(&rows).await.unwrap());
        assert_eq!(err, ValidationError::MutationInFlight);
        let snapshot = f.db.load_snapshot(&f.auction_id).unwrap().unwrap();
        assert_eq!(snapshot.sets.len(), 1);
        assert!(snapshot.players.is_empty());
    }

    /// Store that notes, for every call, whether the session held the
    /// in-flight flag at that moment.
    struct WatchedStore {
        inner: Arc<Database>,
        session: OnceLock<Weak<OperatorSession>>,
        held: Mutex<Vec<bool>>,
    }

    impl WatchedStore {
        fn note(&self) {
            let held = self
                .session
                .get()
                .and_then(|s| s.upgrade())
                .is_some_and(|s| s.is_in_flight());
            self.held.lock().unwrap().push(held);
        }
    }

    #[async_trait]
    impl AuctionStore for WatchedStore {
        async fn fetch_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
            self.note();
            self.inner.fetch_snapshot(auction_id).await
        }

        async fn fetch_public_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
            self.note();
            self.inner.fetch_public_snapshot(auction_id).await
        }

        async fn update_auction(
            &self,
            auction_id: &str,
            settings: AuctionSettings,
        ) -> StoreResult<()> {
            self.note();
            self.inner.update_auction(auction_id, settings).await
        }

        async fn update_players(
            &self,
            auction_id: &str,
            updates: Vec<PlayerUpdate>,
        ) -> StoreResult<()> {
            self.note();
            self.inner.update_players(auction_id, updates).await
        }

        async fn update_set_status(
            &self,
            auction_id: &str,
            set_id: &str,
            status: SetStatus,
        ) -> StoreResult<()> {
            self.note();
            self.inner.update_set_status(auction_id, set_id, status).await
        }

        async fn create_team(&self, auction_id: &str, team: NewTeam) -> StoreResult<Team> {
            self.note();
            self.inner.create_team(auction_id, team).await
        }

        async fn remove_team(&self, auction_id: &str, team_id: &str) -> StoreResult<()> {
            self.note();
            self.inner.remove_team(auction_id, team_id).await
        }

        async fn create_set(&self, auction_id: &str, set: NewSet) -> StoreResult<AuctionSet> {
            self.note();
            self.inner.create_set(auction_id, set).await
        }

        async fn remove_set(&self, auction_id: &str, set_id: &str) -> StoreResult<()> {
            self.note();
            self.inner.remove_set(auction_id, set_id).await
        }

        async fn create_players(
            &self,
            auction_id: &str,
            players: Vec<NewPlayer>,
        ) -> StoreResult<Vec<Player>> {
            self.note();
            self.inner.create_players(auction_id, players).await
        }

        async fn remove_players(
            &self,
            auction_id: &str,
            player_ids: Vec<String>,
        ) -> StoreResult<()> {
            self.note();
            self.inner.remove_players(auction_id, player_ids).await
        }

        async fn import_players(
            &self,
            auction_id: &str,
            players: Vec<NewPlayer>,
        ) -> StoreResult<usize> {
            self.note();
            self.inner.import_players(auction_id, players).await
        }
    }

    #[tokio::test]
    async fn import_holds_the_flag_across_every_store_call() {
        let f = fixture(0).await;
        let store = Arc::new(WatchedStore {
            inner: f.db.clone(),
            session: OnceLock::new(),
            held: Mutex::new(Vec::new()),
        });
        let session = Arc::new(OperatorSession::new(
            f.auction_id.clone(),
            store.clone(),
            f.hub.clone(),
        ));
        let _ = store.session.set(Arc::downgrade(&session));
        let rows = gavel_core::import::parse_players_csv(
            "name,role,base_price,set\nVirat,Batter,2000000,Openers\nJasprit,Bowler,1500000,Bowlers\n"
                .as_bytes(),
        )
        .unwrap();

        let d = session.import_rows(&rows).await.unwrap();
        assert!(matches!(d, Dispatch::Applied { .. }), "{d:?}");
        assert!(!session.is_in_flight());

        let held = store.held.lock().unwrap().clone();
        assert!(held.len() >= 5, "{held:?}");
        assert!(held.iter().all(|h| *h), "{held:?}");
        assert_eq!(session.snapshot().unwrap().sets.len(), 3);
    }

    // ------------------------------------------------------------------
    // Exhausted sets and relisting
    // ------------------------------------------------------------------

    /// Marquee is running with its only player already unsold, as left by a
    /// resolve whose completion call never reached the store. Reserves is
    /// still idle.
    async fn exhausted_marquee() -> Fixture {
        let f = fixture(1).await;
        run(
            &f.session,
            Command::CreateSet(NewSet {
                name: "Reserves".into(),
                order: None,
            }),
        )
        .await;
        let snapshot = f.session.snapshot().unwrap();
        let marquee = snapshot.find_set("Marquee").unwrap().id.clone();
        let reserves = snapshot.find_set("Reserves").unwrap().id.clone();
        run(
            &f.session,
            Command::CreatePlayers(vec![NewPlayer {
                name: "Spare".into(),
                role: None,
                base_price: 1_000_000,
                set_id: reserves,
            }]),
        )
        .await;

        f.db.set_set_status(&f.auction_id, &marquee, SetStatus::Running)
            .unwrap();
        let only = snapshot.players_in_set(&marquee).next().unwrap().id.clone();
        f.db.apply_player_updates(
            &f.auction_id,
            &[PlayerUpdate {
                id: only,
                status: Some(PlayerStatus::Unsold),
                ..Default::default()
            }],
        )
        .unwrap();
        f
    }

    #[tokio::test]
    async fn refresh_completes_an_exhausted_set() {
        let f = exhausted_marquee().await;

        let snapshot = f.session.refresh().await.unwrap();
        assert_eq!(
            snapshot.find_set("Marquee").unwrap().status,
            SetStatus::Completed
        );
        assert!(snapshot.running_set().is_none());
        assert!(!f.session.is_in_flight());

        let d = run(&f.session, Command::SelectSet { set: "Reserves".into() }).await;
        assert!(matches!(d, Dispatch::Applied { phase: Phase::Idle { .. } }), "{d:?}");
    }

    #[tokio::test]
    async fn dispatch_completes_an_exhausted_set_before_checking_the_phase() {
        let f = exhausted_marquee().await;

        let d = run(&f.session, Command::SelectSet { set: "Reserves".into() }).await;
        let reserves = f.session.snapshot().unwrap().find_set("Reserves").unwrap().id.clone();
        assert_eq!(d, Dispatch::Applied { phase: Phase::Idle { set_id: reserves } });
        let snapshot = f.session.snapshot().unwrap();
        assert_eq!(
            snapshot.find_set("Marquee").unwrap().status,
            SetStatus::Completed
        );
    }

    #[tokio::test]
    async fn unsold_result_is_announced_before_relisting() {
        let f = fixture(1).await;
        let (mut viewer_rx, _) = f.hub.join(&f.auction_id);
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;

        let d = run(&f.session, Command::Resolve).await;
        assert!(
            matches!(d, Dispatch::Applied { phase: Phase::UnsoldSetCreated { .. } }),
            "{d:?}"
        );
        let snapshot = f.session.snapshot().unwrap();
        assert!(snapshot.last_resolved.is_none());

        let mut announcements = Vec::new();
        while let Ok(msg) = viewer_rx.try_recv() {
            if let HubMessage::Announcement { message, .. } = msg {
                announcements.push(message);
            }
        }
        assert_eq!(announcements, vec!["Player 0 went unsold".to_string()]);

        let (_rx, seed) = f.hub.join(&f.auction_id);
        match seed {
            Some(HubMessage::CurrentItem {
                player: Some(player),
                ..
            }) => assert_eq!(player.status, PlayerStatus::Unsold),
            other => panic!("expected the unsold result, got {other:?}"),
        }

        let d = run(&f.session, Command::SelectSet { set: UNSOLD_SET_NAME.into() }).await;
        assert!(matches!(d, Dispatch::Applied { phase: Phase::Idle { .. } }), "{d:?}");
    }

    #[tokio::test]
    async fn bidding_commands_name_what_is_missing() {
        let f = fixture(1).await;
        let snapshot = f.session.refresh().await.unwrap();
        assert_eq!(
            plan(&snapshot, &Command::Resolve).unwrap_err(),
            ValidationError::NoRunningSet
        );

        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        let snapshot = f.session.snapshot().unwrap();
        assert_eq!(
            plan(&snapshot, &Command::Resolve).unwrap_err(),
            ValidationError::NoPlayerBidding
        );
        assert_eq!(
            plan(&snapshot, &bid("A", None)).unwrap_err(),
            ValidationError::NoPlayerBidding
        );
    }

    #[tokio::test]
    async fn late_viewer_is_seeded_with_the_open_player() {
        let f = fixture(1).await;
        run(&f.session, Command::SelectSet { set: "Marquee".into() }).await;
        run(&f.session, Command::PickPlayer).await;

        let (_rx, seed): (broadcast::Receiver<HubMessage>, _) = f.hub.join(&f.auction_id);
        match seed {
            Some(HubMessage::CurrentItem {
                player: Some(player),
                ..
            }) => assert_eq!(player.status, PlayerStatus::Bidding),
            other => panic!("expected seeded CURRENT_ITEM, got {other:?}"),
        }
    }
}
