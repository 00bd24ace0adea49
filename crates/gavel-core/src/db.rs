// SQLite-backed auction store.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::auction::model::{
    Auction, AuctionSet, AuctionSettings, AuctionStatus, BidEntry, Money, NewPlayer, NewSet,
    NewTeam, Player, PlayerStatus, PlayerUpdate, SetStatus, Snapshot, Team, UNSOLD_SET_NAME,
};
use crate::store::{AuctionStore, StoreError, StoreResult};

/// SQLite persistence for auctions, teams, sets, players and a small
/// key-value table for session state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS auctions (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                status           TEXT NOT NULL,
                budget           INTEGER NOT NULL,
                min_team_member  INTEGER NOT NULL,
                max_team_member  INTEGER NOT NULL,
                is_public        INTEGER NOT NULL,
                version          INTEGER NOT NULL DEFAULT 0,
                last_resolved_id TEXT,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS teams (
                id         TEXT PRIMARY KEY,
                auction_id TEXT NOT NULL REFERENCES auctions(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                owner      TEXT NOT NULL,
                budget     INTEGER NOT NULL,
                logo       TEXT
            );

            CREATE TABLE IF NOT EXISTS sets (
                id         TEXT PRIMARY KEY,
                auction_id TEXT NOT NULL REFERENCES auctions(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                ord        INTEGER NOT NULL,
                status     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS players (
                id         TEXT PRIMARY KEY,
                auction_id TEXT NOT NULL REFERENCES auctions(id) ON DELETE CASCADE,
                set_id     TEXT NOT NULL REFERENCES sets(id),
                name       TEXT NOT NULL,
                role       TEXT,
                base_price INTEGER NOT NULL,
                status     TEXT NOT NULL,
                team_id    TEXT,
                sold_price INTEGER,
                bids       TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS session_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_players_auction ON players(auction_id);
            CREATE INDEX IF NOT EXISTS idx_sets_auction ON sets(auction_id);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Ids
    // ------------------------------------------------------------------

    /// Generate a new auction id based on the current UTC timestamp.
    ///
    /// Format: `auction_YYYYMMDD_HHMMSS_SSS`.
    pub fn generate_auction_id() -> String {
        let now = chrono::Utc::now();
        now.format("auction_%Y%m%d_%H%M%S_%3f").to_string()
    }

    /// Random 24-character hex id for teams, sets and players.
    fn generate_id() -> String {
        let bytes: [u8; 12] = rand::thread_rng().gen();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    // ------------------------------------------------------------------
    // Auctions
    // ------------------------------------------------------------------

    /// Create a new auction in `setup` state.
    pub fn create_auction(&self, name: &str, settings: AuctionSettings) -> anyhow::Result<Auction> {
        let auction = Auction {
            id: Self::generate_auction_id(),
            name: name.to_string(),
            status: AuctionStatus::Setup,
            budget: settings.budget,
            min_team_member: settings.min_team_member,
            max_team_member: settings.max_team_member,
            is_public: settings.is_public,
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO auctions (id, name, status, budget, min_team_member, max_team_member, is_public)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                auction.id,
                auction.name,
                auction_status_str(auction.status),
                sql_money(auction.budget),
                auction.min_team_member,
                auction.max_team_member,
                auction.is_public,
            ],
        )
        .context("failed to create auction")?;
        info!("Created auction {} ({})", auction.name, auction.id);
        Ok(auction)
    }

    /// Returns `true` if an auction with this id exists.
    pub fn auction_exists(&self, auction_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM auctions WHERE id = ?1)",
                params![auction_id],
                |row| row.get(0),
            )
            .context("failed to check auction existence")?;
        Ok(exists)
    }

    /// Load the full snapshot of one auction. `None` if it does not exist.
    pub fn load_snapshot(&self, auction_id: &str) -> anyhow::Result<Option<Snapshot>> {
        let conn = self.conn();

        let header = conn
            .query_row(
                "SELECT id, name, status, budget, min_team_member, max_team_member, is_public,
                        version, last_resolved_id
                 FROM auctions WHERE id = ?1",
                params![auction_id],
                |row| {
                    let status: String = row.get(2)?;
                    let auction = Auction {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: parse_auction_status(&status),
                        budget: row_money(row.get(3)?),
                        min_team_member: row.get(4)?,
                        max_team_member: row.get(5)?,
                        is_public: row.get(6)?,
                    };
                    let version: i64 = row.get(7)?;
                    let last_resolved_id: Option<String> = row.get(8)?;
                    Ok((auction, version, last_resolved_id))
                },
            )
            .optional()
            .context("failed to load auction")?;

        let Some((auction, version, last_resolved_id)) = header else {
            return Ok(None);
        };

        let teams = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, owner, budget, logo FROM teams
                     WHERE auction_id = ?1 ORDER BY rowid",
                )
                .context("failed to prepare teams query")?;
            let rows = stmt
                .query_map(params![auction_id], |row| {
                    Ok(Team {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        owner: row.get(2)?,
                        budget: row_money(row.get(3)?),
                        logo: row.get(4)?,
                    })
                })
                .context("failed to query teams")?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("failed to map team rows")?
        };

        let sets = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, ord, status FROM sets
                     WHERE auction_id = ?1 ORDER BY ord, rowid",
                )
                .context("failed to prepare sets query")?;
            let rows = stmt
                .query_map(params![auction_id], |row| {
                    let status: String = row.get(3)?;
                    Ok(AuctionSet {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        order: row.get(2)?,
                        status: parse_set_status(&status),
                    })
                })
                .context("failed to query sets")?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("failed to map set rows")?
        };

        let players = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, role, base_price, set_id, status, team_id, sold_price, bids
                     FROM players WHERE auction_id = ?1 ORDER BY rowid",
                )
                .context("failed to prepare players query")?;
            let rows = stmt
                .query_map(params![auction_id], player_from_row)
                .context("failed to query players")?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("failed to map player rows")?
        };

        let last_resolved = last_resolved_id.and_then(|id| {
            players
                .iter()
                .find(|p| p.id == id && p.status.is_terminal())
                .cloned()
        });

        Ok(Some(Snapshot {
            version: u64::try_from(version).unwrap_or(0),
            auction,
            teams,
            players,
            sets,
            last_resolved,
        }))
    }

    fn require_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
        self.load_snapshot(auction_id)?
            .ok_or_else(|| StoreError::NotFound {
                kind: "auction",
                id: auction_id.to_string(),
            })
    }

    /// Apply new settings. Team budgets that matched the old auction budget
    /// follow the new one.
    pub fn update_settings(&self, auction_id: &str, settings: AuctionSettings) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let old_budget: Option<i64> = tx
            .query_row(
                "SELECT budget FROM auctions WHERE id = ?1",
                params![auction_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read auction budget")?;
        let Some(old_budget) = old_budget else {
            return Err(StoreError::NotFound {
                kind: "auction",
                id: auction_id.to_string(),
            });
        };

        tx.execute(
            "UPDATE auctions SET budget = ?2, min_team_member = ?3, max_team_member = ?4, is_public = ?5
             WHERE id = ?1",
            params![
                auction_id,
                sql_money(settings.budget),
                settings.min_team_member,
                settings.max_team_member,
                settings.is_public,
            ],
        )
        .context("failed to update auction settings")?;
        tx.execute(
            "UPDATE teams SET budget = ?3 WHERE auction_id = ?1 AND budget = ?2",
            params![auction_id, old_budget, sql_money(settings.budget)],
        )
        .context("failed to carry budget over to teams")?;
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit settings update")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Apply a batch of player updates in one transaction.
    pub fn apply_player_updates(&self, auction_id: &str, updates: &[PlayerUpdate]) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        for update in updates {
            let current: Option<Player> = tx
                .query_row(
                    "SELECT id, name, role, base_price, set_id, status, team_id, sold_price, bids
                     FROM players WHERE id = ?1 AND auction_id = ?2",
                    params![update.id, auction_id],
                    player_from_row,
                )
                .optional()
                .context("failed to load player for update")?;
            let Some(mut player) = current else {
                return Err(StoreError::NotFound {
                    kind: "player",
                    id: update.id.clone(),
                });
            };
            let old_status = player.status;

            if let Some(status) = update.status {
                if old_status.is_terminal() && status.is_open() {
                    return Err(StoreError::Conflict(format!(
                        "player {} is already {old_status}",
                        player.name
                    )));
                }
                player.status = status;
            }
            if let Some(bids) = &update.bids {
                player.bids = bids.clone();
            }
            if let Some(team_id) = &update.team_id {
                player.team_id = team_id.clone();
            }
            if let Some(sold_price) = update.sold_price {
                player.sold_price = sold_price;
            }
            if let Some(base_price) = update.base_price {
                player.base_price = base_price;
            }
            if let Some(set_id) = &update.set_id {
                player.set_id = set_id.clone();
            }

            let bids_json =
                serde_json::to_string(&player.bids).context("failed to serialize bids")?;
            tx.execute(
                "UPDATE players SET status = ?2, bids = ?3, team_id = ?4, sold_price = ?5,
                        base_price = ?6, set_id = ?7
                 WHERE id = ?1",
                params![
                    player.id,
                    player_status_str(player.status),
                    bids_json,
                    player.team_id,
                    player.sold_price.map(sql_money),
                    sql_money(player.base_price),
                    player.set_id,
                ],
            )
            .context("failed to update player")?;

            if player.status == PlayerStatus::Bidding && old_status != PlayerStatus::Bidding {
                tx.execute(
                    "UPDATE auctions SET last_resolved_id = NULL WHERE id = ?1",
                    params![auction_id],
                )
                .context("failed to clear last resolved player")?;
            } else if player.status.is_terminal() && old_status.is_open() {
                tx.execute(
                    "UPDATE auctions SET last_resolved_id = ?2 WHERE id = ?1",
                    params![auction_id, player.id],
                )
                .context("failed to record last resolved player")?;
            }
            debug!("Updated player {} ({})", player.name, player.status);
        }

        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit player updates")?;
        Ok(())
    }

    /// Insert players in one transaction, returning the stored records.
    pub fn insert_players(&self, auction_id: &str, players: &[NewPlayer]) -> StoreResult<Vec<Player>> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin import transaction")?;
        let mut created = Vec::with_capacity(players.len());

        for new in players {
            let set_exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sets WHERE id = ?1 AND auction_id = ?2)",
                    params![new.set_id, auction_id],
                    |row| row.get(0),
                )
                .context("failed to check set")?;
            if !set_exists {
                return Err(StoreError::NotFound {
                    kind: "set",
                    id: new.set_id.clone(),
                });
            }

            let player = Player {
                id: Self::generate_id(),
                name: new.name.clone(),
                role: new.role.clone(),
                base_price: new.base_price,
                set_id: new.set_id.clone(),
                status: PlayerStatus::Idle,
                team_id: None,
                sold_price: None,
                bids: Vec::new(),
            };
            tx.execute(
                "INSERT INTO players (id, auction_id, set_id, name, role, base_price, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    player.id,
                    auction_id,
                    player.set_id,
                    player.name,
                    player.role,
                    sql_money(player.base_price),
                    player_status_str(player.status),
                ],
            )
            .context("failed to insert player")?;
            created.push(player);
        }

        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit player insert")?;
        Ok(created)
    }

    /// Delete players that have not been auctioned yet.
    pub fn delete_players(&self, auction_id: &str, player_ids: &[String]) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        for id in player_ids {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM players WHERE id = ?1 AND auction_id = ?2",
                    params![id, auction_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read player status")?;
            match status.as_deref().map(parse_player_status) {
                None => {
                    return Err(StoreError::NotFound {
                        kind: "player",
                        id: id.clone(),
                    })
                }
                Some(PlayerStatus::Idle) | Some(PlayerStatus::Unsold) => {}
                Some(other) => {
                    return Err(StoreError::Conflict(format!(
                        "player {id} is {other} and cannot be removed"
                    )))
                }
            }
            tx.execute("DELETE FROM players WHERE id = ?1", params![id])
                .context("failed to delete player")?;
        }
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit player removal")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teams
    // ------------------------------------------------------------------

    pub fn insert_team(&self, auction_id: &str, new: &NewTeam) -> StoreResult<Team> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let budget: Option<i64> = tx
            .query_row(
                "SELECT budget FROM auctions WHERE id = ?1",
                params![auction_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read auction budget")?;
        let Some(budget) = budget else {
            return Err(StoreError::NotFound {
                kind: "auction",
                id: auction_id.to_string(),
            });
        };

        let team = Team {
            id: Self::generate_id(),
            name: new.name.clone(),
            owner: new.owner.clone(),
            budget: new.budget.unwrap_or_else(|| row_money(budget)),
            logo: new.logo.clone(),
        };
        tx.execute(
            "INSERT INTO teams (id, auction_id, name, owner, budget, logo)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                team.id,
                auction_id,
                team.name,
                team.owner,
                sql_money(team.budget),
                team.logo
            ],
        )
        .context("failed to insert team")?;
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit team insert")?;
        Ok(team)
    }

    /// Delete a team that has neither bought a player nor bid on the one
    /// currently open.
    pub fn delete_team(&self, auction_id: &str, team_id: &str) -> StoreResult<()> {
        let snapshot = self.require_snapshot(auction_id)?;
        if snapshot.team(team_id).is_none() {
            return Err(StoreError::NotFound {
                kind: "team",
                id: team_id.to_string(),
            });
        }
        let involved = snapshot.players.iter().any(|p| {
            p.team_id.as_deref() == Some(team_id)
                || (p.status == PlayerStatus::Bidding && p.bids.iter().any(|b| b.team_id == team_id))
        });
        if involved {
            return Err(StoreError::Conflict(format!(
                "team {team_id} has players or live bids"
            )));
        }

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "DELETE FROM teams WHERE id = ?1 AND auction_id = ?2",
            params![team_id, auction_id],
        )
        .context("failed to delete team")?;
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit team removal")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    pub fn insert_set(&self, auction_id: &str, new: &NewSet) -> StoreResult<AuctionSet> {
        if !self.auction_exists(auction_id)? {
            return Err(StoreError::NotFound {
                kind: "auction",
                id: auction_id.to_string(),
            });
        }
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        let order = match new.order {
            Some(order) => order,
            None => next_set_order(&tx, auction_id)?,
        };
        let set = AuctionSet {
            id: Self::generate_id(),
            name: new.name.clone(),
            order,
            status: SetStatus::Idle,
        };
        tx.execute(
            "INSERT INTO sets (id, auction_id, name, ord, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![set.id, auction_id, set.name, set.order, set_status_str(set.status)],
        )
        .context("failed to insert set")?;
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit set insert")?;
        Ok(set)
    }

    /// Delete an idle set that holds no players.
    pub fn delete_set(&self, auction_id: &str, set_id: &str) -> StoreResult<()> {
        let snapshot = self.require_snapshot(auction_id)?;
        let Some(set) = snapshot.set(set_id) else {
            return Err(StoreError::NotFound {
                kind: "set",
                id: set_id.to_string(),
            });
        };
        if set.status != SetStatus::Idle {
            return Err(StoreError::Conflict(format!("set {} is not idle", set.name)));
        }
        if snapshot.players_in_set(set_id).next().is_some() {
            return Err(StoreError::Conflict(format!("set {} still has players", set.name)));
        }

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute("DELETE FROM sets WHERE id = ?1", params![set_id])
            .context("failed to delete set")?;
        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit set removal")?;
        Ok(())
    }

    /// Move a set through its lifecycle.
    ///
    /// Starting a set requires it to be idle with no other set running and
    /// moves the auction to `running`. Completing the last ordinary set
    /// relists leftover unsold players into a fresh `unsold` set; completing
    /// with nothing left over, or completing the unsold set, completes the
    /// auction.
    pub fn set_set_status(&self, auction_id: &str, set_id: &str, status: SetStatus) -> StoreResult<()> {
        let snapshot = self.require_snapshot(auction_id)?;
        let Some(set) = snapshot.set(set_id).cloned() else {
            return Err(StoreError::NotFound {
                kind: "set",
                id: set_id.to_string(),
            });
        };

        match status {
            SetStatus::Running => {
                if let Some(running) = snapshot.running_set() {
                    return Err(StoreError::Conflict(format!(
                        "set {} is already running",
                        running.name
                    )));
                }
                if set.status != SetStatus::Idle {
                    return Err(StoreError::Conflict(format!("set {} is not idle", set.name)));
                }
            }
            SetStatus::Completed => {
                if snapshot.players_in_set(set_id).any(|p| p.status.is_open()) {
                    return Err(StoreError::Conflict(format!(
                        "set {} still has players to auction",
                        set.name
                    )));
                }
            }
            SetStatus::Idle => {
                return Err(StoreError::Conflict("sets cannot return to idle".into()));
            }
        }

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "UPDATE sets SET status = ?2 WHERE id = ?1",
            params![set_id, set_status_str(status)],
        )
        .context("failed to update set status")?;

        if status == SetStatus::Running {
            tx.execute(
                "UPDATE auctions SET status = ?2 WHERE id = ?1 AND status = ?3",
                params![
                    auction_id,
                    auction_status_str(AuctionStatus::Running),
                    auction_status_str(AuctionStatus::Setup)
                ],
            )
            .context("failed to mark auction running")?;
            info!("Set {} started", set.name);
        } else {
            info!("Set {} completed", set.name);
            after_set_completed(&tx, auction_id, &set)?;
        }

        bump_version(&tx, auction_id)?;
        tx.commit().context("failed to commit set status")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session state (key-value)
    // ------------------------------------------------------------------

    /// Persist an arbitrary JSON value under `key`. Uses INSERT OR REPLACE so
    /// repeated saves overwrite the previous value.
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let conn = self.conn();
        let json_str =
            serde_json::to_string(value).context("failed to serialize state value")?;
        conn.execute(
            "INSERT OR REPLACE INTO session_state (key, value) VALUES (?1, ?2)",
            params![key, json_str],
        )
        .context("failed to save state")?;
        Ok(())
    }

    /// Load a previously saved JSON value by `key`. Returns `None` if the key
    /// does not exist.
    pub fn load_state(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.conn();
        let json_str: Option<String> = conn
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query session state")?;
        json_str
            .map(|s| serde_json::from_str(&s).context("failed to deserialize state value"))
            .transpose()
    }

    const CURRENT_AUCTION_KEY: &'static str = "current_auction_id";

    /// The auction the console was last driving, if any.
    pub fn get_current_auction_id(&self) -> anyhow::Result<Option<String>> {
        let value = self.load_state(Self::CURRENT_AUCTION_KEY)?;
        Ok(value.and_then(|v| v.as_str().map(|s| s.to_string())))
    }

    pub fn set_current_auction_id(&self, auction_id: &str) -> anyhow::Result<()> {
        self.save_state(
            Self::CURRENT_AUCTION_KEY,
            &serde_json::Value::String(auction_id.to_string()),
        )
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
impl AuctionStore for Database {
    async fn fetch_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
        self.require_snapshot(auction_id)
    }

    async fn fetch_public_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
        let snapshot = self.require_snapshot(auction_id)?;
        if !snapshot.auction.is_public {
            return Err(StoreError::Unauthorized(format!(
                "auction {auction_id} is not public"
            )));
        }
        Ok(snapshot)
    }

    async fn update_auction(&self, auction_id: &str, settings: AuctionSettings) -> StoreResult<()> {
        self.update_settings(auction_id, settings)
    }

    async fn update_players(&self, auction_id: &str, updates: Vec<PlayerUpdate>) -> StoreResult<()> {
        self.apply_player_updates(auction_id, &updates)
    }

    async fn update_set_status(
        &self,
        auction_id: &str,
        set_id: &str,
        status: SetStatus,
    ) -> StoreResult<()> {
        self.set_set_status(auction_id, set_id, status)
    }

    async fn create_team(&self, auction_id: &str, team: NewTeam) -> StoreResult<Team> {
        self.insert_team(auction_id, &team)
    }

    async fn remove_team(&self, auction_id: &str, team_id: &str) -> StoreResult<()> {
        self.delete_team(auction_id, team_id)
    }

    async fn create_set(&self, auction_id: &str, set: NewSet) -> StoreResult<AuctionSet> {
        self.insert_set(auction_id, &set)
    }

    async fn remove_set(&self, auction_id: &str, set_id: &str) -> StoreResult<()> {
        self.delete_set(auction_id, set_id)
    }

    async fn create_players(&self, auction_id: &str, players: Vec<NewPlayer>) -> StoreResult<Vec<Player>> {
        self.insert_players(auction_id, &players)
    }

    async fn remove_players(&self, auction_id: &str, player_ids: Vec<String>) -> StoreResult<()> {
        self.delete_players(auction_id, &player_ids)
    }

    async fn import_players(&self, auction_id: &str, players: Vec<NewPlayer>) -> StoreResult<usize> {
        let created = self.insert_players(auction_id, &players)?;
        info!("Imported {} players into auction {}", created.len(), auction_id);
        Ok(created.len())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bump_version(tx: &Transaction<'_>, auction_id: &str) -> anyhow::Result<()> {
    let changed = tx
        .execute(
            "UPDATE auctions SET version = version + 1 WHERE id = ?1",
            params![auction_id],
        )
        .context("failed to bump snapshot version")?;
    if changed == 0 {
        return Err(anyhow!("auction {auction_id} disappeared mid-update"));
    }
    Ok(())
}

fn next_set_order(tx: &Transaction<'_>, auction_id: &str) -> anyhow::Result<u32> {
    let max: Option<u32> = tx
        .query_row(
            "SELECT MAX(ord) FROM sets WHERE auction_id = ?1",
            params![auction_id],
            |row| row.get(0),
        )
        .context("failed to read set order")?;
    Ok(max.map(|m| m + 1).unwrap_or(1))
}

/// Second-pass bookkeeping after `set` completed.
fn after_set_completed(tx: &Transaction<'_>, auction_id: &str, set: &AuctionSet) -> anyhow::Result<()> {
    let complete_auction = |tx: &Transaction<'_>| -> anyhow::Result<()> {
        tx.execute(
            "UPDATE auctions SET status = ?2 WHERE id = ?1",
            params![auction_id, auction_status_str(AuctionStatus::Completed)],
        )
        .context("failed to mark auction completed")?;
        info!("Auction {} completed", auction_id);
        Ok(())
    };

    if set.is_unsold() {
        return complete_auction(tx);
    }

    let open_ordinary: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM sets
             WHERE auction_id = ?1 AND lower(name) != ?2 AND status != ?3",
            params![
                auction_id,
                UNSOLD_SET_NAME,
                set_status_str(SetStatus::Completed)
            ],
            |row| row.get(0),
        )
        .context("failed to count open sets")?;
    if open_ordinary > 0 {
        return Ok(());
    }

    let has_unsold_set: bool = tx
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sets WHERE auction_id = ?1 AND lower(name) = ?2)",
            params![auction_id, UNSOLD_SET_NAME],
            |row| row.get(0),
        )
        .context("failed to look up unsold set")?;
    if has_unsold_set {
        return Ok(());
    }

    let leftovers: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM players WHERE auction_id = ?1 AND status = ?2",
            params![auction_id, player_status_str(PlayerStatus::Unsold)],
            |row| row.get(0),
        )
        .context("failed to count unsold players")?;
    if leftovers == 0 {
        return complete_auction(tx);
    }

    let unsold_set_id = Database::generate_id();
    let order = next_set_order(tx, auction_id)?;
    tx.execute(
        "INSERT INTO sets (id, auction_id, name, ord, status) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            unsold_set_id,
            auction_id,
            UNSOLD_SET_NAME,
            order,
            set_status_str(SetStatus::Idle)
        ],
    )
    .context("failed to create unsold set")?;
    tx.execute(
        "UPDATE players SET set_id = ?2, status = ?3, bids = '[]', team_id = NULL, sold_price = NULL
         WHERE auction_id = ?1 AND status = ?4",
        params![
            auction_id,
            unsold_set_id,
            player_status_str(PlayerStatus::Idle),
            player_status_str(PlayerStatus::Unsold)
        ],
    )
    .context("failed to relist unsold players")?;
    tx.execute(
        "UPDATE auctions SET last_resolved_id = NULL WHERE id = ?1",
        params![auction_id],
    )
    .context("failed to clear last resolved player")?;
    info!(
        "Created unsold set with {} leftover players for auction {}",
        leftovers, auction_id
    );
    Ok(())
}

fn player_from_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    let status: String = row.get(5)?;
    let sold_price: Option<i64> = row.get(7)?;
    let bids_json: String = row.get(8)?;
    let bids: Vec<BidEntry> = serde_json::from_str(&bids_json).unwrap_or_default();
    Ok(Player {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        base_price: row_money(row.get(3)?),
        set_id: row.get(4)?,
        status: parse_player_status(&status),
        team_id: row.get(6)?,
        sold_price: sold_price.map(row_money),
        bids,
    })
}

fn sql_money(amount: Money) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

fn row_money(value: i64) -> Money {
    Money::try_from(value).unwrap_or(0)
}

fn auction_status_str(status: AuctionStatus) -> &'static str {
    match status {
        AuctionStatus::Setup => "setup",
        AuctionStatus::Running => "running",
        AuctionStatus::Completed => "completed",
    }
}

fn parse_auction_status(s: &str) -> AuctionStatus {
    match s {
        "running" => AuctionStatus::Running,
        "completed" => AuctionStatus::Completed,
        _ => AuctionStatus::Setup,
    }
}

fn set_status_str(status: SetStatus) -> &'static str {
    match status {
        SetStatus::Idle => "idle",
        SetStatus::Running => "running",
        SetStatus::Completed => "completed",
    }
}

fn parse_set_status(s: &str) -> SetStatus {
    match s {
        "running" => SetStatus::Running,
        "completed" => SetStatus::Completed,
        _ => SetStatus::Idle,
    }
}

fn player_status_str(status: PlayerStatus) -> &'static str {
    match status {
        PlayerStatus::Idle => "idle",
        PlayerStatus::Bidding => "bidding",
        PlayerStatus::Sold => "sold",
        PlayerStatus::Unsold => "unsold",
    }
}

fn parse_player_status(s: &str) -> PlayerStatus {
    match s {
        "bidding" => PlayerStatus::Bidding,
        "sold" => PlayerStatus::Sold,
        "unsold" => PlayerStatus::Unsold,
        _ => PlayerStatus::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    fn settings() -> AuctionSettings {
        AuctionSettings {
            budget: 100_000_000,
            min_team_member: 11,
            max_team_member: 15,
            is_public: true,
        }
    }

    /// Helper: an auction with one set of `n` players and two teams.
    fn seeded(db: &Database, n: usize) -> (String, AuctionSet) {
        let auction = db.create_auction("Test Auction", settings()).unwrap();
        let set = db
            .insert_set(
                &auction.id,
                &NewSet {
                    name: "Marquee".into(),
                    order: None,
                },
            )
            .unwrap();
        for name in ["Alpha", "Beta"] {
            db.insert_team(
                &auction.id,
                &NewTeam {
                    name: name.into(),
                    owner: format!("{name} owner"),
                    budget: None,
                    logo: None,
                },
            )
            .unwrap();
        }
        let players: Vec<NewPlayer> = (0..n)
            .map(|i| NewPlayer {
                name: format!("Player {i}"),
                role: None,
                base_price: 1_000_000,
                set_id: set.id.clone(),
            })
            .collect();
        db.insert_players(&auction.id, &players).unwrap();
        (auction.id, set)
    }

    fn resolve_update(player: &Player, status: PlayerStatus, team: Option<&str>) -> PlayerUpdate {
        PlayerUpdate {
            id: player.id.clone(),
            status: Some(status),
            team_id: Some(team.map(|t| t.to_string())),
            sold_price: Some(team.map(|_| 1_000_000)),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Schema / open
    // ------------------------------------------------------------------

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["auctions", "players", "session_state", "sets", "teams"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    #[test]
    fn snapshot_round_trip() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 3);

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.auction.name, "Test Auction");
        assert_eq!(snapshot.auction.status, AuctionStatus::Setup);
        assert_eq!(snapshot.teams.len(), 2);
        assert_eq!(snapshot.teams[0].name, "Alpha");
        assert_eq!(snapshot.teams[0].budget, 100_000_000);
        assert_eq!(snapshot.sets, vec![set]);
        assert_eq!(snapshot.players.len(), 3);
        assert_eq!(snapshot.players[0].name, "Player 0");
        assert!(snapshot.players.iter().all(|p| p.status == PlayerStatus::Idle));
        assert!(snapshot.last_resolved.is_none());
    }

    #[test]
    fn missing_auction_is_none() {
        let db = test_db();
        assert!(db.load_snapshot("nope").unwrap().is_none());
        assert!(matches!(
            db.require_snapshot("nope"),
            Err(StoreError::NotFound { kind: "auction", .. })
        ));
    }

    #[test]
    fn every_mutation_bumps_the_version() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 1);
        let v1 = db.load_snapshot(&auction_id).unwrap().unwrap().version;

        db.update_settings(&auction_id, settings()).unwrap();
        let v2 = db.load_snapshot(&auction_id).unwrap().unwrap().version;
        assert!(v2 > v1);
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    #[test]
    fn bids_persist_as_ordered_list() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 1);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let player = &snapshot.players[0];

        let bids = vec![
            BidEntry {
                team_id: snapshot.teams[0].id.clone(),
                price: 1_000_000,
            },
            BidEntry {
                team_id: snapshot.teams[1].id.clone(),
                price: 1_500_000,
            },
        ];
        db.apply_player_updates(
            &auction_id,
            &[PlayerUpdate {
                id: player.id.clone(),
                status: Some(PlayerStatus::Bidding),
                bids: Some(bids.clone()),
                ..Default::default()
            }],
        )
        .unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.players[0].bids, bids);
        assert_eq!(snapshot.players[0].status, PlayerStatus::Bidding);
    }

    #[test]
    fn resolving_records_and_picking_clears_last_resolved() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 2);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let (first, second) = (&snapshot.players[0], &snapshot.players[1]);

        db.apply_player_updates(
            &auction_id,
            &[resolve_update(first, PlayerStatus::Unsold, None)],
        )
        .unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.last_resolved.as_ref().unwrap().id, first.id);

        db.apply_player_updates(
            &auction_id,
            &[PlayerUpdate {
                id: second.id.clone(),
                status: Some(PlayerStatus::Bidding),
                ..Default::default()
            }],
        )
        .unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert!(snapshot.last_resolved.is_none());
    }

    #[test]
    fn terminal_player_cannot_reopen() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 1);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let player = &snapshot.players[0];
        db.apply_player_updates(
            &auction_id,
            &[resolve_update(player, PlayerStatus::Unsold, None)],
        )
        .unwrap();

        let err = db
            .apply_player_updates(
                &auction_id,
                &[PlayerUpdate {
                    id: player.id.clone(),
                    status: Some(PlayerStatus::Bidding),
                    ..Default::default()
                }],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn update_of_unknown_player_is_not_found() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 0);
        let err = db
            .apply_player_updates(
                &auction_id,
                &[PlayerUpdate {
                    id: "ghost".into(),
                    ..Default::default()
                }],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "player", .. }));
    }

    #[test]
    fn insert_player_into_unknown_set_fails() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 0);
        let err = db
            .insert_players(
                &auction_id,
                &[NewPlayer {
                    name: "Stray".into(),
                    role: None,
                    base_price: 1,
                    set_id: "nope".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "set", .. }));
    }

    #[test]
    fn sold_player_cannot_be_removed() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 1);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let team_id = snapshot.teams[0].id.clone();
        let player = &snapshot.players[0];
        db.apply_player_updates(
            &auction_id,
            &[resolve_update(player, PlayerStatus::Sold, Some(&team_id))],
        )
        .unwrap();

        assert!(matches!(
            db.delete_players(&auction_id, &[player.id.clone()]),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.delete_team(&auction_id, &team_id),
            Err(StoreError::Conflict(_))
        ));
    }

    // ------------------------------------------------------------------
    // Settings and teams
    // ------------------------------------------------------------------

    #[test]
    fn budget_change_follows_default_team_budgets() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 0);
        let custom = db
            .insert_team(
                &auction_id,
                &NewTeam {
                    name: "Gamma".into(),
                    owner: "owner".into(),
                    budget: Some(42_000_000),
                    logo: None,
                },
            )
            .unwrap();

        db.update_settings(
            &auction_id,
            AuctionSettings {
                budget: 80_000_000,
                ..settings()
            },
        )
        .unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.auction.budget, 80_000_000);
        assert_eq!(snapshot.team(&snapshot.teams[0].id).unwrap().budget, 80_000_000);
        assert_eq!(snapshot.team(&custom.id).unwrap().budget, 42_000_000);
    }

    #[test]
    fn idle_team_can_be_removed() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 0);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        db.delete_team(&auction_id, &snapshot.teams[1].id).unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.teams.len(), 1);
    }

    // ------------------------------------------------------------------
    // Set lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn starting_a_set_runs_the_auction() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.auction.status, AuctionStatus::Running);
        assert_eq!(snapshot.running_set().unwrap().id, set.id);
    }

    #[test]
    fn only_one_set_may_run() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        let other = db
            .insert_set(
                &auction_id,
                &NewSet {
                    name: "Bowlers".into(),
                    order: None,
                },
            )
            .unwrap();
        assert_eq!(other.order, 2);

        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();
        assert!(matches!(
            db.set_set_status(&auction_id, &other.id, SetStatus::Running),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn set_with_open_players_cannot_complete() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();
        assert!(matches!(
            db.set_set_status(&auction_id, &set.id, SetStatus::Completed),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn completing_last_set_relists_unsold_players() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 3);
        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let team_id = snapshot.teams[0].id.clone();
        db.apply_player_updates(
            &auction_id,
            &[
                resolve_update(&snapshot.players[0], PlayerStatus::Sold, Some(&team_id)),
                resolve_update(&snapshot.players[1], PlayerStatus::Sold, Some(&team_id)),
                resolve_update(&snapshot.players[2], PlayerStatus::Unsold, None),
            ],
        )
        .unwrap();

        db.set_set_status(&auction_id, &set.id, SetStatus::Completed).unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let unsold = snapshot.unsold_set().expect("unsold set should exist");
        assert_eq!(unsold.status, SetStatus::Idle);
        assert_eq!(unsold.order, 2);
        let relisted: Vec<&Player> = snapshot.players_in_set(&unsold.id).collect();
        assert_eq!(relisted.len(), 1);
        assert_eq!(relisted[0].status, PlayerStatus::Idle);
        assert!(relisted[0].bids.is_empty());
        assert_eq!(snapshot.auction.status, AuctionStatus::Running);
    }

    #[test]
    fn relisting_forgets_the_last_resolved_player() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        db.apply_player_updates(
            &auction_id,
            &[resolve_update(&snapshot.players[0], PlayerStatus::Unsold, None)],
        )
        .unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(
            snapshot.last_resolved.as_ref().map(|p| p.status),
            Some(PlayerStatus::Unsold)
        );

        db.set_set_status(&auction_id, &set.id, SetStatus::Completed).unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert_eq!(snapshot.players[0].status, PlayerStatus::Idle);
        assert!(snapshot.last_resolved.is_none());
    }

    #[test]
    fn last_resolved_must_still_be_terminal() {
        let db = test_db();
        let (auction_id, _) = seeded(&db, 1);
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        db.conn()
            .execute(
                "UPDATE auctions SET last_resolved_id = ?2 WHERE id = ?1",
                params![auction_id, snapshot.players[0].id],
            )
            .unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert!(snapshot.last_resolved.is_none());
    }

    #[test]
    fn completing_last_set_without_leftovers_completes_auction() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        db.set_set_status(&auction_id, &set.id, SetStatus::Running).unwrap();
        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        let team_id = snapshot.teams[0].id.clone();
        db.apply_player_updates(
            &auction_id,
            &[resolve_update(&snapshot.players[0], PlayerStatus::Sold, Some(&team_id))],
        )
        .unwrap();

        db.set_set_status(&auction_id, &set.id, SetStatus::Completed).unwrap();

        let snapshot = db.load_snapshot(&auction_id).unwrap().unwrap();
        assert!(snapshot.unsold_set().is_none());
        assert_eq!(snapshot.auction.status, AuctionStatus::Completed);
    }

    #[test]
    fn set_with_players_cannot_be_removed() {
        let db = test_db();
        let (auction_id, set) = seeded(&db, 1);
        assert!(matches!(
            db.delete_set(&auction_id, &set.id),
            Err(StoreError::Conflict(_))
        ));
    }

    // ------------------------------------------------------------------
    // Session state (key-value)
    // ------------------------------------------------------------------

    #[test]
    fn save_and_load_state_round_trip() {
        let db = test_db();
        let value = json!({"round": 3, "sets": ["A", "B"]});
        db.save_state("current_round", &value).unwrap();
        assert_eq!(db.load_state("current_round").unwrap(), Some(value));
        assert!(db.load_state("nonexistent").unwrap().is_none());
    }

    #[test]
    fn current_auction_id_persists() {
        let db = test_db();
        assert!(db.get_current_auction_id().unwrap().is_none());
        db.set_current_auction_id("auction_1").unwrap();
        assert_eq!(
            db.get_current_auction_id().unwrap(),
            Some("auction_1".to_string())
        );
    }

    #[test]
    fn generate_auction_id_format() {
        let id = Database::generate_auction_id();
        assert!(id.starts_with("auction_"));
        assert_eq!(id.len(), "auction_20260228_143022_123".len());
    }

    #[tokio::test]
    async fn private_auction_refuses_public_snapshot() {
        let db = test_db();
        let auction = db
            .create_auction(
                "Private",
                AuctionSettings {
                    is_public: false,
                    ..settings()
                },
            )
            .unwrap();
        assert!(db.fetch_snapshot(&auction.id).await.is_ok());
        let err = db.fetch_public_snapshot(&auction.id).await.unwrap_err();
        assert!(err.is_session());
    }
}
