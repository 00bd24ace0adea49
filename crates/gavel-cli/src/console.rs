// Line-oriented operator console: command parsing and plain-text rendering.

use std::path::PathBuf;

use thiserror::Error;

use gavel_app::app::UiUpdate;
use gavel_core::auction::grouping::group_by_team;
use gavel_core::auction::{AuctionSettings, Money, NewSet, NewTeam, Phase, Snapshot};
use gavel_core::command::Command;
use gavel_core::protocol::format_money;

pub const HELP: &str = "\
commands:
  sets | teams | status
  select <set>            start a set
  pick                    open a random idle player
  bid <team> [amount]     bid the next step, or jump to amount
  undo                    drop the last bid
  sold                    close bidding on the current player
  assign <team> <price>   sell the current player outright
  budget <amount>         change the starting budget
  squad <min> <max>       change squad size limits
  public on|off           toggle the public snapshot
  team add <name> [budget] | team rm <team>
  set add <name> | set rm <set>
  player rm <id>...
  import <csv>
  help | quit";

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Sets,
    Teams,
    Status,
    Quit,
    /// Sent to the session as is.
    Run(Command),
    /// Applied on top of the current settings before dispatch.
    Settings(SettingsChange),
    Import(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    Budget(Money),
    Squad { min: u32, max: u32 },
    Public(bool),
}

impl SettingsChange {
    pub fn apply(self, current: AuctionSettings) -> AuctionSettings {
        match self {
            SettingsChange::Budget(budget) => AuctionSettings { budget, ..current },
            SettingsChange::Squad { min, max } => AuctionSettings {
                min_team_member: min,
                max_team_member: max,
                ..current
            },
            SettingsChange::Public(is_public) => AuctionSettings {
                is_public,
                ..current
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0} (try `help`)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("not an amount: {0}")]
    Amount(String),
}

/// Parse an amount, allowing `,` and `_` separators.
pub fn parse_money(s: &str) -> Result<Money, ParseError> {
    s.replace([',', '_'], "")
        .parse()
        .map_err(|_| ParseError::Amount(s.to_string()))
}

/// Split a trailing amount off a name. Names may contain spaces.
fn name_and_amount(args: &[&str]) -> (String, Option<Money>) {
    if args.len() > 1 {
        if let Ok(amount) = parse_money(args[args.len() - 1]) {
            return (args[..args.len() - 1].join(" "), Some(amount));
        }
    }
    (args.join(" "), None)
}

/// Parse one line. Returns `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(None);
    };

    let cmd = match head.to_lowercase().as_str() {
        "help" | "?" => ConsoleCommand::Help,
        "sets" => ConsoleCommand::Sets,
        "teams" => ConsoleCommand::Teams,
        "status" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        "select" => {
            if args.is_empty() {
                return Err(ParseError::Usage("select <set>"));
            }
            ConsoleCommand::Run(Command::SelectSet { set: args.join(" ") })
        }
        "pick" => ConsoleCommand::Run(Command::PickPlayer),
        "bid" => {
            if args.is_empty() {
                return Err(ParseError::Usage("bid <team> [amount]"));
            }
            let (team, amount) = name_and_amount(args);
            ConsoleCommand::Run(Command::PlaceBid { team, amount })
        }
        "undo" => ConsoleCommand::Run(Command::UndoBid),
        "sold" | "resolve" => ConsoleCommand::Run(Command::Resolve),
        "assign" => match name_and_amount(args) {
            (team, Some(price)) if !team.is_empty() => {
                ConsoleCommand::Run(Command::ForceAssign { team, price })
            }
            _ => return Err(ParseError::Usage("assign <team> <price>")),
        },
        "budget" => match args {
            [amount] => ConsoleCommand::Settings(SettingsChange::Budget(parse_money(amount)?)),
            _ => return Err(ParseError::Usage("budget <amount>")),
        },
        "squad" => match args {
            [min, max] => {
                let min = min.parse().map_err(|_| ParseError::Amount(min.to_string()))?;
                let max = max.parse().map_err(|_| ParseError::Amount(max.to_string()))?;
                ConsoleCommand::Settings(SettingsChange::Squad { min, max })
            }
            _ => return Err(ParseError::Usage("squad <min> <max>")),
        },
        "public" => match args {
            ["on"] | ["yes"] | ["true"] => ConsoleCommand::Settings(SettingsChange::Public(true)),
            ["off"] | ["no"] | ["false"] => ConsoleCommand::Settings(SettingsChange::Public(false)),
            _ => return Err(ParseError::Usage("public on|off")),
        },
        "team" => match args.split_first() {
            Some((&"add", rest)) if !rest.is_empty() => {
                let (name, budget) = name_and_amount(rest);
                ConsoleCommand::Run(Command::CreateTeam(NewTeam {
                    owner: name.clone(),
                    name,
                    budget,
                    logo: None,
                }))
            }
            Some((&"rm", rest)) if !rest.is_empty() => ConsoleCommand::Run(Command::RemoveTeam {
                team: rest.join(" "),
            }),
            _ => return Err(ParseError::Usage("team add <name> [budget] | team rm <team>")),
        },
        "set" => match args.split_first() {
            Some((&"add", rest)) if !rest.is_empty() => {
                ConsoleCommand::Run(Command::CreateSet(NewSet {
                    name: rest.join(" "),
                    order: None,
                }))
            }
            Some((&"rm", rest)) if !rest.is_empty() => ConsoleCommand::Run(Command::RemoveSet {
                set: rest.join(" "),
            }),
            _ => return Err(ParseError::Usage("set add <name> | set rm <set>")),
        },
        "player" => match args.split_first() {
            Some((&"rm", ids)) if !ids.is_empty() => ConsoleCommand::Run(Command::RemovePlayers {
                player_ids: ids.iter().map(|s| s.to_string()).collect(),
            }),
            _ => return Err(ParseError::Usage("player rm <id>...")),
        },
        "import" => {
            if args.is_empty() {
                return Err(ParseError::Usage("import <csv>"));
            }
            ConsoleCommand::Import(PathBuf::from(args.join(" ")))
        }
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn format_sets(snapshot: &Snapshot) -> String {
    if snapshot.sets.is_empty() {
        return "no sets".to_string();
    }
    let mut out = String::new();
    for set in &snapshot.sets {
        let players: Vec<_> = snapshot.players_in_set(&set.id).collect();
        let open = players.iter().filter(|p| p.status.is_open()).count();
        out.push_str(&format!(
            "{:>3}. {:<20} {:<10} {} players, {} open\n",
            set.order,
            set.name,
            set.status,
            players.len(),
            open
        ));
    }
    out.trim_end().to_string()
}

pub fn format_teams(snapshot: &Snapshot) -> String {
    if snapshot.teams.is_empty() {
        return "no teams".to_string();
    }
    let standings = group_by_team(&snapshot.players, &snapshot.teams);
    let max = snapshot.auction.max_team_member;
    let mut out = String::new();
    for team in &snapshot.teams {
        let Some(standing) = standings.get(&team.id) else {
            continue;
        };
        out.push_str(&format!(
            "{:<20} {:>2}/{} players  spent {:>12}  left {:>12}\n",
            team.name,
            standing.squad_size(),
            max,
            format_money(standing.spent),
            format_money(standing.remaining)
        ));
    }
    out.trim_end().to_string()
}

pub fn format_status(phase: &Phase, snapshot: &Snapshot) -> String {
    let mut out = format!(
        "{} [{}] v{}: {}",
        snapshot.auction.name, snapshot.auction.id, snapshot.version, phase
    );
    if let Some(set) = snapshot.running_set() {
        out.push_str(&format!("\nset: {}", set.name));
    }
    if let Some(player) = snapshot.bidding_player() {
        out.push_str(&format!(
            "\non the floor: {} (base {})",
            player.name,
            format_money(player.base_price)
        ));
        match player.leading_bid() {
            Some(bid) => {
                let team = snapshot
                    .team(&bid.team_id)
                    .map(|t| t.name.as_str())
                    .unwrap_or(bid.team_id.as_str());
                out.push_str(&format!("\nhigh bid: {} by {}", format_money(bid.price), team));
            }
            None => out.push_str("\nno bids yet"),
        }
    } else if let Some(last) = &snapshot.last_resolved {
        out.push_str(&format!("\nlast: {} ({})", last.name, last.status));
    }
    out
}

/// The line to print for an update. `State` is silent; callers keep it
/// for `status`, `sets` and `teams`.
pub fn format_update(update: &UiUpdate) -> Option<String> {
    match update {
        UiUpdate::State { .. } => None,
        UiUpdate::Applied { action, phase } => Some(format!("ok: {action} ({phase})")),
        UiUpdate::Rejected { action, reason } => Some(format!("rejected {action}: {reason}")),
        UiUpdate::Announcement(message) => Some(format!(">> {message}")),
        UiUpdate::SessionExpired(message) => Some(format!("session expired: {message}")),
        UiUpdate::Error(message) => Some(format!("error: {message}")),
    }
}
