// Gavel entry point.
//
// Startup sequence:
// 1. Parse the mode (`gavel [auction-id]` operates, `gavel watch <id>` views)
// 2. Load config (copies defaults/ into config/ on first run)
// 3. Initialize tracing (log to file, not terminal)
// 4. Open the store (SQLite or HTTP)
// 5. Operator: resume or create the auction, start the push hub, run the
//    session loop and the console
//    Viewer: subscribe to the push hub and run the viewer loop
// 6. Cleanup on exit

mod console;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use gavel_app::app::{self, UiUpdate, UserCommand, ViewerCommand};
use gavel_app::http_store::HttpStore;
use gavel_app::push_client::{self, WsPublisher};
use gavel_app::session::OperatorSession;
use gavel_app::viewer::Viewer;
use gavel_core::auction::{NewSet, NewTeam, Phase, Snapshot};
use gavel_core::command::Command;
use gavel_core::config::{self, Config, StoreBackend};
use gavel_core::db::Database;
use gavel_core::import;
use gavel_core::store::AuctionStore;
use gavel_core::ws_server::{self, PushHub, PushPublisher};

use console::ConsoleCommand;

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Run the operator console, optionally on a specific auction.
    Operate { auction_id: Option<String> },
    /// Follow an auction as a passive viewer.
    Watch { auction_id: String },
}

fn parse_args(args: &[String]) -> anyhow::Result<Mode> {
    match args {
        [] => Ok(Mode::Operate { auction_id: None }),
        [cmd, id] if cmd == "watch" => Ok(Mode::Watch {
            auction_id: id.clone(),
        }),
        [cmd] if cmd == "watch" => bail!("usage: gavel watch <auction-id>"),
        [id] => Ok(Mode::Operate {
            auction_id: Some(id.clone()),
        }),
        _ => bail!("usage: gavel [auction-id] | gavel watch <auction-id>"),
    }
}

/// The store the process drives. `db` is set for the SQLite backend, which
/// also remembers the current auction between runs.
struct Backend {
    store: Arc<dyn AuctionStore>,
    db: Option<Arc<Database>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Mode
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_args(&args)?;

    // 2. Config
    let config = config::load_config().context("failed to load configuration")?;

    // 3. Tracing
    init_tracing(&config.server.log_filter)?;
    info!("Gavel starting up ({mode:?})");

    // 4. Store
    let backend = open_store(&config)?;

    // 5. Run
    let result = match mode {
        Mode::Operate { auction_id } => operate(&config, backend, auction_id).await,
        Mode::Watch { auction_id } => watch(&config, backend, auction_id).await,
    };
    if let Err(e) = &result {
        error!("Gavel exited with error: {e:#}");
    }

    // 6. Cleanup
    info!("Gavel shut down");
    result
}

fn open_store(config: &Config) -> anyhow::Result<Backend> {
    match config.server.backend {
        StoreBackend::Sqlite => {
            let path = config.server.resolved_db_path();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let db = Arc::new(
                Database::open(&path.to_string_lossy()).context("failed to open database")?,
            );
            info!("Database opened at {}", path.display());
            Ok(Backend {
                store: db.clone(),
                db: Some(db),
            })
        }
        StoreBackend::Http => {
            let http = config
                .server
                .http
                .as_ref()
                .context("server.toml selects the http backend but has no [http] section")?;
            let store = HttpStore::new(
                &http.base_url,
                config.credentials.api_token.clone(),
                Duration::from_secs(http.timeout_secs),
            )
            .context("failed to build HTTP client")?;
            info!("Using HTTP store at {}", http.base_url);
            Ok(Backend {
                store: Arc::new(store),
                db: None,
            })
        }
    }
}

/// Pick the auction to operate: the requested one, else the one from the
/// last run, else a new auction seeded from auction.toml.
fn resolve_auction(
    config: &Config,
    backend: &Backend,
    requested: Option<String>,
) -> anyhow::Result<String> {
    let Some(db) = &backend.db else {
        return requested.context("the http store needs an auction id: gavel <auction-id>");
    };

    if let Some(id) = requested {
        if !db.auction_exists(&id)? {
            bail!("no auction {id} in the local database");
        }
        db.set_current_auction_id(&id)?;
        return Ok(id);
    }

    if let Some(id) = db.get_current_auction_id()? {
        if db.auction_exists(&id)? {
            info!("Resuming auction {id}");
            return Ok(id);
        }
    }

    let auction = db
        .create_auction(&config.auction.name, config.auction.settings())
        .context("failed to create auction")?;
    for team in &config.seed_teams {
        db.insert_team(&auction.id, &NewTeam::from(team))?;
    }
    for set in &config.seed_sets {
        db.insert_set(&auction.id, &NewSet::from(set))?;
    }
    db.set_current_auction_id(&auction.id)?;
    info!(
        "Created auction {} with {} teams and {} sets",
        auction.id,
        config.seed_teams.len(),
        config.seed_sets.len()
    );
    Ok(auction.id)
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

async fn operate(config: &Config, backend: Backend, requested: Option<String>) -> anyhow::Result<()> {
    let auction_id = resolve_auction(config, &backend, requested)?;

    // Push hub: remote when configured, otherwise hosted here.
    let (publisher, hub_handle): (Arc<dyn PushPublisher>, Option<JoinHandle<()>>) =
        match &config.server.hub_url {
            Some(url) => {
                info!("Publishing to remote push hub {url}");
                let publisher: Arc<dyn PushPublisher> = Arc::new(WsPublisher::spawn(url.clone()));
                (publisher, None)
            }
            None => {
                let hub = Arc::new(PushHub::new());
                let port = config.server.push_port;
                let server_hub = Arc::clone(&hub);
                let handle = tokio::spawn(async move {
                    if let Err(e) = ws_server::run(port, server_hub).await {
                        error!("Push hub error on port {port}: {e:#}");
                    }
                });
                let publisher: Arc<dyn PushPublisher> = hub;
                (publisher, Some(handle))
            }
        };

    let session = Arc::new(OperatorSession::new(
        auction_id.clone(),
        Arc::clone(&backend.store),
        publisher,
    ));
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run_operator(session, cmd_rx, ui_tx).await {
            error!("Operator loop error: {e:#}");
        }
    });

    println!("gavel: operating auction {auction_id}; type `help` for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut latest: Option<(Phase, Snapshot)> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&line, latest.as_ref(), &cmd_tx).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {e}");
                        break;
                    }
                }
            }
            update = ui_rx.recv() => {
                match update {
                    Some(UiUpdate::State { phase, snapshot }) => {
                        latest = Some((phase, *snapshot));
                    }
                    Some(update) => {
                        if let Some(text) = console::format_update(&update) {
                            println!("{text}");
                        }
                        if let UiUpdate::SessionExpired(_) = update {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = cmd_tx.send(UserCommand::Quit).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), app_handle).await;
    if let Some(handle) = hub_handle {
        handle.abort();
    }
    Ok(())
}

/// Handle one console line. Returns false when the console should exit.
async fn handle_line(
    line: &str,
    latest: Option<&(Phase, Snapshot)>,
    cmd_tx: &mpsc::Sender<UserCommand>,
) -> bool {
    let cmd = match console::parse_line(line) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return true,
        Err(e) => {
            println!("{e}");
            return true;
        }
    };

    let to_send = match cmd {
        ConsoleCommand::Quit => return false,
        ConsoleCommand::Help => {
            println!("{}", console::HELP);
            None
        }
        ConsoleCommand::Sets => {
            print_latest(latest, |_, snapshot| console::format_sets(snapshot));
            None
        }
        ConsoleCommand::Teams => {
            print_latest(latest, |_, snapshot| console::format_teams(snapshot));
            None
        }
        ConsoleCommand::Status => {
            print_latest(latest, console::format_status);
            None
        }
        ConsoleCommand::Run(command) => Some(UserCommand::Dispatch(command)),
        ConsoleCommand::Settings(change) => match latest {
            Some((_, snapshot)) => Some(UserCommand::Dispatch(Command::UpdateSettings(
                change.apply(snapshot.auction.settings()),
            ))),
            None => {
                println!("still loading");
                None
            }
        },
        ConsoleCommand::Import(path) => match import::load_players_csv(&path) {
            Ok(rows) => {
                println!("read {} players from {}", rows.len(), path.display());
                Some(UserCommand::Import(rows))
            }
            Err(e) => {
                println!("import failed: {e}");
                None
            }
        },
    };

    if let Some(cmd) = to_send {
        if cmd_tx.send(cmd).await.is_err() {
            return false;
        }
    }
    true
}

fn print_latest(latest: Option<&(Phase, Snapshot)>, render: impl Fn(&Phase, &Snapshot) -> String) {
    match latest {
        Some((phase, snapshot)) => println!("{}", render(phase, snapshot)),
        None => println!("still loading"),
    }
}

// ---------------------------------------------------------------------------
// Viewer
// ---------------------------------------------------------------------------

async fn watch(config: &Config, backend: Backend, auction_id: String) -> anyhow::Result<()> {
    let hub_url = config
        .server
        .hub_url
        .clone()
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}", config.server.push_port));

    let (push_tx, push_rx) = mpsc::channel(64);
    let subscription = tokio::spawn(push_client::subscribe(hub_url, auction_id.clone(), push_tx));

    let viewer = Viewer::new(auction_id.clone(), backend.store);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);
    let viewer_handle = tokio::spawn(async move {
        if let Err(e) = app::run_viewer(viewer, push_rx, cmd_rx, ui_tx).await {
            error!("Viewer loop error: {e:#}");
        }
    });

    println!("gavel: watching auction {auction_id}; `refresh` or `quit`");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown_version = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let cmd = match line {
                    Ok(Some(line)) => match line.trim() {
                        "" => continue,
                        "refresh" | "r" => ViewerCommand::Refresh,
                        "quit" | "exit" => break,
                        other => {
                            println!("unknown command: {other}");
                            continue;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {e}");
                        break;
                    }
                };
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            update = ui_rx.recv() => {
                match update {
                    Some(UiUpdate::State { phase, snapshot }) => {
                        if shown_version != Some(snapshot.version) {
                            shown_version = Some(snapshot.version);
                            println!("{}", console::format_status(&phase, &snapshot));
                        }
                    }
                    Some(update) => {
                        if let Some(text) = console::format_update(&update) {
                            println!("{text}");
                        }
                        if let UiUpdate::SessionExpired(_) = update {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = cmd_tx.send(ViewerCommand::Quit).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), viewer_handle).await;
    subscription.abort();
    Ok(())
}

/// Initialize tracing to log to a file (the terminal belongs to the console).
fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("gavel.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
