// Event loops that connect a front end to an operator session or a viewer.
//
// Front ends talk to these loops only through channels: they send commands
// in and render the `UiUpdate`s that come back.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use gavel_core::auction::{Phase, Snapshot};
use gavel_core::command::Command;
use gavel_core::import::ImportRow;
use gavel_core::protocol::HubMessage;

use crate::session::{Dispatch, OperatorSession, SessionError};
use crate::viewer::Viewer;

// ---------------------------------------------------------------------------
// Channel messages
// ---------------------------------------------------------------------------

/// Commands from the operator's front end.
#[derive(Debug, Clone)]
pub enum UserCommand {
    Dispatch(Command),
    Import(Vec<ImportRow>),
    Refresh,
    Quit,
}

/// Commands from a viewer's front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerCommand {
    Refresh,
    Quit,
}

/// Updates for the front end to render.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// The latest pulled snapshot and the phase derived from it.
    State {
        phase: Phase,
        snapshot: Box<Snapshot>,
    },
    /// A command reached the store.
    Applied { action: String, phase: Phase },
    /// A command was refused before touching the store.
    Rejected { action: String, reason: String },
    /// A push announcement (viewers only).
    Announcement(String),
    /// Credentials are no longer accepted; the user has to sign in again.
    SessionExpired(String),
    /// A store or transport failure. The last good state stays on screen.
    Error(String),
}

// ---------------------------------------------------------------------------
// Operator loop
// ---------------------------------------------------------------------------

/// Run the operator event loop until `Quit` arrives or the command channel
/// closes.
///
/// Each command runs on its own task so that a command arriving while
/// another is still in flight is refused by the session instead of queued.
pub async fn run_operator(
    session: Arc<OperatorSession>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<()> {
    info!("Operator loop started for {}", session.auction_id());
    send_refresh(&session, &ui_tx).await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(UserCommand::Refresh) => {
                        send_refresh(&session, &ui_tx).await;
                    }
                    Some(UserCommand::Dispatch(command)) => {
                        let session = Arc::clone(&session);
                        let ui_tx = ui_tx.clone();
                        tokio::spawn(async move {
                            let action = command.label().to_string();
                            let result = session.dispatch(command).await;
                            report(&session, action, result, &ui_tx).await;
                        });
                    }
                    Some(UserCommand::Import(rows)) => {
                        let session = Arc::clone(&session);
                        let ui_tx = ui_tx.clone();
                        tokio::spawn(async move {
                            let result = session.import_rows(&rows).await;
                            report(&session, "import players".to_string(), result, &ui_tx).await;
                        });
                    }
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn report(
    session: &OperatorSession,
    action: String,
    result: Result<Dispatch, SessionError>,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    match result {
        Ok(Dispatch::Applied { phase }) => {
            let _ = ui_tx.send(UiUpdate::Applied { action, phase }).await;
            if let Some(snapshot) = session.snapshot() {
                let _ = ui_tx
                    .send(UiUpdate::State {
                        phase: session.phase(),
                        snapshot: Box::new(snapshot),
                    })
                    .await;
            }
        }
        Ok(Dispatch::Rejected(err)) => {
            let _ = ui_tx
                .send(UiUpdate::Rejected {
                    action,
                    reason: err.to_string(),
                })
                .await;
        }
        Err(err) => send_error(err, ui_tx).await,
    }
}

async fn send_refresh(session: &OperatorSession, ui_tx: &mpsc::Sender<UiUpdate>) {
    match session.refresh().await {
        Ok(snapshot) => {
            let _ = ui_tx
                .send(UiUpdate::State {
                    phase: session.phase(),
                    snapshot: Box::new(snapshot),
                })
                .await;
        }
        Err(err) => send_error(err, ui_tx).await,
    }
}

async fn send_error(err: SessionError, ui_tx: &mpsc::Sender<UiUpdate>) {
    if err.requires_reauth() {
        warn!("Session expired: {err}");
        let _ = ui_tx.send(UiUpdate::SessionExpired(err.to_string())).await;
    } else {
        warn!("{err}");
        let _ = ui_tx.send(UiUpdate::Error(err.to_string())).await;
    }
}

// ---------------------------------------------------------------------------
// Viewer loop
// ---------------------------------------------------------------------------

/// Run a viewer until `Quit` arrives or the command channel closes.
///
/// Listens on two channels using `tokio::select!`:
/// 1. Hub messages from the push subscription
/// 2. Viewer commands from the front end
pub async fn run_viewer(
    mut viewer: Viewer,
    mut push_rx: mpsc::Receiver<HubMessage>,
    mut cmd_rx: mpsc::Receiver<ViewerCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<()> {
    info!("Viewer loop started for {}", viewer.auction_id());
    viewer_refresh(&mut viewer, &ui_tx).await;

    // Once the subscription ends the viewer still works through manual
    // refreshes; stop polling the closed channel.
    let mut push_open = true;

    loop {
        tokio::select! {
            msg = push_rx.recv(), if push_open => {
                match msg {
                    Some(msg) => {
                        let announcement = match &msg {
                            HubMessage::Announcement { message, .. } if msg.auction_id() == viewer.auction_id() => {
                                Some(message.clone())
                            }
                            _ => None,
                        };
                        match viewer.handle_push(msg).await {
                            Ok(changed) => {
                                if let Some(message) = announcement {
                                    let _ = ui_tx.send(UiUpdate::Announcement(message)).await;
                                }
                                if changed {
                                    send_viewer_state(&viewer, &ui_tx).await;
                                }
                            }
                            Err(err) => send_error(err, &ui_tx).await,
                        }
                    }
                    None => {
                        info!("Push channel closed");
                        push_open = false;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ViewerCommand::Refresh) => viewer_refresh(&mut viewer, &ui_tx).await,
                    Some(ViewerCommand::Quit) | None => {
                        info!("Viewer shutting down");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn viewer_refresh(viewer: &mut Viewer, ui_tx: &mpsc::Sender<UiUpdate>) {
    match viewer.refresh().await {
        Ok(_) => send_viewer_state(viewer, ui_tx).await,
        Err(err) => send_error(err, ui_tx).await,
    }
}

async fn send_viewer_state(viewer: &Viewer, ui_tx: &mpsc::Sender<UiUpdate>) {
    if let Some(snapshot) = viewer.snapshot() {
        let _ = ui_tx
            .send(UiUpdate::State {
                phase: viewer.phase(),
                snapshot: Box::new(snapshot.clone()),
            })
            .await;
    }
}
