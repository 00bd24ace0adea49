// Remote auction store over a JSON REST API.
//
// Routes (relative to the configured base url):
//   GET    auctions/{id}/snapshot
//   GET    public/auctions/{id}/snapshot
//   PUT    auctions/{id}/settings
//   PATCH  auctions/{id}/players
//   PUT    auctions/{id}/sets/{set}/status
//   POST   auctions/{id}/teams          DELETE auctions/{id}/teams/{team}
//   POST   auctions/{id}/sets           DELETE auctions/{id}/sets/{set}
//   POST   auctions/{id}/players        POST   auctions/{id}/players/remove
//   POST   auctions/{id}/players/import

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gavel_core::auction::{
    AuctionSet, AuctionSettings, NewPlayer, NewSet, NewTeam, Player, PlayerUpdate, SetStatus,
    Snapshot, Team,
};
use gavel_core::store::{AuctionStore, StoreError, StoreResult};

pub struct HttpStore {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetStatusBody {
    status: SetStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemovePlayersBody {
    player_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ImportResponse {
    imported: usize,
}

impl HttpStore {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!("{method} {url}");
        let builder = self.http.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> StoreResult<Response> {
        let response = builder.send().await.map_err(map_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> StoreResult<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("malformed store response: {e}")))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> StoreResult<()> {
        self.send(builder).await.map(|_| ())
    }
}

/// Map a non-success status to a store error.
pub fn map_status(status: StatusCode, body: String) -> StoreError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound {
            kind: "resource",
            id: message,
        },
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Conflict(message),
        s if s.is_server_error() => StoreError::Transport(format!("{s}: {message}")),
        s => StoreError::Backend(anyhow::anyhow!("unexpected status {s}: {message}")),
    }
}

fn map_transport(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        StoreError::Transport(err.to_string())
    } else {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

#[async_trait]
impl AuctionStore for HttpStore {
    async fn fetch_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
        self.send_json(self.request(Method::GET, &format!("auctions/{auction_id}/snapshot")))
            .await
    }

    async fn fetch_public_snapshot(&self, auction_id: &str) -> StoreResult<Snapshot> {
        self.send_json(self.request(
            Method::GET,
            &format!("public/auctions/{auction_id}/snapshot"),
        ))
        .await
    }

    async fn update_auction(&self, auction_id: &str, settings: AuctionSettings) -> StoreResult<()> {
        self.send_empty(
            self.request(Method::PUT, &format!("auctions/{auction_id}/settings"))
                .json(&settings),
        )
        .await
    }

    async fn update_players(&self, auction_id: &str, updates: Vec<PlayerUpdate>) -> StoreResult<()> {
        self.send_empty(
            self.request(Method::PATCH, &format!("auctions/{auction_id}/players"))
                .json(&updates),
        )
        .await
    }

    async fn update_set_status(
        &self,
        auction_id: &str,
        set_id: &str,
        status: SetStatus,
    ) -> StoreResult<()> {
        self.send_empty(
            self.request(
                Method::PUT,
                &format!("auctions/{auction_id}/sets/{set_id}/status"),
            )
            .json(&SetStatusBody { status }),
        )
        .await
    }

    async fn create_team(&self, auction_id: &str, team: NewTeam) -> StoreResult<Team> {
        self.send_json(
            self.request(Method::POST, &format!("auctions/{auction_id}/teams"))
                .json(&team),
        )
        .await
    }

    async fn remove_team(&self, auction_id: &str, team_id: &str) -> StoreResult<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("auctions/{auction_id}/teams/{team_id}"),
        ))
        .await
    }

    async fn create_set(&self, auction_id: &str, set: NewSet) -> StoreResult<AuctionSet> {
        self.send_json(
            self.request(Method::POST, &format!("auctions/{auction_id}/sets"))
                .json(&set),
        )
        .await
    }

    async fn remove_set(&self, auction_id: &str, set_id: &str) -> StoreResult<()> {
        self.send_empty(self.request(
            Method::DELETE,
            &format!("auctions/{auction_id}/sets/{set_id}"),
        ))
        .await
    }

    async fn create_players(&self, auction_id: &str, players: Vec<NewPlayer>) -> StoreResult<Vec<Player>> {
        self.send_json(
            self.request(Method::POST, &format!("auctions/{auction_id}/players"))
                .json(&players),
        )
        .await
    }

    async fn remove_players(&self, auction_id: &str, player_ids: Vec<String>) -> StoreResult<()> {
        self.send_empty(
            self.request(
                Method::POST,
                &format!("auctions/{auction_id}/players/remove"),
            )
            .json(&RemovePlayersBody { player_ids }),
        )
        .await
    }

    async fn import_players(&self, auction_id: &str, players: Vec<NewPlayer>) -> StoreResult<usize> {
        let response: ImportResponse = self
            .send_json(
                self.request(
                    Method::POST,
                    &format!("auctions/{auction_id}/players/import"),
                )
                .json(&players),
            )
            .await?;
        Ok(response.imported)
    }
}
