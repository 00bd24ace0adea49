// Configuration loading and parsing (auction.toml, server.toml, credentials.toml).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::auction::model::{AuctionSettings, Money, NewSet, NewTeam, UNSOLD_SET_NAME};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub auction: AuctionDefaults,
    pub seed_teams: Vec<SeedTeam>,
    pub seed_sets: Vec<SeedSet>,
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// auction.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AuctionFile {
    auction: AuctionDefaults,
    #[serde(default)]
    teams: Vec<SeedTeam>,
    #[serde(default)]
    sets: Vec<SeedSet>,
}

/// Settings applied to an auction created from the console.
#[derive(Debug, Clone, Deserialize)]
pub struct AuctionDefaults {
    pub name: String,
    pub budget: Money,
    pub min_team_member: u32,
    pub max_team_member: u32,
    #[serde(default)]
    pub public: bool,
}

impl AuctionDefaults {
    pub fn settings(&self) -> AuctionSettings {
        AuctionSettings {
            budget: self.budget,
            min_team_member: self.min_team_member,
            max_team_member: self.max_team_member,
            is_public: self.public,
        }
    }
}

/// A team created together with a fresh auction.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedTeam {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub budget: Option<Money>,
}

impl From<&SeedTeam> for NewTeam {
    fn from(seed: &SeedTeam) -> Self {
        NewTeam {
            name: seed.name.clone(),
            owner: seed.owner.clone(),
            budget: seed.budget,
            logo: None,
        }
    }
}

/// A set created together with a fresh auction.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSet {
    pub name: String,
    #[serde(default)]
    pub order: Option<u32>,
}

impl From<&SeedSet> for NewSet {
    fn from(seed: &SeedSet) -> Self {
        NewSet {
            name: seed.name.clone(),
            order: seed.order,
        }
    }
}

// ---------------------------------------------------------------------------
// server.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ServerFile {
    store: StoreSection,
    #[serde(default)]
    http: Option<HttpSection>,
    push: PushSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
struct StoreSection {
    backend: StoreBackend,
    #[serde(default)]
    db_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct PushSection {
    port: u16,
    #[serde(default)]
    hub_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LoggingSection {
    #[serde(default = "default_log_filter")]
    filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_log_filter() -> String {
    "gavel=info,warn".to_string()
}

/// Which [`crate::store::AuctionStore`] implementation the console drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Http,
}

/// The public server config assembled from the server.toml sections.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backend: StoreBackend,
    /// Explicit database path; `None` falls back to the platform data dir.
    pub db_path: Option<String>,
    pub http: Option<HttpSection>,
    pub push_port: u16,
    /// Remote push hub. When absent the hub is hosted in-process.
    pub hub_url: Option<String>,
    pub log_filter: String,
}

impl ServerConfig {
    /// The SQLite file to open: the configured path, else
    /// `<data dir>/gavel.db`, else `gavel.db` in the working directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return PathBuf::from(path);
        }
        directories::ProjectDirs::from("", "", "gavel")
            .map(|dirs| dirs.data_dir().join("gavel.db"))
            .unwrap_or_else(|| PathBuf::from("gavel.db"))
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Bearer token for the HTTP store.
    pub api_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/auction.toml`,
/// `config/server.toml`, and (optionally) `config/credentials.toml`,
/// all relative to the given `base_dir`.
///
/// Does not copy defaults; `load_config()` does.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let auction_path = config_dir.join("auction.toml");
    let auction_file: AuctionFile = parse_file(&auction_path)?;

    let server_path = config_dir.join("server.toml");
    let server_file: ServerFile = parse_file(&server_path)?;

    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        parse_file(&credentials_path)?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        auction: auction_file.auction,
        seed_teams: auction_file.teams,
        seed_sets: auction_file.sets,
        server: ServerConfig {
            backend: server_file.store.backend,
            db_path: server_file.store.db_path,
            http: server_file.http,
            push_port: server_file.push.port,
            hub_url: server_file.push.hub_url,
            log_filter: server_file.logging.filter,
        },
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            // Operator edits in config/ win.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Loads config relative to the current working directory, copying
/// defaults first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn parse_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = read_file(path)?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let auction = &config.auction;
    if auction.name.trim().is_empty() {
        return Err(invalid("auction.name", "must not be empty"));
    }
    if auction.budget == 0 {
        return Err(invalid("auction.budget", "must be greater than 0"));
    }
    if auction.min_team_member == 0 {
        return Err(invalid("auction.min_team_member", "must be greater than 0"));
    }
    if auction.min_team_member > auction.max_team_member {
        return Err(invalid(
            "auction.max_team_member",
            format!(
                "must be at least min_team_member ({}), got {}",
                auction.min_team_member, auction.max_team_member
            ),
        ));
    }

    let mut team_names = HashSet::new();
    for (i, team) in config.seed_teams.iter().enumerate() {
        if team.name.trim().is_empty() {
            return Err(invalid(&format!("teams[{i}].name"), "must not be empty"));
        }
        if !team_names.insert(team.name.to_lowercase()) {
            return Err(invalid(
                &format!("teams[{i}].name"),
                format!("duplicate team name {:?}", team.name),
            ));
        }
        if team.budget == Some(0) {
            return Err(invalid(&format!("teams[{i}].budget"), "must be greater than 0"));
        }
    }

    let mut set_names = HashSet::new();
    for (i, set) in config.seed_sets.iter().enumerate() {
        if set.name.eq_ignore_ascii_case(UNSOLD_SET_NAME) {
            return Err(invalid(
                &format!("sets[{i}].name"),
                format!("{UNSOLD_SET_NAME:?} is reserved for leftover players"),
            ));
        }
        if !set_names.insert(set.name.to_lowercase()) {
            return Err(invalid(
                &format!("sets[{i}].name"),
                format!("duplicate set name {:?}", set.name),
            ));
        }
    }

    let server = &config.server;
    if server.push_port == 0 {
        return Err(invalid("push.port", "must be non-zero"));
    }
    if server.backend == StoreBackend::Http {
        let Some(http) = &server.http else {
            return Err(invalid("http", "required when store.backend = \"http\""));
        };
        if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://")) {
            return Err(invalid(
                "http.base_url",
                format!("must be an http(s) url, got {:?}", http.base_url),
            ));
        }
        if http.timeout_secs == 0 {
            return Err(invalid("http.timeout_secs", "must be greater than 0"));
        }
    }
    if let Some(hub_url) = &server.hub_url {
        if !(hub_url.starts_with("ws://") || hub_url.starts_with("wss://")) {
            return Err(invalid(
                "push.hub_url",
                format!("must be a ws(s) url, got {hub_url:?}"),
            ));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
