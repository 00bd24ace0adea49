// Library root for the auction engine: domain model, bid rules, progression,
// the store boundary and the push channel.

pub mod auction;
pub mod command;
pub mod config;
pub mod db;
pub mod import;
pub mod protocol;
pub mod store;
pub mod ws_server;
