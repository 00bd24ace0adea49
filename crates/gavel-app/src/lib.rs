pub mod app;
pub mod http_store;
pub mod push_client;
pub mod session;
pub mod viewer;
