pub mod cache;
pub mod chat_log;
pub mod config;
pub mod events;
pub mod http_client;
pub mod identity;
pub mod inject;
pub mod panel;
pub mod prefs;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod transcript;
pub mod watcher;
