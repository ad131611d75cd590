pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod event;
pub mod features;
pub mod init;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod store;
pub mod test_utils;
pub mod time;
pub mod token;
