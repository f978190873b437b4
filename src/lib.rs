pub mod app;
pub mod bridge;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod json;
pub mod logging;
pub mod peer;
pub mod utils;
