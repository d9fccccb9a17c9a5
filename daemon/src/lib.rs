pub mod api;
pub mod archive;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod migrations;
pub mod runner;
pub mod store;
