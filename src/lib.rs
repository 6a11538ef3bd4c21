pub mod api;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod publisher;
pub mod store;
pub mod supervisor;
pub mod utils;
