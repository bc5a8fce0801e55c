pub mod config;
pub mod handlers;
pub mod metrics;
pub mod station;
