pub mod analytics;
pub mod api;
pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod report;
pub mod request;
pub mod scheduler;
pub mod telegram;
pub mod wal;
