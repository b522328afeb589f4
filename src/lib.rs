pub mod api;
pub mod app;
pub mod capture;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod global;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod throttle;
