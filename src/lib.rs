pub mod app;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod sources;
