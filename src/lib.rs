pub mod config;
pub mod engine;
pub mod gallery;
pub mod server;
