//! Core pipeline: parse, load, resolve, execute, health.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod loader;
pub mod module;
pub mod parser;
pub mod resolver;
pub mod types;
