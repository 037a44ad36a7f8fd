//! Food Ingredient Detection Service Library

pub mod config;
pub mod engine;
pub mod service;
pub mod telemetry;
pub mod api;

pub use config::Config;
