//! API module
//!
//! REST API using Axum

pub mod rest;
pub mod dto;
