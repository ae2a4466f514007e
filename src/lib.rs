//! Labfleet laboratory equipment ledger
//!
//! Keeps a deduplicated version history of every equipment record and runs
//! the multi-stage approval workflow of change requests against the fleet.

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
