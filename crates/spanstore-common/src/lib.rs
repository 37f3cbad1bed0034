//! Spanstore Common - Shared types and utilities
//!
//! This crate provides the identifiers, key ranges, locators, error
//! definitions and configuration used across all spanstore components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    Config, GB, MB, OverflowConfig, OverflowMode, ScatterSplitConfig, SimulationConfig,
};
pub use error::{Error, Result};
pub use types::*;
