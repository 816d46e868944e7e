//! Configuration for the GPRS RLC/MAC stack
//!
//! This crate provides configuration loading and parsing:
//! - TOML configuration file parsing
//! - Stack configuration structures (counters, timers, channel policy)

pub mod stack_config;
pub mod toml_config;

pub use stack_config::*;
pub use toml_config::*;
