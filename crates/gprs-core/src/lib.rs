//! Core utilities for the GPRS RLC/MAC stack
//!
//! This crate provides fundamental types used across the stack:
//! - Bsn for radio block sequence numbering and timing
//! - Direction (uplink/downlink)
//! - Channel coding types and block size tables
//! - TLLI helpers
//! - Common macros and debug utilities

pub mod bsn;
pub mod coding;
pub mod debug;
pub mod direction;
pub mod tlli;

// Re-export commonly used items
pub use bsn::{Bsn, BsnTimer, BLOCKS_PER_SECOND, BLOCK_TIME_MSECS};
pub use coding::ChannelCoding;
pub use direction::Direction;
pub use tlli::{tlli_eq, Tlli};

/// Uplink State Flag value, 0..=7 on the air but only 1..=6 allocatable
pub type Usf = u8;

/// Temporary Flow Identity, 0..=31
pub type Tfi = u8;
