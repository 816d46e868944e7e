//! RLC/MAC message and data block records, GSM 04.60
//!
//! The records here are abstract: the bit-exact air interface layout is the
//! business of an external codec (see [`codec::MsgCodec`]). The core
//! constructs and consumes these records and never touches raw bit offsets.

pub mod codec;
pub mod control;
pub mod data;

pub use codec::{DecodeError, FlatCodec, MsgCodec};
pub use control::*;
pub use data::*;
