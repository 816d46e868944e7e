//! GPRS RLC/MAC layer, GSM 04.60
//!
//! The session-management and scheduling engine of a packet-data base
//! station: TBF state machines, uplink/downlink sliding-window ARQ, the
//! per-block MAC scheduler and the USF/TFI/reservation allocators.
//!
//! Everything runs on one scheduler worker; the physical layer and the
//! upper (SGSN-facing) layer talk to it exclusively through bounded
//! queues on a [`ports::MacHandle`].

#![allow(dead_code)]

pub mod arena;
pub mod msinfo;
pub mod pdch;
pub mod ports;
pub mod resources;
pub mod rlc;
pub mod sched;
pub mod stats;
pub mod tbf;

pub use arena::{Arena, ChanId, MsId, TbfId};
pub use ports::{ChannelSource, MacHandle, PhyPort, TxFlags, TxKind, UpperLayer};
pub use sched::Mac;
