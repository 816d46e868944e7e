use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use gprs_core::{Bsn, ChannelCoding, Tlli, Usf};
use gprs_msgs::{RadData, UlRadioBlock};

use crate::arena::ChanId;

/// What kind of block a transmit carries; goes out with the coding and the
/// USF in the per-block flags, which the physical layer codes separately
/// from the payload bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Data,
    Control,
    Idle,
}

#[derive(Debug, Clone, Copy)]
pub struct TxFlags {
    pub kind: TxKind,
    pub coding: ChannelCoding,
    /// USF granting the next uplink block; 0 means no grant.
    pub usf: Usf,
    /// RRBP code 0..=3 when the block requests a reserved reply.
    pub rrbp: Option<u8>,
}

/// Core to physical layer. At most one transmit per channel per tick.
pub trait PhyPort: Send {
    fn transmit(&mut self, chan: ChanId, bsn: Bsn, bits: Vec<u8>, flags: TxFlags);

    /// Queue a control message on the CCCH access grant channel.
    fn send_agch(&mut self, bits: Vec<u8>);

    /// Messages currently queued on the AGCH, for reservation lead time.
    fn agch_load(&self) -> u32 {
        0
    }
}

/// The circuit-switched side of the base station, from which packet
/// channels are borrowed and to which they are returned.
pub trait ChannelSource: Send {
    /// One channel on the home ARFCN, allocated from the low end.
    fn acquire_c0(&mut self) -> Option<(u16, u8)>;

    /// Up to `need` adjacent channels from the high end of the pool, so
    /// packet channels stay grouped for multislot use.
    fn acquire_group(&mut self, need: usize) -> Vec<(u16, u8)>;

    fn release(&mut self, arfcn: u16, tn: u8);
}

/// Core to the session layer (SGSN).
pub trait UpperLayer: Send {
    /// A complete uplink PDU was reassembled.
    fn deliver_pdu(&mut self, tlli: Tlli, data: Vec<u8>);

    /// A persistent downlink TBF has gone idle; the upper layer may feed
    /// a keep-alive PDU.
    fn keepalive(&mut self, _tlli: Tlli) {}
}

/// A RACH burst forwarded from the radio side.
#[derive(Debug, Clone, Copy)]
pub struct RachEvent {
    /// The 8-bit request code; the top bits classify the request.
    pub code: u8,
    /// Frame number the burst arrived in.
    pub frame: u32,
    pub rad: RadData,
}

/// A downlink PDU from the upper layer, addressed by TLLI.
#[derive(Debug, Clone)]
pub struct SgsnPdu {
    pub tlli: Tlli,
    pub data: Vec<u8>,
    pub descr: String,
}

const RACH_QUEUE_DEPTH: usize = 64;
const DL_PDU_QUEUE_DEPTH: usize = 512;
const UPLINK_QUEUE_DEPTH: usize = 32;

pub(crate) type UplinkRegistry = Arc<Mutex<HashMap<(u16, u8), Sender<UlRadioBlock>>>>;

/// The write side of the scheduler's mailboxes. Clonable, and safe to use
/// from the real-time radio thread: every call is a bounded non-blocking
/// queue push; overflow is logged and the item dropped, never an error.
#[derive(Clone)]
pub struct MacHandle {
    rach_tx: Sender<RachEvent>,
    dl_tx: Sender<SgsnPdu>,
    uplinks: UplinkRegistry,
}

impl MacHandle {
    pub fn deliver_rach(&self, code: u8, frame: u32, rad: RadData) {
        match self.rach_tx.try_send(RachEvent { code, frame, rad }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("deliver_rach: queue full, RACH dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("deliver_rach: scheduler gone");
            }
        }
    }

    pub fn enqueue_downlink_pdu(&self, tlli: Tlli, data: Vec<u8>, descr: &str) {
        let pdu = SgsnPdu {
            tlli,
            data,
            descr: descr.to_string(),
        };
        match self.dl_tx.try_send(pdu) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("enqueue_downlink_pdu: queue full, PDU for {:08x} dropped", tlli);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("enqueue_downlink_pdu: scheduler gone");
            }
        }
    }

    pub fn deliver_uplink_block(&self, arfcn: u16, tn: u8, block: UlRadioBlock) {
        let reg = self.uplinks.lock().expect("uplink registry poisoned");
        let Some(tx) = reg.get(&(arfcn, tn)) else {
            tracing::debug!("deliver_uplink_block: no packet channel at {}:{}", arfcn, tn);
            return;
        };
        match tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("deliver_uplink_block: queue full on {}:{}, block dropped", arfcn, tn);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// The read side, owned by the scheduler.
pub(crate) struct MacQueues {
    pub rach_rx: Receiver<RachEvent>,
    pub dl_rx: Receiver<SgsnPdu>,
    pub uplinks: UplinkRegistry,
}

impl MacQueues {
    /// Register a new packet channel's uplink queue; returns the receiver
    /// for the Pdch record.
    pub fn add_channel(&self, arfcn: u16, tn: u8) -> Receiver<UlRadioBlock> {
        let (tx, rx) = bounded(UPLINK_QUEUE_DEPTH);
        self.uplinks.lock().expect("uplink registry poisoned").insert((arfcn, tn), tx);
        rx
    }

    pub fn remove_channel(&self, arfcn: u16, tn: u8) {
        self.uplinks.lock().expect("uplink registry poisoned").remove(&(arfcn, tn));
    }
}

pub(crate) fn mac_queues() -> (MacHandle, MacQueues) {
    let (rach_tx, rach_rx) = bounded(RACH_QUEUE_DEPTH);
    let (dl_tx, dl_rx) = bounded(DL_PDU_QUEUE_DEPTH);
    let uplinks: UplinkRegistry = Arc::new(Mutex::new(HashMap::new()));
    (
        MacHandle {
            rach_tx,
            dl_tx,
            uplinks: uplinks.clone(),
        },
        MacQueues {
            rach_rx,
            dl_rx,
            uplinks,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rach_queue_bounded() {
        let (handle, queues) = mac_queues();
        for i in 0..(RACH_QUEUE_DEPTH + 10) {
            handle.deliver_rach(0x78, i as u32, RadData::default());
        }
        // Excess was dropped, not blocked on
        assert_eq!(queues.rach_rx.len(), RACH_QUEUE_DEPTH);
    }

    #[test]
    fn test_uplink_registry() {
        let (handle, queues) = mac_queues();
        let rx = queues.add_channel(51, 6);
        let blk = UlRadioBlock {
            bsn: Bsn::new(1),
            rad: RadData::default(),
            kind: gprs_msgs::UlBlockKind::Control(vec![1, 2, 3]),
        };
        handle.deliver_uplink_block(51, 6, blk.clone());
        handle.deliver_uplink_block(51, 7, blk); // unknown channel: dropped
        assert_eq!(rx.len(), 1);
        queues.remove_channel(51, 6);
        let blk2 = UlRadioBlock {
            bsn: Bsn::new(2),
            rad: RadData::default(),
            kind: gprs_msgs::UlBlockKind::Control(vec![]),
        };
        handle.deliver_uplink_block(51, 6, blk2);
        assert_eq!(rx.len(), 1);
    }
}
