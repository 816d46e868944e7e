use crossbeam_channel::Receiver;
use gprs_msgs::UlRadioBlock;

use crate::resources::{ReservationRing, UsfTable};

/// One physical packet data channel: an uplink/downlink pair identified by
/// ARFCN and timeslot, repurposed from circuit-switched use.
///
/// The channel owns the allocators whose scope is per-channel: the USF
/// table (USFs are meaningful per uplink channel) and the uplink block
/// reservation ring. TFIs are pooled across channels so multislot TBFs
/// keep one TFI in every slot.
pub struct Pdch {
    pub arfcn: u16,
    pub tn: u8,
    pub usfs: UsfTable,
    pub reservations: ReservationRing,
    /// Decoded uplink blocks from the radio thread, drained each tick.
    pub uplink_rx: Receiver<UlRadioBlock>,
}

impl Pdch {
    pub fn new(arfcn: u16, tn: u8, uplink_rx: Receiver<UlRadioBlock>) -> Pdch {
        Pdch {
            arfcn,
            tn,
            usfs: UsfTable::new(),
            reservations: ReservationRing::new(),
            uplink_rx,
        }
    }
}

impl std::fmt::Display for Pdch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PDCH({}:{})", self.arfcn, self.tn)
    }
}
