use gprs_core::{Bsn, ChannelCoding, Tfi};

/// Fill octet for unused RLC data space, GSM 04.60 10.4.16.
pub const FILL_OCTET: u8 = 0x2b;

/// Length indicator octet, GSM 04.60 10.4.14. These live at the front of a
/// data block payload when the extension bit in the header is clear, and
/// slice the payload into PDU segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiOctet {
    /// Segment length in octets; 0 is the singular case (PDU fills the
    /// rest of the block exactly and its final octet moves to the next).
    pub li: u8,
    /// Another PDU starts after the current one.
    pub m: bool,
    /// This is the last length indicator octet.
    pub e: bool,
}

impl LiOctet {
    pub fn to_octet(self) -> u8 {
        (self.li << 2) | ((self.m as u8) << 1) | (self.e as u8)
    }

    pub fn from_octet(b: u8) -> LiOctet {
        LiOctet {
            li: b >> 2,
            m: b & 2 != 0,
            e: b & 1 != 0,
        }
    }
}

/// MAC header fields of an uplink data block that the core cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct UlMacHeader {
    /// Countdown value; 0 marks the final block of the TBF.
    pub countdown: u8,
    /// Stall indicator: the MS's send window is blocked.
    pub stall: bool,
}

impl UlMacHeader {
    #[inline]
    pub fn is_final(&self) -> bool {
        self.countdown == 0
    }
}

/// An uplink RLC data block, already channel-decoded by the physical layer.
/// `sn` is the 7-bit ARQ sequence number, unrelated to radio-block timing.
#[derive(Debug, Clone)]
pub struct UlDataBlock {
    pub mac: UlMacHeader,
    pub tfi: Tfi,
    pub sn: u8,
    /// Extension bit: when set, the whole payload belongs to the current
    /// PDU and there are no length indicator octets.
    pub extended: bool,
    pub coding: ChannelCoding,
    pub payload: Vec<u8>,
}

/// A downlink RLC data block under construction. The USF and TFI fields are
/// filled in by the scheduler just before transmit.
#[derive(Debug, Clone)]
pub struct DlDataBlock {
    pub coding: ChannelCoding,
    pub tfi: Tfi,
    pub sn: u8,
    /// Final block indicator.
    pub fbi: bool,
    pub extended: bool,
    pub payload: Vec<u8>,
    /// Set when the block carries only keep-alive filler (persistent mode).
    pub idle: bool,
}

impl DlDataBlock {
    pub fn new(coding: ChannelCoding) -> DlDataBlock {
        DlDataBlock {
            coding,
            tfi: 0,
            sn: 0,
            fbi: false,
            extended: true,
            payload: Vec::new(),
            idle: false,
        }
    }
}

/// Radio-level signal measurements attached to uplink events.
#[derive(Debug, Clone, Copy, Default)]
pub struct RadData {
    pub rssi: f32,
    pub timing_error: f32,
}

/// One decoded uplink radio block as delivered by the physical layer.
#[derive(Debug, Clone)]
pub struct UlRadioBlock {
    /// Radio block number the block arrived in.
    pub bsn: Bsn,
    pub rad: RadData,
    pub kind: UlBlockKind,
}

#[derive(Debug, Clone)]
pub enum UlBlockKind {
    Data(UlDataBlock),
    /// An undecoded control block; the codec turns it into a [`crate::UlMsg`].
    Control(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_li_octet_roundtrip() {
        for li in 0..=50u8 {
            for (m, e) in [(false, false), (false, true), (true, false), (true, true)] {
                let o = LiOctet { li, m, e };
                assert_eq!(LiOctet::from_octet(o.to_octet()), o);
            }
        }
    }

    #[test]
    fn test_final_block() {
        let mut mac = UlMacHeader::default();
        assert!(mac.is_final());
        mac.countdown = 3;
        assert!(!mac.is_final());
    }
}
