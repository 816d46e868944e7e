use core::fmt;

/// Channel coding scheme for RLC data blocks, GSM 04.60 table 10.2.1.
///
/// Downlink coding is chosen per block (signalled in the qbits); uplink
/// coding is commanded to the MS in the assignment and in every ack/nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelCoding {
    Cs1,
    Cs2,
    Cs3,
    Cs4,
}

impl ChannelCoding {
    /// MAC header plus RLC data block plus spare bits, in bits.
    pub fn block_size_bits(self) -> usize {
        match self {
            // Table 10.2.1 does not include the 8-bit MAC header, so add 1 octet.
            ChannelCoding::Cs1 => (1 + 22) * 8,
            ChannelCoding::Cs2 => (1 + 32) * 8 + 7,
            ChannelCoding::Cs3 => (1 + 38) * 8 + 3,
            ChannelCoding::Cs4 => (1 + 52) * 8 + 7,
        }
    }

    /// RLC payload in octets: table size minus the 2-octet RLC header.
    pub fn payload_size(self) -> usize {
        match self {
            ChannelCoding::Cs1 => 22 - 2,
            ChannelCoding::Cs2 => 32 - 2,
            ChannelCoding::Cs3 => 38 - 2,
            ChannelCoding::Cs4 => 52 - 2,
        }
    }

    pub fn from_index(i: u8) -> Option<ChannelCoding> {
        match i {
            0 => Some(ChannelCoding::Cs1),
            1 => Some(ChannelCoding::Cs2),
            2 => Some(ChannelCoding::Cs3),
            3 => Some(ChannelCoding::Cs4),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            ChannelCoding::Cs1 => 0,
            ChannelCoding::Cs2 => 1,
            ChannelCoding::Cs3 => 2,
            ChannelCoding::Cs4 => 3,
        }
    }
}

/// Maximum RLC block size in octets across all codings.
pub const BLOCK_SIZE_BYTES_MAX: usize = 53;

/// Maximum LLC PDU size in octets (GSM 04.60 9.1.12); longer PDUs are
/// truncated in RLC.
pub const PDU_MAX_LEN: usize = 1560;

impl fmt::Display for ChannelCoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CS-{}", self.index() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(ChannelCoding::Cs1.payload_size(), 20);
        assert_eq!(ChannelCoding::Cs4.payload_size(), 50);
        assert_eq!(ChannelCoding::Cs1.block_size_bits(), 184);
        for i in 0..4 {
            let cc = ChannelCoding::from_index(i).unwrap();
            assert_eq!(cc.index(), i);
            assert!(cc.payload_size() + 3 <= BLOCK_SIZE_BYTES_MAX);
        }
        assert!(ChannelCoding::from_index(4).is_none());
    }
}
