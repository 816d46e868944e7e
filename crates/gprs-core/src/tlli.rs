/// Temporary Logical Link Identity. Identifies an MS at the RLC/MAC level;
/// the mapping to an actual phone (IMSI) lives in the upper layer.
pub type Tlli = u32;

/// Set in a local TLLI built from a P-TMSI (GSM 03.03 2.6).
pub const TLLI_LOCAL_BIT: Tlli = 0x4000_0000;

/// Compare two TLLIs ignoring the local/foreign bit.
///
/// When the MS detaches it flips its local TLLI to the foreign form; the
/// upper layer does not tell us about that, so treat the two as the same MS.
#[inline]
pub fn tlli_eq(a: Tlli, b: Tlli) -> bool {
    (a & !TLLI_LOCAL_BIT) == (b & !TLLI_LOCAL_BIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_bit_masked() {
        assert!(tlli_eq(0xc123_4567, 0xc123_4567));
        assert!(tlli_eq(0x8123_4567, 0x8123_4567 | TLLI_LOCAL_BIT));
        assert!(!tlli_eq(0xc123_4567, 0xc123_4568));
    }
}
