use gprs_core::{Bsn, BsnTimer, Usf};

use crate::arena::MsId;

/// USF 0 is reserved for RACH-initiated single block assignments, 7 is
/// reserved (it indicates PRACH on PCCCH channels, which we avoid anyway),
/// leaving 6 allocatable values per uplink channel. USFs are per-MS, not
/// per-TBF: simultaneous uplink TBFs of one MS share the value.
pub const USF_MIN: Usf = 1;
pub const USF_MAX: Usf = 6;

/// After a TBF dies its USF stays off-limits to other MS this long, in
/// case the old session's last blocks are still in flight.
const USF_DEAD_TIME_MS: u32 = 5000;

#[derive(Debug, Default, Clone, Copy)]
struct UsfSlot {
    ms: Option<MsId>,
    dead_until: BsnTimer,
}

const REMEMBER_LEN: usize = 32;

/// USF allocation for one uplink channel, plus a short memory of which USF
/// went out in each recent downlink block so uplink responses can be
/// correlated independently of their content.
pub struct UsfTable {
    slots: [UsfSlot; (USF_MAX + 1) as usize],
    remembered: [(i32, Usf); REMEMBER_LEN],
}

impl Default for UsfTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UsfTable {
    pub fn new() -> UsfTable {
        UsfTable {
            slots: Default::default(),
            remembered: [(-1, 0); REMEMBER_LEN],
        }
    }

    /// Which MS holds this USF? A quarantined (dead) slot still reports its
    /// old holder until the quarantine lapses, at which point it frees up.
    pub fn holder(&mut self, usf: Usf, now: Bsn) -> Option<MsId> {
        if !(USF_MIN..=USF_MAX).contains(&usf) {
            return None;
        }
        let slot = &mut self.slots[usf as usize];
        if slot.dead_until.valid() && slot.dead_until.expired(now) {
            slot.ms = None;
            slot.dead_until.invalidate();
        }
        slot.ms
    }

    /// Find or reuse a USF for this MS. The MS may reclaim its own slot
    /// even while quarantined. Returns None when all slots are held.
    pub fn allocate(&mut self, ms: MsId, now: Bsn) -> Option<Usf> {
        let mut free = None;
        for usf in USF_MIN..=USF_MAX {
            if self.slots[usf as usize].ms == Some(ms) {
                // Back in use; the quarantine only excludes other MS.
                self.slots[usf as usize].dead_until.invalidate();
                return Some(usf);
            }
            if free.is_none() && self.holder(usf, now).is_none() {
                free = Some(usf);
            }
        }
        if let Some(usf) = free {
            self.slots[usf as usize].ms = Some(ms);
        }
        free
    }

    /// Release this MS's USF. With `reserve` the slot is quarantined for
    /// 5 seconds (the TBF died and the peer may still answer old grants);
    /// without, it frees immediately.
    pub fn free(&mut self, ms: MsId, now: Bsn, reserve: bool) -> Option<Usf> {
        for usf in USF_MIN..=USF_MAX {
            let slot = &mut self.slots[usf as usize];
            if slot.ms == Some(ms) {
                if reserve {
                    slot.dead_until.set_future(now, USF_DEAD_TIME_MS);
                } else {
                    slot.ms = None;
                    slot.dead_until.invalidate();
                }
                return Some(usf);
            }
        }
        None
    }

    /// Remember the USF granted in a downlink block. 0 is fine (no grant).
    pub fn remember(&mut self, usf: Usf, down_bsn: Bsn) {
        self.remembered[down_bsn.value() as usize % REMEMBER_LEN] = (down_bsn.value(), usf);
    }

    /// The USF that was granted for a given uplink block: it was carried in
    /// the downlink block one earlier (GSM 05.02 6.3.2.2.1).
    pub fn granted_for(&self, up_bsn: Bsn) -> Option<Usf> {
        let down = up_bsn.add(-1).value();
        let (bsn, usf) = self.remembered[down as usize % REMEMBER_LEN];
        if bsn == down {
            Some(usf)
        } else {
            None
        }
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = write!(out, "USFs=(");
        for usf in USF_MIN..=USF_MAX {
            let slot = &self.slots[usf as usize];
            match slot.ms {
                Some(ms) => {
                    let _ = write!(out, " {}=>{}{}", usf, ms, if slot.dead_until.valid() { "(dead)" } else { "" });
                }
                None => {
                    let _ = write!(out, " {}=>free", usf);
                }
            }
        }
        let _ = writeln!(out, ")");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn ms_ids(n: usize) -> Vec<MsId> {
        let mut arena: Arena<crate::msinfo::MsInfo> = Arena::new();
        (0..n)
            .map(|i| arena.insert(crate::msinfo::MsInfo::new(0x8000_0000 + i as u32, Bsn::new(0))))
            .collect()
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let now = Bsn::new(100);
        let mut t = UsfTable::new();
        let ids = ms_ids(7);
        let mut granted = Vec::new();
        for ms in &ids[..6] {
            let usf = t.allocate(*ms, now).unwrap();
            assert!((USF_MIN..=USF_MAX).contains(&usf));
            assert!(!granted.contains(&usf), "usf {} granted twice", usf);
            granted.push(usf);
        }
        // Seventh MS must fail, holders must be untouched
        assert_eq!(t.allocate(ids[6], now), None);
        for (ms, usf) in ids[..6].iter().zip(&granted) {
            assert_eq!(t.holder(*usf, now), Some(*ms));
        }
        // An existing holder re-allocating gets its own slot back
        assert_eq!(t.allocate(ids[2], now), Some(granted[2]));
    }

    #[test]
    fn test_dead_time() {
        let now = Bsn::new(0);
        let mut t = UsfTable::new();
        let ids = ms_ids(2);
        let usf = t.allocate(ids[0], now).unwrap();
        t.free(ids[0], now, true);

        // Quarantined: a different MS cannot take it...
        let other = t.allocate(ids[1], now.add(10)).unwrap();
        assert_ne!(other, usf);
        // ...but the original holder can reclaim it.
        assert_eq!(t.allocate(ids[0], now.add(10)), Some(usf));

        // Free again and wait out the 5 seconds: now anyone may have it.
        t.free(ids[0], now, true);
        let later = now.add_msecs(5100);
        assert_eq!(t.holder(usf, later), None);
        t.free(ids[1], later, false);
        assert_eq!(t.allocate(ids[1], later), Some(USF_MIN));
    }

    #[test]
    fn test_remember_ring() {
        let mut t = UsfTable::new();
        let down = Bsn::new(500);
        t.remember(3, down);
        assert_eq!(t.granted_for(down.add(1)), Some(3));
        assert_eq!(t.granted_for(down.add(2)), None);
        // Overwritten after the ring wraps
        t.remember(5, down.add(REMEMBER_LEN as i32));
        assert_eq!(t.granted_for(down.add(1)), None);
        assert_eq!(t.granted_for(down.add(REMEMBER_LEN as i32 + 1)), Some(5));
    }
}
