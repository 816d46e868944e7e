use gprs_core::Bsn;
use gprs_msgs::RadData;

use crate::arena::TbfId;
use crate::tbf::MsgTransType;

/// Why a future uplink block is spoken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResKind {
    /// Single-block answer to a RACH; no TBF exists yet, we do not even
    /// know which MS it is. If the block never arrives, nobody ever knows;
    /// the MS runs its own timer and RACHes again.
    Rach,
    /// Poll attached to a message sent on the control channel (CCCH).
    Poll,
    /// RRBP reservation carried in a downlink block.
    Rrbp,
}

#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub bsn: Bsn,
    pub kind: ResKind,
    /// Which pending message transaction the answer belongs to.
    pub subtype: MsgTransType,
    pub tbf: Option<TbfId>,
    /// Signal data saved from a RACH, applied to the MS when it answers.
    pub rad: Option<RadData>,
}

/// The RRBP field can only name blocks 3..=6 ahead of the block carrying it.
const RRBP_BASE: i32 = 3;
const RRBP_CODES: i32 = 4;

const RING_SIZE: usize = 1000;

/// Reservations of future uplink radio blocks, a ring indexed by BSN.
///
/// Entries are kept around after their time passes so late uplink blocks
/// can still be paired with the message they answer; the scheduler expires
/// them a few blocks behind the current time.
pub struct ReservationRing {
    slots: Vec<Option<Reservation>>,
}

impl Default for ReservationRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationRing {
    pub fn new() -> ReservationRing {
        ReservationRing {
            slots: vec![None; RING_SIZE],
        }
    }

    fn index(bsn: Bsn) -> usize {
        bsn.value() as usize % RING_SIZE
    }

    /// Make an RRBP reservation. Returns the reserved BSN and the RRBP
    /// code 0..=3, or None when all four candidate blocks are taken;
    /// callers treat that as "try again on a later tick".
    pub fn make_rrbp(
        &mut self,
        now: Bsn,
        tbf: TbfId,
        subtype: MsgTransType,
        rrbp_min: u32,
        odd_only: bool,
    ) -> Option<(Bsn, u8)> {
        let mut rrbp = rrbp_min as i32;
        while rrbp < RRBP_CODES {
            let bsn = now.add(RRBP_BASE + rrbp);
            if self.try_commit(bsn, ResKind::Rrbp, subtype, Some(tbf), None, odd_only) {
                return Some((bsn, rrbp as u8));
            }
            rrbp += 1;
        }
        tracing::debug!("make_rrbp: no free block in {}..{} for {}", now.add(RRBP_BASE), now.add(RRBP_BASE + RRBP_CODES), tbf);
        None
    }

    /// Make a RACH or control-channel poll reservation at or after
    /// `first`, which the caller sets far enough ahead to cover the
    /// control channel's queue drain time.
    pub fn make_after(
        &mut self,
        first: Bsn,
        kind: ResKind,
        subtype: MsgTransType,
        tbf: Option<TbfId>,
        rad: Option<RadData>,
        odd_only: bool,
    ) -> Option<Bsn> {
        debug_assert!(kind != ResKind::Rrbp);
        for offset in 0..(RING_SIZE as i32 - 1) {
            let bsn = first.add(offset);
            if self.try_commit(bsn, kind, subtype, tbf, rad, odd_only) {
                return Some(bsn);
            }
        }
        tracing::warn!("make_after: reservation ring full from {}", first);
        None
    }

    fn try_commit(
        &mut self,
        bsn: Bsn,
        kind: ResKind,
        subtype: MsgTransType,
        tbf: Option<TbfId>,
        rad: Option<RadData>,
        odd_only: bool,
    ) -> bool {
        if odd_only && bsn.value() % 2 == 0 {
            return false;
        }
        let slot = &mut self.slots[Self::index(bsn)];
        if let Some(existing) = slot {
            if existing.bsn == bsn {
                return false;
            }
            // Stale entry from a previous lap of the ring; reusable.
        }
        *slot = Some(Reservation {
            bsn,
            kind,
            subtype,
            tbf,
            rad,
        });
        true
    }

    pub fn get(&self, bsn: Bsn) -> Option<&Reservation> {
        self.slots[Self::index(bsn)].as_ref().filter(|r| r.bsn == bsn)
    }

    /// Look up and consume the reservation for an arriving block.
    pub fn recv(&mut self, bsn: Bsn) -> Option<Reservation> {
        let slot = &mut self.slots[Self::index(bsn)];
        if slot.map(|r| r.bsn == bsn).unwrap_or(false) {
            slot.take()
        } else {
            None
        }
    }

    /// Clear the reservation at bsn. With a TBF given, only if it belongs
    /// to that TBF.
    pub fn clear(&mut self, bsn: Bsn, tbf: Option<TbfId>) {
        let slot = &mut self.slots[Self::index(bsn)];
        if let Some(r) = slot {
            if r.bsn != bsn {
                return;
            }
            if let Some(tbf) = tbf {
                if r.tbf != Some(tbf) {
                    return;
                }
            }
            *slot = None;
        }
    }

    /// Expire the entry whose time has passed beyond all hope of an
    /// answer. Called once per tick with a lagged BSN.
    pub fn expire(&mut self, bsn: Bsn) -> Option<Reservation> {
        let slot = &mut self.slots[Self::index(bsn)];
        if slot.map(|r| r.bsn == bsn).unwrap_or(false) {
            slot.take()
        } else {
            None
        }
    }

    /// All live reservations, in ring order.
    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.slots.iter().flatten()
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = write!(out, "Reservations=(");
        for r in self.slots.iter().flatten() {
            let _ = write!(out, " bsn={} {:?}", r.bsn, r.kind);
            if let Some(tbf) = r.tbf {
                let _ = write!(out, " {}", tbf);
            }
        }
        let _ = writeln!(out, ")");
    }
}
