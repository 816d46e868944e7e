use std::collections::VecDeque;

use gprs_core::{Bsn, BsnTimer, Tlli, Usf};

use crate::arena::{Arena, ChanId, MsId, TbfId};
use crate::stats::{SignalQuality, StatHits};
use crate::tbf::{Tbf, TbfClass};
use gprs_core::direction::DirFilter;

/// A downlink PDU waiting in an MS's queue.
#[derive(Debug, Clone)]
pub struct QueuedPdu {
    /// The TLLI the upper layer addressed; differs from the MS record's
    /// current TLLI across a TLLI change procedure.
    pub tlli: Tlli,
    pub data: Vec<u8>,
    pub descr: String,
    pub enqueued_at: Bsn,
    /// Keep-alive filler for persistent mode; never marks a TBF non-idle.
    pub keepalive: bool,
}

/// Per-mobile record, one per TLLI (not per phone: an MS usually burns
/// through several TLLIs before registration settles).
///
/// Holds the channel assignment shared by all of the MS's TBFs, the
/// per-MS counters and timers from GSM 04.60 section 13, and the incoming
/// downlink queue. Everything here is owned by the scheduler's MS registry
/// and referenced by handle only.
pub struct MsInfo {
    pub id: MsId,
    /// TLLI used for downlink communication.
    pub tlli: Tlli,
    /// Previous TLLI, still recognized on the uplink after a TLLI change.
    pub old_tlli: Option<Tlli>,
    /// Another MSInfo that is the same physical phone, per the upper
    /// layer. Never followed for deletion, only to avoid launching
    /// conflicting assignments.
    pub alt_tlli: Option<Tlli>,
    /// Replaced by another record (the active record's old_tlli points
    /// here); no retries on behalf of this one.
    pub deprecated: bool,

    /// TBFs of this MS, both directions.
    pub tbfs: Vec<TbfId>,

    /// USF value per timeslot, 0 = none.
    pub usfs: [Usf; 8],
    /// Total USF grants; the engines compare against this to know whether
    /// the MS has had a chance to answer since the last ack/nack.
    pub num_usf_grants: u32,
    pub acknack_usf_grant: u32,
    /// For round-robin fairness between MS contending for the uplink.
    pub last_usf_grant: Bsn,

    /// Assigned channels. Multislot may be asymmetric; both lists are kept
    /// sorted by timeslot and all TBFs of the MS share them.
    pub ch_ups: Vec<ChanId>,
    pub ch_downs: Vec<ChanId>,
    /// The control channel of the multislot group: all messages for this
    /// MS go out here, and it is always bidirectional.
    pub pacch: Option<ChanId>,

    /// Unanswered USF grants (GSM 04.60 13, N3101).
    pub n3101: u32,
    pub t3168: BsnTimer,
    pub t3191: BsnTimer,
    pub t3193: BsnTimer,

    /// Ticks without any TBF; the record is forgotten when it exceeds the
    /// configured idle maximum.
    pub idle_blocks: u32,
    /// Why the downlink queue is stalled (1 active, 2 dead), for logging.
    pub stalled: u8,

    pub dl_queue: VecDeque<QueuedPdu>,

    /// When the MS last talked to us / we last talked to it. Used by the
    /// non-responsive watchdog, so they count anything, not just data.
    pub talk_up: BsnTimer,
    pub talk_down: BsnTimer,

    /// Instantaneous traffic estimate, incremented per block and halved
    /// every 24 blocks; used to pick the least busy channel.
    pub traffic_metric: u32,

    pub sig: SignalQuality,
    pub stat_ccch_res: StatHits,
    pub stat_rrbp_res: StatHits,
    pub stat_blocks: StatHits,

    pub bytes_up: u64,
    pub bytes_down: u64,
    pub count_tbfs: u32,
    pub count_tbf_fail: u32,
    pub count_tbf_no_connect: u32,
}

impl MsInfo {
    pub fn new(tlli: Tlli, now: Bsn) -> MsInfo {
        let mut talk = BsnTimer::new();
        talk.set_now(now);
        MsInfo {
            id: MsId::invalid(),
            tlli,
            old_tlli: None,
            alt_tlli: None,
            deprecated: false,
            tbfs: Vec::new(),
            usfs: [0; 8],
            num_usf_grants: 0,
            acknack_usf_grant: 0,
            last_usf_grant: Bsn::INVALID,
            ch_ups: Vec::new(),
            ch_downs: Vec::new(),
            pacch: None,
            n3101: 0,
            t3168: BsnTimer::new(),
            t3191: BsnTimer::new(),
            t3193: BsnTimer::new(),
            idle_blocks: 0,
            stalled: 0,
            dl_queue: VecDeque::new(),
            talk_up: talk,
            talk_down: talk,
            traffic_metric: 0,
            sig: SignalQuality::default(),
            stat_ccch_res: StatHits::default(),
            stat_rrbp_res: StatHits::default(),
            stat_blocks: StatHits::default(),
            bytes_up: 0,
            bytes_down: 0,
            count_tbfs: 0,
            count_tbf_fail: 0,
            count_tbf_no_connect: 0,
        }
    }

    /// Called on every communication from the MS.
    pub fn talked_up(&mut self, now: Bsn, double_count: bool) {
        self.talk_up.set_now(now);
        if !double_count {
            self.traffic_metric += 1;
        }
    }

    pub fn talked_down(&mut self, now: Bsn) {
        self.talk_down.set_now(now);
        self.traffic_metric += 1;
    }

    /// A USF was granted to this MS. The penalty counts toward N3101; we
    /// are supposed to count unanswered grants, not grants, so N3101 max
    /// carries a little slack.
    pub fn count_usf_grant(&mut self, now: Bsn, penalize: bool) {
        self.last_usf_grant = now;
        self.num_usf_grants += 1;
        if penalize {
            self.n3101 += 1;
        }
    }

    /// Drop the channel binding. The next session re-picks the least
    /// loaded channel instead of inheriting a stale assignment. The USFs
    /// must already have been returned to their tables.
    pub fn deassign_channels(&mut self) {
        self.ch_ups.clear();
        self.ch_downs.clear();
        self.pacch = None;
        self.usfs = [0; 8];
    }

    pub fn can_use_downlink(&self, chan: ChanId) -> bool {
        self.ch_downs.contains(&chan)
    }

    pub fn can_use_uplink(&self, chan: ChanId) -> bool {
        self.ch_ups.contains(&chan)
    }

    /// Downlink timeslots as a mask per GSM 04.60 12.18: bit 8 is
    /// timeslot 0, bit 7 timeslot 1, and so on.
    pub fn downlink_timeslot_mask(&self, channels: &Arena<crate::pdch::Pdch>) -> u8 {
        let mut mask = 0u8;
        for chan in &self.ch_downs {
            if let Some(pdch) = channels.get(*chan) {
                mask |= 1 << (7 - pdch.tn);
            }
        }
        mask
    }

    /// Count this MS's TBFs matching a direction and state class. The
    /// caller must separately account for any TBF it has checked out of
    /// the arena. Returns the count and an arbitrary matching TBF.
    pub fn count_tbfs(&self, tbfs: &Arena<Tbf>, dir: DirFilter, class: TbfClass) -> (usize, Option<TbfId>) {
        let mut count = 0;
        let mut found = None;
        for id in &self.tbfs {
            let Some(tbf) = tbfs.get(*id) else { continue };
            if !dir.matches(tbf.core.dir) {
                continue;
            }
            if !class.matches(tbf.core.state()) {
                continue;
            }
            found = Some(*id);
            count += 1;
        }
        (count, found)
    }

    /// Adopt a new TLLI assigned by the upper layer after a successful
    /// attach. The old one must still be recognized on the uplink.
    pub fn change_tlli(&mut self, new_tlli: Tlli) {
        if self.tlli == new_tlli {
            return;
        }
        tracing::info!("MS {} TLLI change {:08x} -> {:08x}", self.id, self.tlli, new_tlli);
        self.old_tlli = Some(self.tlli);
        self.tlli = new_tlli;
    }

    pub fn matches_tlli(&self, tlli: Tlli) -> bool {
        gprs_core::tlli_eq(self.tlli, tlli) || self.old_tlli.map(|t| gprs_core::tlli_eq(t, tlli)).unwrap_or(false)
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = writeln!(
            out,
            "MS {} tlli={:08x} old={:?} tbfs={} chans={}d/{}u pacch={:?} queue={} n3101={} rssi=({}) bytes={}/{}",
            self.id,
            self.tlli,
            self.old_tlli.map(|t| format!("{:08x}", t)),
            self.tbfs.len(),
            self.ch_downs.len(),
            self.ch_ups.len(),
            self.pacch,
            self.dl_queue.len(),
            self.n3101,
            self.sig.rssi,
            self.bytes_down,
            self.bytes_up,
        );
    }
}

impl std::fmt::Display for MsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MS({:08x})", self.tlli)
    }
}
