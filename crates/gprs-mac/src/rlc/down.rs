use gprs_core::{Bsn, BsnTimer};
use gprs_config::StackConfig;
use gprs_msgs::{AckNackDescription, DlDataBlock, LiOctet, ACKNACK_BITMAP_LEN, FILL_OCTET};

use crate::msinfo::{MsInfo, QueuedPdu};
use crate::ports::UpperLayer;
use crate::rlc::{add_sn, delta_sn, delta_sns, next_sn, SNS, WS};
use crate::sched::{Mac, PollMode, TxCounter};
use crate::tbf::{CancelMode, EngineAction, MsgTransType, StopCause, TbfCore};

const MAX_PDUS_PER_BLOCK: usize = 10;

/// Downlink RLC engine: segments queued PDUs into data blocks and runs the
/// acknowledged-mode send window.
///
/// Blocks are produced lazily, one per service call, because new data may
/// be appended to the session right up to the moment of transmission.
pub struct DownEngine {
    /// Next block to send. Rewound to va on stall or after an ack/nack.
    vs: u8,
    /// Oldest unacknowledged block; only advance_va moves it.
    va: u8,
    /// Ack status per sequence number.
    vb: [bool; SNS],
    /// Blocks kept for retransmission. The slot owns the block; the
    /// transmit path gets a copy.
    txq: Vec<Option<DlDataBlock>>,
    /// One past the newest block ever produced; wraps.
    txq_num: u8,

    /// SSN of the previous ack/nack, to detect a peer that is not
    /// advancing.
    prev_ack_ssn: u8,
    /// Resend blocks with sequence numbers before this.
    resend_ssn: u8,
    prev_ack_block_count: u32,

    stalled: bool,
    /// The block carrying FBI has been produced.
    finished: bool,
    all_acked: bool,

    poll_interval: u32,
    blocks_since_poll: u32,

    total_blocks_sent: u32,
    total_data_blocks_sent: u32,
    unique_data_blocks_sent: u32,

    /// Remaining octets of the PDU currently being segmented.
    cur_pdu: Vec<u8>,
    cur_keepalive: bool,
    /// The most recent sdu, kept so a failed TBF can be retried.
    last_pdu: Option<QueuedPdu>,

    keepalive_timer: BsnTimer,
    persist_timer: BsnTimer,
}

impl DownEngine {
    pub fn new(poll_interval: u32) -> DownEngine {
        DownEngine {
            vs: 0,
            va: 0,
            vb: [false; SNS],
            txq: (0..SNS).map(|_| None).collect(),
            txq_num: 0,
            prev_ack_ssn: 0,
            resend_ssn: 0,
            prev_ack_block_count: 0,
            stalled: false,
            finished: false,
            all_acked: false,
            poll_interval,
            blocks_since_poll: 0,
            total_blocks_sent: 0,
            total_data_blocks_sent: 0,
            unique_data_blocks_sent: 0,
            cur_pdu: Vec::new(),
            cur_keepalive: false,
            last_pdu: None,
            keepalive_timer: BsnTimer::new(),
            persist_timer: BsnTimer::new(),
        }
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn pending_bytes(&self) -> usize {
        self.cur_pdu.len()
    }

    pub fn window_used(&self) -> i32 {
        delta_sns(self.vs, self.va)
    }

    /// Hand the engine its first PDU. Later PDUs are pulled off the MS
    /// queue as blocks are filled.
    pub fn write_high_side(&mut self, ms: &mut MsInfo, pdu: QueuedPdu) {
        ms.dl_queue.push_front(pdu);
    }

    pub fn take_retry_pdu(&mut self) -> Option<QueuedPdu> {
        self.last_pdu.take()
    }

    fn persistent(&self, cfg: &StackConfig) -> bool {
        !self.finished && cfg.downlink.persist_ms > 0
    }

    /// The queue head is usable unless it carries a TLLI change: that one
    /// waits for the next TBF, which will adopt the new TLLI.
    fn queue_front_usable(ms: &MsInfo) -> bool {
        match ms.dl_queue.front() {
            None => false,
            Some(pdu) => {
                if pdu.tlli != ms.tlli {
                    tracing::debug!("TLLI change {:08x} -> {:08x} queued; ending TBF first", ms.tlli, pdu.tlli);
                    false
                } else {
                    true
                }
            }
        }
    }

    fn data_avail(&self, ms: &MsInfo) -> bool {
        !self.cur_pdu.is_empty() || Self::queue_front_usable(ms)
    }

    /// Pack the next data block from the PDU stream: possibly the tail of
    /// one PDU, whole PDUs, and the head of the next, sliced by length
    /// indicator octets (GSM 04.60 10.4.14 and Annex B).
    fn fill_block(&mut self, core: &mut TbfCore, ms: &mut MsInfo, cfg: &StackConfig, _now: Bsn, sn: u8) -> Option<DlDataBlock> {
        let coding = core.coding(ms, cfg);
        let payload_size = coding.payload_size() as i32;
        let mut avail = payload_size;

        // (length, more-bit) per indicator; the e bit is set on the last.
        let mut li: Vec<(u8, bool)> = Vec::new();
        let mut segs: Vec<Vec<u8>> = Vec::new();
        let mut non_idle = !self.cur_pdu.is_empty() && !self.cur_keepalive;
        let mut fbi = false;

        while avail > 0 && segs.len() < MAX_PDUS_PER_BLOCK && li.len() < MAX_PDUS_PER_BLOCK {
            if self.cur_pdu.is_empty() && Self::queue_front_usable(ms) {
                let pdu = ms.dl_queue.pop_front().unwrap();
                ms.bytes_down += pdu.data.len() as u64;
                self.cur_pdu = pdu.data.clone();
                self.cur_keepalive = pdu.keepalive;
                if !pdu.keepalive {
                    non_idle = true;
                }
                core.descr = pdu.descr.clone();
                tracing::debug!("{} <= pdu size={} descr={}", core.id, pdu.data.len(), pdu.descr);
                self.last_pdu = Some(pdu);
            }

            let sdusize = self.cur_pdu.len() as i32;
            if sdusize == 0 {
                break;
            }

            if sdusize > avail || (sdusize == avail && !segs.is_empty()) {
                // PDU continues into the next block: no indicator for it.
                if let Some(last) = li.last_mut() {
                    last.1 = true;
                }
                segs.push(self.cur_pdu.drain(..avail as usize).collect());
                avail = 0;
            } else if sdusize == avail && segs.is_empty() {
                // Singular case: the PDU would exactly fill the block. Emit
                // a zero length indicator and push its final octet to the
                // next block.
                li.push((0, false));
                avail -= 1;
                segs.push(self.cur_pdu.drain(..avail as usize).collect());
                avail = 0;
            } else {
                // Whole PDU fits with room to spare.
                if avail == 1 {
                    break; // too small to be useful
                }
                if let Some(last) = li.last_mut() {
                    last.1 = true;
                }
                li.push((sdusize as u8, false));
                let whole: Vec<u8> = std::mem::take(&mut self.cur_pdu);
                segs.push(whole);
                avail -= 1 + sdusize;
            }
        }

        if segs.is_empty() {
            // No data ready; only possible in persistent mode.
            return None;
        }

        if !self.data_avail(ms) && !self.persistent(cfg) {
            fbi = true;
        }
        if fbi {
            self.finished = true;
        }

        let mut block = DlDataBlock::new(coding);
        block.sn = sn;
        block.fbi = fbi;
        block.idle = !non_idle;
        if li.is_empty() {
            // Entire block is payload of one PDU.
            block.extended = true;
            debug_assert!(segs.len() == 1 && segs[0].len() as i32 == payload_size);
            block.payload = segs.pop().unwrap();
        } else {
            block.extended = false;
            let mut payload = Vec::with_capacity(payload_size as usize);
            let last = li.len() - 1;
            for (i, (len, m)) in li.iter().enumerate() {
                payload.push(
                    LiOctet {
                        li: *len,
                        m: *m,
                        e: i == last,
                    }
                    .to_octet(),
                );
            }
            for seg in &segs {
                payload.extend_from_slice(seg);
            }
            payload.resize(payload_size as usize, FILL_OCTET);
            block.payload = payload;
        }
        Some(block)
    }

    /// Pull-based producer: the block at `sn`, synthesized on demand when
    /// `sn` is one past everything sent so far. Once the final block
    /// exists, asking past the end returns it again: the MS must
    /// re-acknowledge the final block no matter what came before.
    fn get_block(&mut self, core: &mut TbfCore, ms: &mut MsInfo, cfg: &StackConfig, now: Bsn, sn: u8) -> Option<DlDataBlock> {
        self.total_data_blocks_sent += 1;
        if sn == self.txq_num {
            if let Some(prev) = &self.txq[add_sn(sn, -1) as usize] {
                if prev.fbi {
                    return Some(prev.clone());
                }
            }

            // Manufacture the next block.
            let block = self.fill_block(core, ms, cfg, now, sn)?;
            self.unique_data_blocks_sent += 1;
            ms.stat_blocks.add_hit();
            self.all_acked = false;
            self.vb[sn as usize] = false;
            self.txq[sn as usize] = Some(block.clone());
            self.txq_num = next_sn(self.txq_num);
            Some(block)
        } else {
            ms.stat_blocks.add_miss();
            self.txq[sn as usize].clone()
        }
    }

    /// Advance va over the contiguous acknowledged prefix. This is the
    /// only place that moves va.
    fn advance_va(&mut self) {
        while self.va != self.txq_num && self.vb[self.va as usize] {
            self.va = next_sn(self.va);
        }
    }

    fn resend_needed(&self, sn: u8) -> bool {
        if self.vb[sn as usize] {
            return false; // positively acknowledged
        }
        if self.stalled {
            return true; // resend everything ever sent
        }
        // Unacked but after the most recent ack's SSN: the MS has not had
        // a chance to acknowledge it yet, so it is not a resend candidate.
        delta_sn(sn, self.resend_ssn) < 0
    }

    /// Advance vs to the next block needing (re)send; detect stall when
    /// the window would be exceeded and rewind to the oldest unacked.
    fn advance_vs(&mut self) {
        while self.vs != self.txq_num && !self.resend_needed(self.vs) {
            self.vs = next_sn(self.vs);
        }
        // Stay one inside the 64-block window to keep clear of the
        // ambiguous edge, on our side and the MS's.
        if delta_sns(self.vs, self.va) >= (WS - 1) as i32 {
            self.stalled = true;
            self.vs = self.va;
        }
    }

    /// Apply a Packet Downlink Ack/Nack. Idempotent: the same bitmap twice
    /// leaves the engine unchanged after the second application.
    pub fn recv_acknack(
        &mut self,
        core: &mut TbfCore,
        ms: &mut MsInfo,
        cfg: &StackConfig,
        _now: Bsn,
        desc: &AckNackDescription,
    ) -> Option<EngineAction> {
        self.stalled = false; // until proven otherwise
        self.blocks_since_poll = 0;

        if desc.final_ack {
            // All done; overkill-ack the whole queue to be safe.
            self.vb = [true; SNS];
            self.all_acked = true;
        } else {
            // The bitmap is indexed backwards from the SSN the MS chose
            // (its VR). Bits it already acked earlier may be absent, so a
            // clear bit means nothing by itself.
            let mut received_new = false;
            let mut absn = desc.ssn;
            for i in 1..=ACKNACK_BITMAP_LEN {
                absn = add_sn(absn, -1);
                if desc.bitmap[ACKNACK_BITMAP_LEN - i] {
                    if !self.vb[absn as usize] {
                        received_new = true;
                    }
                    self.vb[absn as usize] = true;
                }
            }

            // A peer that keeps acknowledging without advancing (e.g. it
            // thinks this TBF continues an older one) would handshake
            // forever; count blocks sent since the last progress and bail.
            let stuck = desc.ssn == self.prev_ack_ssn;
            if stuck && !received_new {
                tracing::debug!("{} ack window stuck at ssn={}", core.id, desc.ssn);
                if self.total_blocks_sent.saturating_sub(self.prev_ack_block_count) > cfg.counters.stuck_window_blocks {
                    return Some(EngineAction::Cancel(StopCause::Stuck, CancelMode::RetryAfterRelease));
                }
            } else {
                self.prev_ack_block_count = self.total_blocks_sent;
            }
            self.prev_ack_ssn = desc.ssn;

            self.resend_ssn = desc.ssn;
            if stuck || self.finished {
                // Resend everything outstanding.
                self.resend_ssn = self.txq_num;
            } else {
                // The ack/nack lags vs by an amount depending on how many
                // downlink channels are running; widen the resend range if
                // the SSN fell further behind than that.
                let slip = (6 * ms.ch_downs.len().max(1)) as i32;
                if delta_sns(self.txq_num, self.resend_ssn) > slip {
                    self.resend_ssn = add_sn(self.txq_num, -slip);
                }
            }
        }

        self.advance_va();

        if self.va == self.txq_num {
            self.all_acked = true;
            if self.finished {
                return Some(EngineAction::FinishSuccess);
            }
            return None;
        }

        // Rewind to the oldest unacked block, then skip over blocks that
        // were not negatively acknowledged.
        self.vs = self.va;
        self.advance_vs();
        None
    }

    /// One service call, one block at most. Returns whether the downlink
    /// was used.
    pub fn service(&mut self, core: &mut TbfCore, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> (bool, Option<EngineAction>) {
        let cfg = mac.cfg.clone();
        let now = mac.now();

        let mut advanced = true;
        let block = match self.get_block(core, ms, &cfg, now, self.vs) {
            Some(b) => b,
            None => {
                // Data exhausted, vs == txq_num. The final block, if any,
                // only goes out on the primary channel.
                if !core.is_primary(ms, chan) {
                    return (false, None);
                }
                if self.all_acked {
                    // Quiescent persistent TBF; feed the keep-alive.
                    if self.persistent(&cfg)
                        && cfg.downlink.keepalive_ms > 0
                        && self.keepalive_timer.elapsed_msecs(now) > cfg.downlink.keepalive_ms as i32
                    {
                        mac.upper.keepalive(ms.tlli);
                        self.keepalive_timer.set_now(now);
                    }
                    return (false, None);
                }
                if !self.finished {
                    return (false, None);
                }
                // Resend the final block until the final ack arrives.
                advanced = false;
                match self.get_block(core, ms, &cfg, now, add_sn(self.vs, -1)) {
                    Some(b) => b,
                    None => return (false, None),
                }
            }
        };

        let mut block = block;
        if block.idle {
            if !self.finished && self.persist_timer.valid() && self.persist_timer.expired(now) {
                // Persistence ran out; turn this keep-alive into the end.
                block.fbi = true;
                self.finished = true;
                if let Some(stored) = &mut self.txq[block.sn as usize] {
                    stored.fbi = true;
                }
            }
        } else if self.persistent(&cfg) {
            if cfg.downlink.keepalive_ms > 0 {
                self.keepalive_timer.set_now(now);
            }
            if cfg.downlink.persist_ms > 0 {
                self.persist_timer.set_future(now, cfg.downlink.persist_ms);
            }
        }

        if block.fbi {
            // The final block must carry a reservation for the final
            // ack/nack, and we only run one reservation at a time.
            if !core.is_primary(ms, chan) {
                return (false, None);
            }
            if core.trans.pending(now) {
                return (false, None);
            }
            if !mac.stage_data(chan, core, ms, block, PollMode::Required, MsgTransType::DataFinal, TxCounter::N3105) {
                return (false, None);
            }
            ms.t3191.set_future(now, cfg.timers.t3191);
            self.total_blocks_sent += 1;
            return (true, None);
        }

        let mut poll = PollMode::No;
        if self.stalled {
            // Every stall resend carries a reservation.
            if !core.is_primary(ms, chan) {
                return (false, None);
            }
            if core.trans.pending(now) {
                return (false, None);
            }
            poll = PollMode::Required;
        } else if core.is_primary(ms, chan) {
            self.blocks_since_poll += 1;
            if self.blocks_since_poll >= self.poll_interval && !core.trans.pending(now) {
                poll = PollMode::IfPossible;
            }
        }

        let sent = mac.stage_data(chan, core, ms, block, poll, MsgTransType::Transmit, TxCounter::N3105);
        debug_assert!(sent);
        if advanced {
            self.vs = next_sn(self.vs);
            self.advance_vs();
        }
        self.total_blocks_sent += 1;
        (true, None)
    }

    /// Produce blocks until the engine runs dry, without the scheduler.
    #[cfg(test)]
    pub(crate) fn produce_all_for_test(
        &mut self,
        core: &mut TbfCore,
        ms: &mut MsInfo,
        cfg: &StackConfig,
        now: Bsn,
    ) -> Vec<DlDataBlock> {
        let mut out = Vec::new();
        loop {
            match self.get_block(core, ms, cfg, now, self.vs) {
                Some(b) => {
                    let fbi = b.fbi;
                    self.vs = next_sn(self.vs);
                    self.advance_vs();
                    out.push(b);
                    if fbi {
                        break;
                    }
                }
                None => break,
            }
            assert!(out.len() < 300, "runaway block production");
        }
        out
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = writeln!(
            out,
            "down: vs={} va={} txq_num={} stalled={} finished={} resend_ssn={} sent={}/{}",
            self.vs,
            self.va,
            self.txq_num,
            self.stalled,
            self.finished,
            self.resend_ssn,
            self.unique_data_blocks_sent,
            self.total_data_blocks_sent,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gprs_core::ChannelCoding;

    fn fixture() -> (TbfCore, MsInfo, StackConfig, Bsn) {
        let cfg = StackConfig::default();
        let now = Bsn::new(1000);
        let mut ms = MsInfo::new(0xc000_0001, now);
        let tbf = crate::tbf::Tbf::new_down(
            &mut ms,
            QueuedPdu {
                tlli: 0xc000_0001,
                data: vec![],
                descr: String::new(),
                enqueued_at: now,
                keepalive: false,
            },
            ChannelCoding::Cs1,
            &cfg,
            now,
        );
        let mut core = tbf.core;
        core.id = crate::tbf::tests_support::dummy_tbf_ids(1)[0];
        ms.dl_queue.clear();
        (core, ms, cfg, now)
    }

    fn engine_with_pdu(data: Vec<u8>) -> (DownEngine, TbfCore, MsInfo, StackConfig, Bsn) {
        let (core, mut ms, cfg, now) = fixture();
        let mut eng = DownEngine::new(cfg.downlink.poll_interval);
        let tlli = ms.tlli;
        eng.write_high_side(
            &mut ms,
            QueuedPdu {
                tlli,
                data,
                descr: "test".into(),
                enqueued_at: now,
                keepalive: false,
            },
        );
        (eng, core, ms, cfg, now)
    }

    fn drain_blocks(eng: &mut DownEngine, core: &mut TbfCore, ms: &mut MsInfo, cfg: &StackConfig, now: Bsn) -> Vec<DlDataBlock> {
        eng.produce_all_for_test(core, ms, cfg, now)
    }

    #[test]
    fn test_single_block_pdu() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu(vec![7; payload - 5]);
        let blocks = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].fbi);
        assert!(!blocks[0].extended);
        let li = LiOctet::from_octet(blocks[0].payload[0]);
        assert_eq!(li.li as usize, payload - 5);
        assert!(li.e);
        assert!(!li.m);
        // Fill octets pad to the payload size
        assert_eq!(blocks[0].payload.len(), payload);
        assert_eq!(blocks[0].payload[payload - 1], FILL_OCTET);
    }

    #[test]
    fn test_exact_fit_uses_singular_case() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu(vec![9; payload]);
        let blocks = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        // The zero-LI singular case pushes the final octet to a 2nd block
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].fbi);
        let li = LiOctet::from_octet(blocks[0].payload[0]);
        assert_eq!(li.li, 0);
        assert!(blocks[1].fbi);
    }

    #[test]
    fn test_multi_block_segmentation() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu((0..255u8).cycle().take(payload * 3 + 7).collect());
        let blocks = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        assert_eq!(blocks.len(), 4);
        for b in &blocks[..3] {
            assert!(b.extended, "full blocks carry no LI octets");
            assert_eq!(b.payload.len(), payload);
        }
        assert!(blocks[3].fbi);
        // Sequence numbers are consecutive
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.sn as usize, i);
        }
    }

    fn acknack_upto(ssn: u8, acked: &[u8]) -> AckNackDescription {
        let mut desc = AckNackDescription {
            final_ack: false,
            ssn,
            bitmap: [false; ACKNACK_BITMAP_LEN],
        };
        // bitmap[64-i] covers (ssn - i) mod 128
        for i in 1..=ACKNACK_BITMAP_LEN {
            let sn = add_sn(ssn, -(i as i32));
            if acked.contains(&sn) {
                desc.bitmap[ACKNACK_BITMAP_LEN - i] = true;
            }
        }
        desc
    }

    #[test]
    fn test_acknack_advances_window_and_is_idempotent() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu(vec![1; payload * 5]);
        let blocks = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        assert_eq!(blocks.len(), 6);

        // Ack 0,1,3 with ssn=4: va advances over the acked prefix only
        let desc = acknack_upto(4, &[0, 1, 3]);
        let r = eng.recv_acknack(&mut core, &mut ms, &cfg, now, &desc);
        assert!(r.is_none());
        assert_eq!(eng.va, 2);
        // vs rewound to oldest unacked
        assert_eq!(eng.vs, 2);

        let snapshot = (eng.va, eng.vs, eng.vb, eng.resend_ssn, eng.all_acked);
        let r2 = eng.recv_acknack(&mut core, &mut ms, &cfg, now, &desc);
        assert!(r2.is_none());
        assert_eq!(snapshot, (eng.va, eng.vs, eng.vb, eng.resend_ssn, eng.all_acked));
    }

    #[test]
    fn test_final_ack_finishes() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu(vec![1; payload]);
        let _ = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        assert!(eng.finished);
        let desc = AckNackDescription::new_final();
        let r = eng.recv_acknack(&mut core, &mut ms, &cfg, now, &desc);
        assert_eq!(r, Some(EngineAction::FinishSuccess));
        assert!(eng.all_acked);
    }

    #[test]
    fn test_window_invariant_stall_and_rewind() {
        let payload = ChannelCoding::Cs1.payload_size();
        // Enough data to overrun the window with nothing acked
        let (mut eng, mut core, mut ms, cfg, now) = engine_with_pdu(vec![2; payload * 100]);
        let mut produced = 0;
        for _ in 0..200 {
            let before = eng.vs;
            match eng.get_block(&mut core, &mut ms, &cfg, now, eng.vs) {
                Some(_) => {
                    produced += 1;
                    eng.vs = next_sn(before);
                    eng.advance_vs();
                }
                None => break,
            }
            assert!(eng.window_used() <= WS as i32, "window invariant violated");
            if eng.stalled {
                break;
            }
        }
        assert!(eng.stalled, "unacked transfer must stall");
        assert_eq!(eng.vs, eng.va, "stall rewinds to the oldest unacked block");
        assert_eq!(produced, WS - 1);
    }

    #[test]
    fn test_stuck_detection() {
        let payload = ChannelCoding::Cs1.payload_size();
        let (mut eng, mut core, mut ms, mut cfg, now) = engine_with_pdu(vec![3; payload * 4]);
        cfg.counters.stuck_window_blocks = 10;
        let _ = drain_blocks(&mut eng, &mut core, &mut ms, &cfg, now);
        eng.total_blocks_sent = 100;

        // Same SSN, no new acks, repeatedly
        let desc = acknack_upto(1, &[]);
        let r1 = eng.recv_acknack(&mut core, &mut ms, &cfg, now, &desc);
        assert!(r1.is_none());
        eng.total_blocks_sent += 20;
        let r2 = eng.recv_acknack(&mut core, &mut ms, &cfg, now, &desc);
        assert_eq!(r2, Some(EngineAction::Cancel(StopCause::Stuck, CancelMode::RetryAfterRelease)));
    }
}
