use gprs_core::{Bsn, BsnTimer};
use gprs_config::StackConfig;
use gprs_msgs::{AckNackDescription, DlMsg, LiOctet, PacketUplinkAckNack, UlDataBlock, ACKNACK_BITMAP_LEN};

use crate::msinfo::MsInfo;
use crate::ports::UpperLayer;
use crate::rlc::{add_sn, delta_sn, next_sn, SNS, WS};
use crate::sched::{Mac, PollMode, TxCounter};
use crate::tbf::{EngineAction, MsgTransType, TbfCore, TbfState};

/// Progress of the uplink transfer, beyond the TBF state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpState {
    Transmit,
    /// Persistent mode: all current data received, TBF held open.
    Quiescent,
    /// Winding down a persistent TBF: waiting out the last granted USFs
    /// before sending the final ack/nack.
    PersistFinal,
    /// All blocks received; the final ack/nack is being delivered.
    Finished,
}

/// Uplink RLC engine: receives blocks out of order, reassembles PDUs via
/// the length indicator octets, and produces ack/nack messages.
pub struct UpEngine {
    /// One past the highest block received.
    vr: u8,
    /// Lowest block not yet received (window base).
    vq: u8,
    /// Receive status per sequence number.
    vn: [bool; SNS],
    /// Assembly queue for inbound blocks.
    rxq: Vec<Option<UlDataBlock>>,

    /// PDU under assembly; None before the first octet arrives.
    cur_pdu: Option<Vec<u8>>,
    /// The PDU did not finish in this TBF; the MS needs another TBF for
    /// the rest, and we discard the fragment.
    incomplete_pdu: bool,

    /// MS reported its send window blocked (SI bit).
    stalled: bool,
    blocks_since_acknack: u32,
    total_blocks: u32,
    unique_blocks: u32,
    /// From the channel request; advisory only.
    bytes_pending: u32,
    start_usf_grants: u32,

    state: UpState,
    persistent_mode: bool,
    persist_final_end: Bsn,
    keepalive_timer: BsnTimer,
    persist_timer: BsnTimer,
}

impl UpEngine {
    pub fn new(octet_count: u16, persistent_mode: bool, start_usf_grants: u32) -> UpEngine {
        UpEngine {
            vr: 0,
            vq: 0,
            vn: [false; SNS],
            rxq: (0..SNS).map(|_| None).collect(),
            cur_pdu: None,
            incomplete_pdu: false,
            stalled: false,
            blocks_since_acknack: 0,
            total_blocks: 0,
            unique_blocks: 0,
            bytes_pending: octet_count as u32,
            start_usf_grants,
            state: UpState::Transmit,
            persistent_mode,
            persist_final_end: Bsn::INVALID,
            keepalive_timer: BsnTimer::new(),
            persist_timer: BsnTimer::new(),
        }
    }

    pub fn up_state(&self) -> UpState {
        self.state
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    /// Does this TBF currently want USF grants? Not while winding down or
    /// waiting for the final ack round.
    pub fn wants_grants(&self) -> bool {
        matches!(self.state, UpState::Transmit | UpState::Quiescent)
    }

    /// Receive one data block from the MS. Out-of-order arrival is normal
    /// with multislot; duplicates are normal whenever an ack/nack is lost.
    pub fn recv_data_block(
        &mut self,
        core: &mut TbfCore,
        ms: &mut MsInfo,
        upper: &mut dyn UpperLayer,
        cfg: &StackConfig,
        now: Bsn,
        block: UlDataBlock,
    ) {
        let sn = block.sn % SNS as u8;
        let is_stall = block.mac.stall;
        tracing::trace!(
            "{} block sn={} cv={} {}",
            core.id,
            sn,
            block.mac.countdown,
            if self.vn[sn as usize] { "dup" } else { "" }
        );

        if self.rxq[sn as usize].is_some() {
            // A duplicate we have not scanned past yet. Keep the newer
            // copy; it will be deleted once the window is surely past.
            if !self.vn[sn as usize] {
                tracing::error!("{} receive state out of sync at sn={}", core.id, sn);
            }
            ms.stat_blocks.add_miss();
        } else {
            self.unique_blocks += 1;
            ms.stat_blocks.add_hit();
        }
        self.vn[sn as usize] = true;
        self.rxq[sn as usize] = Some(block);

        // Advance vr past the newest block; clean out state that has
        // fallen behind the reach of the 64-entry ack bitmap.
        let vr_m1 = add_sn(self.vr, -1);
        if delta_sn(sn, vr_m1) > 0 {
            let mut past = add_sn(self.vr, -(WS as i32) - 2);
            self.vr = next_sn(sn);
            let past_end = add_sn(self.vr, -(WS as i32) - 2);
            while past != past_end {
                self.vn[past as usize] = false;
                self.rxq[past as usize] = None;
                past = next_sn(past);
            }
        }

        self.stalled = is_stall;
        self.blocks_since_acknack += 1;
        self.total_blocks += 1;

        self.advance_window(core, ms, upper, now);

        if self.state == UpState::Finished {
            core.set_state(TbfState::DataFinal, cfg, now);
        }
    }

    /// Walk the contiguous received prefix, cracking each block into PDU
    /// segments: the tail of the previous PDU, zero or more complete PDUs,
    /// and the head of the next.
    fn advance_window(&mut self, core: &mut TbfCore, ms: &mut MsInfo, upper: &mut dyn UpperLayer, now: Bsn) {
        self.incomplete_pdu = false;
        while let Some(block) = self.rxq[self.vq as usize].take() {
            self.vq = next_sn(self.vq);
            let is_final = block.mac.is_final();

            if block.extended {
                // Whole payload belongs to the current PDU.
                self.append_pdu(&block.payload);
                if is_final {
                    self.send_pdu(core, ms, upper);
                }
            } else {
                self.crack_segments(core, ms, upper, &block, is_final);
            }

            self.persist_timer.set_now(now);
            if self.state == UpState::PersistFinal {
                // New traffic while winding down; the TBF lives on.
                self.state = UpState::Transmit;
            }
            if is_final {
                self.state = if self.persistent_mode { UpState::Quiescent } else { UpState::Finished };
                if self.cur_pdu.is_some() && !self.incomplete_pdu {
                    self.send_pdu(core, ms, upper);
                }
            } else if self.state == UpState::Quiescent {
                self.state = UpState::Transmit;
            }
        }
    }

    fn crack_segments(&mut self, core: &mut TbfCore, ms: &mut MsInfo, upper: &mut dyn UpperLayer, block: &UlDataBlock, is_final: bool) {
        const MAX_SEGS: usize = 16;
        let payload = &block.payload;

        let mut segs: Vec<LiOctet> = Vec::new();
        let mut pos = 0;
        loop {
            if segs.len() == MAX_SEGS {
                tracing::error!("{} more than {} segments per RLC block", core.id, MAX_SEGS);
                return; // almost certainly trash
            }
            let Some(&octet) = payload.get(pos) else {
                tracing::warn!("{} block ends inside length indicators", core.id);
                return;
            };
            pos += 1;
            let li = LiOctet::from_octet(octet);
            let end = li.e;
            segs.push(li);
            if end {
                break;
            }
        }

        let mut rest = &payload[pos..];
        for seg in &segs {
            let mut lenbytes = seg.li as usize;
            if lenbytes == 0 {
                // Zero length means the PDU uses the rest of the payload.
                // In the final block that marks an unfinished PDU.
                lenbytes = rest.len();
                if is_final {
                    self.incomplete_pdu = true;
                }
            } else if lenbytes > rest.len() {
                tracing::error!("{} nonsensical segment length {} > {}", core.id, lenbytes, rest.len());
                lenbytes = rest.len();
            }
            self.append_pdu(&rest[..lenbytes]);
            if seg.li != 0 {
                self.send_pdu(core, ms, upper);
            }
            rest = &rest[lenbytes..];
        }

        // Final M bit: the rest of the payload starts the next PDU.
        if !rest.is_empty() && segs.last().map(|s| s.m).unwrap_or(false) {
            self.append_pdu(rest);
        }
    }

    fn append_pdu(&mut self, seg: &[u8]) {
        self.cur_pdu.get_or_insert_with(Vec::new).extend_from_slice(seg);
    }

    /// Emit the completed PDU to the upper layer.
    fn send_pdu(&mut self, core: &mut TbfCore, ms: &mut MsInfo, upper: &mut dyn UpperLayer) {
        if let Some(pdu) = self.cur_pdu.take() {
            tracing::debug!("{} => pdu size={}", core.id, pdu.len());
            ms.bytes_up += pdu.len() as u64;
            upper.deliver_pdu(core.tlli, pdu);
        }
    }

    /// Packet Uplink Ack/Nack: SSN is vr, and the bitmap runs backwards
    /// over the 64 sequence numbers before it.
    fn make_acknack(&mut self, core: &TbfCore, ms: &MsInfo, cfg: &StackConfig, now: Bsn) -> PacketUplinkAckNack {
        let mut desc = AckNackDescription {
            final_ack: self.state == UpState::Finished,
            ssn: self.vr,
            bitmap: [false; ACKNACK_BITMAP_LEN],
        };
        for i in 1..=ACKNACK_BITMAP_LEN {
            desc.bitmap[ACKNACK_BITMAP_LEN - i] = self.vn[add_sn(self.vr, -(i as i32)) as usize];
        }
        if self.persistent_mode {
            self.keepalive_timer.set_now(now);
        }
        PacketUplinkAckNack {
            tfi: core.tfi.unwrap_or(0),
            desc,
            coding_command: core.coding(ms, cfg),
        }
    }

    /// Periodic (non-final) ack/nack. Gated on the MS having been granted
    /// a USF since the last one, so it has had a chance to answer.
    fn send_nonfinal_acknack(&mut self, core: &mut TbfCore, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> bool {
        if ms.acknack_usf_grant == ms.num_usf_grants {
            return false;
        }
        let cfg = mac.cfg.clone();
        let now = mac.now();
        let msg = self.make_acknack(core, ms, &cfg, now);
        if !mac.stage_control(
            chan,
            Some(core),
            DlMsg::UplinkAckNack(msg),
            PollMode::IfPossible,
            MsgTransType::Transmit,
            TxCounter::None,
        ) {
            return false;
        }
        ms.acknack_usf_grant = ms.num_usf_grants;
        self.blocks_since_acknack = 0;
        ms.talked_down(now);
        true
    }

    /// See if this up engine wants the downlink, for an ack/nack message.
    pub fn service(&mut self, core: &mut TbfCore, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> (bool, Option<EngineAction>) {
        if !core.is_primary(ms, chan) {
            return (false, None);
        }
        let cfg = mac.cfg.clone();

        loop {
            let now = mac.now();
            if self.state == UpState::Finished {
                // The MS wont stop sending data until the final ack/nack
                // gets through, so repeat it until control-acknowledged.
                if core.trans.got_ack(MsgTransType::DataFinal, true) {
                    return (false, Some(EngineAction::FinishSuccess));
                }
                if core.trans.pending(now) {
                    return (false, None);
                }
                let msg = self.make_acknack(core, ms, &cfg, now);
                let sent = mac.stage_control(
                    chan,
                    Some(core),
                    DlMsg::UplinkAckNack(msg),
                    PollMode::Required,
                    MsgTransType::DataFinal,
                    TxCounter::N3103,
                );
                if sent {
                    ms.talked_down(now);
                }
                return (sent, None);
            }

            if self.stalled || self.blocks_since_acknack >= cfg.uplink.blocks_per_acknack {
                // But absolutely do not run two reservations at once.
                if !core.trans.pending_one(now, MsgTransType::Transmit) {
                    return (self.send_nonfinal_acknack(core, ms, mac, chan), None);
                }
            }

            // Extended uplink TBF (persistent) mode, 44.060 9.3.1b / 9.5.
            if self.persistent_mode {
                match self.state {
                    UpState::Quiescent => {
                        if self.persist_timer.elapsed_msecs(now) > cfg.uplink.persist_ms as i32 {
                            // Ending the TBF takes a final ack/nack, but a
                            // USF granted in block N is answered in N+1, so
                            // stop granting and wait out the pipeline first.
                            self.state = UpState::PersistFinal;
                            self.persist_final_end = now.add(3);
                            return (false, None);
                        }
                        if cfg.uplink.keepalive_ms > 0 && self.keepalive_timer.elapsed_msecs(now) > cfg.uplink.keepalive_ms as i32 {
                            return (self.send_nonfinal_acknack(core, ms, mac, chan), None);
                        }
                    }
                    UpState::PersistFinal => {
                        if now.is_at_or_after(self.persist_final_end.next()) {
                            self.state = UpState::Finished;
                            core.set_state(TbfState::DataFinal, &cfg, now);
                            continue; // straight to the final ack/nack
                        }
                        return (false, None);
                    }
                    _ => {}
                }
            }
            return (false, None);
        }
    }

    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = writeln!(
            out,
            "up: vr={} vq={} state={:?} stalled={} since_acknack={} unique={}/{}",
            self.vr, self.vq, self.state, self.stalled, self.blocks_since_acknack, self.unique_blocks, self.total_blocks,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msinfo::QueuedPdu;
    use crate::rlc::DownEngine;
    use gprs_core::{ChannelCoding, Tlli};
    use gprs_msgs::{DlDataBlock, UlMacHeader};

    #[derive(Default)]
    struct TestUpper {
        pdus: Vec<(Tlli, Vec<u8>)>,
    }

    impl UpperLayer for TestUpper {
        fn deliver_pdu(&mut self, tlli: Tlli, data: Vec<u8>) {
            self.pdus.push((tlli, data));
        }
    }

    fn fixture() -> (TbfCore, MsInfo, StackConfig, Bsn) {
        let cfg = StackConfig::default();
        let now = Bsn::new(500);
        let mut ms = MsInfo::new(0x8000_0042, now);
        let tbf = crate::tbf::Tbf::new_up(&mut ms, 0x8000_0042, 0, &cfg, now);
        let mut core = tbf.core;
        core.id = crate::tbf::tests_support::dummy_tbf_ids(1)[0];
        (core, ms, cfg, now)
    }

    /// Turn a downlink block into the shape an MS would send it up in.
    fn to_uplink(b: &DlDataBlock, countdown: u8) -> UlDataBlock {
        UlDataBlock {
            mac: UlMacHeader {
                countdown,
                stall: false,
            },
            tfi: b.tfi,
            sn: b.sn,
            extended: b.extended,
            coding: b.coding,
            payload: b.payload.clone(),
        }
    }

    /// Split a PDU with the downlink engine and reassemble it with the
    /// uplink engine, using the same split points.
    fn round_trip(data: Vec<u8>) -> Vec<Vec<u8>> {
        let cfg = StackConfig::default();
        let now = Bsn::new(100);
        let (mut core, mut ms, _, _) = fixture();
        let mut down = DownEngine::new(cfg.downlink.poll_interval);
        let tlli = ms.tlli;
        down.write_high_side(
            &mut ms,
            QueuedPdu {
                tlli,
                data,
                descr: "rt".into(),
                enqueued_at: now,
                keepalive: false,
            },
        );
        let blocks = down.produce_all_for_test(&mut core, &mut ms, &cfg, now);

        let mut up = UpEngine::new(0, false, 0);
        let mut upper = TestUpper::default();
        let n = blocks.len();
        for (i, b) in blocks.iter().enumerate() {
            let countdown = if i + 1 == n { 0 } else { 15 };
            up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, to_uplink(b, countdown));
        }
        upper.pdus.into_iter().map(|(_, d)| d).collect()
    }

    #[test]
    fn test_round_trip_boundary_sizes() {
        let ps = ChannelCoding::Cs1.payload_size();
        for size in [1, ps - 1, ps, ps + 1, ps * 4, ps * 4 + 1] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let pdus = round_trip(data.clone());
            assert_eq!(pdus.len(), 1, "size {}: expected one PDU", size);
            assert_eq!(pdus[0], data, "size {}: payload mismatch", size);
        }
    }

    #[test]
    fn test_round_trip_empty_pdu_produces_nothing() {
        assert!(round_trip(vec![]).is_empty());
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let cfg = StackConfig::default();
        let now = Bsn::new(100);
        let (mut core, mut ms, _, _) = fixture();
        let ps = ChannelCoding::Cs1.payload_size();
        let data: Vec<u8> = (0..ps * 2 + 3).map(|i| (i * 7 % 256) as u8).collect();
        let mut down = DownEngine::new(cfg.downlink.poll_interval);
        let tlli = ms.tlli;
        down.write_high_side(
            &mut ms,
            QueuedPdu {
                tlli,
                data: data.clone(),
                descr: String::new(),
                enqueued_at: now,
                keepalive: false,
            },
        );
        let blocks = down.produce_all_for_test(&mut core, &mut ms, &cfg, now);
        assert!(blocks.len() >= 3);

        let mut up = UpEngine::new(0, false, 0);
        let mut upper = TestUpper::default();
        // Deliver the middle block last (multislot reordering)
        let n = blocks.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.swap(1, n - 1);
        for &i in &order {
            let countdown = if i + 1 == n { 0 } else { 15 };
            up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, to_uplink(&blocks[i], countdown));
        }
        assert_eq!(upper.pdus.len(), 1);
        assert_eq!(upper.pdus[0].1, data);
        assert_eq!(up.up_state(), UpState::Finished);
        assert_eq!(core.state(), crate::tbf::TbfState::DataFinal);
    }

    #[test]
    fn test_multiple_pdus_in_one_block() {
        // Three small PDUs that all fit in a single block with LI octets
        let cfg = StackConfig::default();
        let now = Bsn::new(100);
        let (mut core, mut ms, _, _) = fixture();
        let mut down = DownEngine::new(cfg.downlink.poll_interval);
        for (i, len) in [3usize, 4, 5].iter().enumerate() {
            ms.dl_queue.push_back(QueuedPdu {
                tlli: ms.tlli,
                data: vec![i as u8 + 1; *len],
                descr: String::new(),
                enqueued_at: now,
                keepalive: false,
            });
        }
        let blocks = down.produce_all_for_test(&mut core, &mut ms, &cfg, now);
        assert_eq!(blocks.len(), 1);

        let mut up = UpEngine::new(0, false, 0);
        let mut upper = TestUpper::default();
        up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, to_uplink(&blocks[0], 0));
        assert_eq!(upper.pdus.len(), 3);
        assert_eq!(upper.pdus[0].1, vec![1; 3]);
        assert_eq!(upper.pdus[1].1, vec![2; 4]);
        assert_eq!(upper.pdus[2].1, vec![3; 5]);
    }

    #[test]
    fn test_acknack_bitmap_reflects_received() {
        let cfg = StackConfig::default();
        let now = Bsn::new(100);
        let (mut core, mut ms, _, _) = fixture();
        let mut up = UpEngine::new(0, false, 0);
        let mut upper = TestUpper::default();

        let mk = |sn: u8| UlDataBlock {
            mac: UlMacHeader {
                countdown: 15,
                stall: false,
            },
            tfi: 0,
            sn,
            extended: true,
            coding: ChannelCoding::Cs1,
            payload: vec![0; ChannelCoding::Cs1.payload_size()],
        };
        up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, mk(0));
        up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, mk(2));

        let ack = up.make_acknack(&core, &ms, &cfg, now);
        assert!(!ack.desc.final_ack);
        assert_eq!(ack.desc.ssn, 3); // one past the highest received
        // bitmap[64-i] covers ssn-i: sn2 at i=1, sn1 missing at i=2, sn0 at i=3
        assert!(ack.desc.bitmap[63]);
        assert!(!ack.desc.bitmap[62]);
        assert!(ack.desc.bitmap[61]);
        // vq stuck at the hole
        assert_eq!(up.vq, 1);
    }

    #[test]
    fn test_duplicate_blocks_counted_once() {
        let cfg = StackConfig::default();
        let now = Bsn::new(100);
        let (mut core, mut ms, _, _) = fixture();
        let mut up = UpEngine::new(0, false, 0);
        let mut upper = TestUpper::default();

        let blk = UlDataBlock {
            mac: UlMacHeader {
                countdown: 15,
                stall: false,
            },
            tfi: 0,
            sn: 5,
            extended: true,
            coding: ChannelCoding::Cs1,
            payload: vec![1; ChannelCoding::Cs1.payload_size()],
        };
        up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, blk.clone());
        up.recv_data_block(&mut core, &mut ms, &mut upper, &cfg, now, blk);
        assert_eq!(up.unique_blocks, 1);
        assert_eq!(up.total_blocks, 2);
    }
}
