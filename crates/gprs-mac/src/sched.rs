use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gprs_core::{Bsn, ChannelCoding, Direction, Tlli, Usf, BLOCKS_PER_SECOND, BLOCK_TIME_MSECS};
use gprs_config::{SharedConfig, StackConfig};
use gprs_msgs::{DlDataBlock, DlMsg, ImmediateAssignment, MsAddr, MsgCodec, RadData, UlBlockKind, UlRadioBlock};

use crate::arena::{Arena, ChanId, MsId, TbfId};
use crate::msinfo::{MsInfo, QueuedPdu};
use crate::pdch::Pdch;
use crate::ports::{mac_queues, ChannelSource, MacHandle, MacQueues, PhyPort, RachEvent, TxFlags, TxKind, UpperLayer};
use crate::resources::{ResKind, TfiTable};
use crate::tbf::{CancelMode, MsgTransType, StopCause, Tbf, TbfClass, TbfCore, TbfState};
use gprs_core::direction::DirFilter;

/// Incoming blocks trail the downlink block counter by a few blocks; when
/// expecting an answer at N, look for it until N + BSN_LAG.
pub const BSN_LAG: i32 = 4;

/// RACH request codes: the top five bits classify the request
/// (GSM 04.08 table 9.9). We grant a single block either way and let the
/// resource request sort the rest out (two phase access).
const RACH_ONE_PHASE: u8 = 0x78;
const RACH_SINGLE_BLOCK: u8 = 0x70;

/// Whether a downlink block wants an uplink reservation attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    No,
    /// Attach one if an RRBP block is free; send either way.
    IfPossible,
    /// No reservation, no send; the caller retries later.
    Required,
}

/// Which retry counter a send feeds when its reservation is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCounter {
    None,
    Assign,
    Release,
    N3103,
    N3105,
}

struct StagedTx {
    bits: Vec<u8>,
    flags: TxFlags,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MacStats {
    pub ticks: u64,
    pub rachs: u64,
    pub ul_blocks: u64,
    pub tx_blocks: u64,
    pub pdus_queued: u64,
}

/// The MAC scheduler: owns the channel pool, the TBF and MS registries,
/// and the per-radio-block service loop. There is one of these per
/// subsystem; everything it owns is mutated only on its worker.
pub struct Mac {
    pub cfg: Arc<StackConfig>,
    bsn_now: Bsn,

    pub channels: Arena<Pdch>,
    /// Channel handles sorted by (arfcn, tn); PACCH selection and
    /// multislot grouping depend on the order.
    pub chan_order: Vec<ChanId>,
    /// Channels eligible to act as control channel for a multislot group.
    /// Rebuilt lazily when the pool changes.
    pacch_cache: Vec<ChanId>,
    home_arfcn: Option<u16>,
    chan_idle_blocks: u32,
    congestion_blocks: u32,
    utilization_ewma: f32,

    pub mss: Arena<MsInfo>,
    pub tbfs: Arena<Tbf>,
    pub tfis: TfiTable,
    /// Round-robin service order; a TBF that used a downlink slot moves
    /// to the tail.
    pub service_order: Vec<TbfId>,

    queues: MacQueues,
    pub codec: Box<dyn MsgCodec>,
    pub phy: Box<dyn PhyPort>,
    pub chan_src: Box<dyn ChannelSource>,
    pub upper: Box<dyn UpperLayer>,

    staged: Option<StagedTx>,
    pub stats: MacStats,
    /// Post-mortem summaries of recently expired TBFs.
    expired_log: std::collections::VecDeque<String>,
}

impl Mac {
    pub fn new(
        cfg: SharedConfig,
        codec: Box<dyn MsgCodec>,
        phy: Box<dyn PhyPort>,
        chan_src: Box<dyn ChannelSource>,
        upper: Box<dyn UpperLayer>,
    ) -> (Mac, MacHandle) {
        let (handle, queues) = mac_queues();
        let mac = Mac {
            cfg: cfg.config(),
            bsn_now: Bsn::new(0),
            channels: Arena::new(),
            chan_order: Vec::new(),
            pacch_cache: Vec::new(),
            home_arfcn: None,
            chan_idle_blocks: 0,
            congestion_blocks: 0,
            utilization_ewma: 0.0,
            mss: Arena::new(),
            tbfs: Arena::new(),
            tfis: TfiTable::new(),
            service_order: Vec::new(),
            queues,
            codec,
            phy,
            chan_src,
            upper,
            staged: None,
            stats: MacStats::default(),
            expired_log: std::collections::VecDeque::new(),
        };
        (mac, handle)
    }

    pub fn now(&self) -> Bsn {
        self.bsn_now
    }

    pub fn set_time(&mut self, bsn: Bsn) {
        self.bsn_now = bsn;
    }

    // ================================================================
    // The tick: one radio block (~20 ms) of work.
    // ================================================================

    pub fn tick(&mut self) {
        self.bsn_now = self.bsn_now.next();
        self.stats.ticks += 1;
        tracing::trace!("--- tick {} ---", self.bsn_now);

        // Clear reservations that have passed beyond all hope of answer.
        let stale = self.bsn_now.add(-(BSN_LAG + 4));
        for chan in self.chan_order.clone() {
            if let Some(pdch) = self.channels.get_mut(chan) {
                if let Some(res) = pdch.reservations.expire(stale) {
                    if res.tbf.is_some() {
                        tracing::debug!("reservation unanswered bsn={} {:?} {:?}", res.bsn, res.kind, res.tbf);
                    }
                }
            }
        }

        // Step: service RACHes first; this allocates the first channel as
        // a side effect when none exist yet.
        self.service_rach_queue();

        // Step: grow or shrink the channel pool.
        self.check_channels();

        // Step: process uplink blocks before producing any downlink, so a
        // just-arrived acknowledgement influences what goes out this tick.
        for chan in self.chan_order.clone() {
            let Some(pdch) = self.channels.get(chan) else { continue };
            let rx = pdch.uplink_rx.clone();
            while let Ok(blk) = rx.try_recv() {
                self.stats.ul_blocks += 1;
                self.process_uplink_block(chan, blk);
            }
        }

        // Step: service TBFs not attached to channels yet (plus dead-timer
        // expiry, which must work even if the MS lost its channels).
        for id in self.tbfs.handles() {
            let Some((mut tbf, mut ms)) = self.take_tbf_ms(id) else { continue };
            tbf.service_unattached(&mut ms, self);
            self.put_tbf_ms(id, tbf, ms);
        }

        // Step: service every MS; may start downlink TBFs from queues.
        for id in self.mss.handles() {
            self.service_ms(id);
        }

        // Step: one downlink block per channel, TBFs round-robin.
        for chan in self.chan_order.clone() {
            self.dl_service(chan);
        }

        // Step: move arrived downlink PDUs into their MS queues.
        self.drain_upper_queue();

        self.sweep_deleted();
    }

    // ================================================================
    // RACH handling
    // ================================================================

    fn service_rach_queue(&mut self) {
        while let Ok(rach) = self.queues.rach_rx.try_recv() {
            self.stats.rachs += 1;
            self.chan_idle_blocks = 0;
            if self.chan_order.is_empty() {
                self.check_channels();
            }
            if self.chan_order.is_empty() {
                tracing::warn!("RACH dropped: no packet channels available");
                continue;
            }
            self.service_rach(rach);
        }
    }

    /// Answer a RACH with a single-block uplink reservation on the least
    /// busy control-capable channel. If the MS never uses it, nobody ever
    /// knows; the MS runs its own timer and tries again.
    fn service_rach(&mut self, rach: RachEvent) {
        match rach.code & 0xf8 {
            RACH_ONE_PHASE | RACH_SINGLE_BLOCK => {}
            other => {
                tracing::warn!("unrecognized RACH code {:02x}", other);
                return;
            }
        }

        let cfg = self.cfg.clone();
        let load = self.phy.agch_load();
        if cfg.debug.agch_qmax > 0 && load > cfg.debug.agch_qmax {
            tracing::info!("RACH dropped due to AGCH congestion");
            return;
        }

        let Some(chan) = self.pick_channel() else {
            tracing::warn!("serviceRach failed to find available channel");
            return;
        };

        // The reservation must land after the assignment has drained
        // through the AGCH queue and the MS has had time to react.
        let first = self
            .bsn_now
            .add(12 * load as i32 + cfg.debug.ms_response_blocks as i32 + 1);
        let odd = cfg.debug.odd_block_reservations;
        let Some(pdch) = self.channels.get_mut(chan) else { return };
        let Some(bsn) = pdch
            .reservations
            .make_after(first, ResKind::Rach, MsgTransType::None, None, Some(rach.rad), odd)
        else {
            tracing::warn!("serviceRach failed to make a reservation at {}", self.bsn_now);
            return;
        };
        let (arfcn, tn) = (pdch.arfcn, pdch.tn);

        let msg = DlMsg::ImmediateAssignment(ImmediateAssignment {
            request_code: rach.code,
            request_frame: rach.frame,
            reserved_frame: bsn.value() as u32,
            timing_advance: rach.rad.timing_error.clamp(0.0, 63.0) as u8,
            arfcn,
            tn,
            poll: false,
        });
        let bits = self.codec.encode_control(&msg);
        self.phy.send_agch(bits);
        tracing::debug!("serviceRach: single block at {} on {}:{}", bsn, arfcn, tn);
    }

    // ================================================================
    // Channel pool
    // ================================================================

    fn add_channel(&mut self, arfcn: u16, tn: u8) -> ChanId {
        let rx = self.queues.add_channel(arfcn, tn);
        let id = self.channels.insert(Pdch::new(arfcn, tn, rx));
        self.chan_order.push(id);
        let channels = &self.channels;
        self.chan_order.sort_by_key(|c| channels.get(*c).map(|p| (p.arfcn, p.tn)).unwrap_or((u16::MAX, u8::MAX)));
        self.pacch_cache.clear();
        self.chan_idle_blocks = 0;
        tracing::info!("packet channel added {}:{}, total={}", arfcn, tn, self.chan_order.len());
        id
    }

    /// Return a channel to circuit-switched use. Every TBF using it is
    /// cancelled first, with no retry.
    pub fn remove_channel(&mut self, chan: ChanId) {
        let Some(pdch) = self.channels.get(chan) else { return };
        let (arfcn, tn) = (pdch.arfcn, pdch.tn);
        tracing::info!("packet channel removed {}:{}", arfcn, tn);

        for id in self.tbfs.handles() {
            let uses = self
                .tbfs
                .get(id)
                .and_then(|t| self.mss.get(t.core.ms))
                .map(|ms| ms.can_use_downlink(chan) || ms.can_use_uplink(chan))
                .unwrap_or(false);
            if uses {
                if let Some((mut tbf, mut ms)) = self.take_tbf_ms(id) {
                    tbf.cancel(&mut ms, self, StopCause::ShutDown, CancelMode::NoRetry);
                    self.put_tbf_ms(id, tbf, ms);
                }
            }
        }
        for ms_id in self.mss.handles() {
            if let Some(ms) = self.mss.get_mut(ms_id) {
                ms.ch_ups.retain(|c| *c != chan);
                ms.ch_downs.retain(|c| *c != chan);
                if ms.pacch == Some(chan) {
                    ms.pacch = None;
                }
            }
        }

        self.queues.remove_channel(arfcn, tn);
        self.channels.remove(chan);
        self.chan_order.retain(|c| *c != chan);
        self.pacch_cache.clear();
        self.chan_src.release(arfcn, tn);
    }

    /// Keep the pool at its configured minimums, grow on demand, and
    /// shrink after sustained idleness.
    fn check_channels(&mut self) {
        let cfg = self.cfg.clone();

        // Home-ARFCN minimum, allocated from the low end of the pool.
        let c0_count = self
            .chan_order
            .iter()
            .filter(|c| self.channels.get(**c).map(|p| Some(p.arfcn) == self.home_arfcn || self.home_arfcn.is_none()).unwrap_or(false))
            .count() as u32;
        if c0_count < cfg.channels.min_c0 {
            for _ in c0_count..cfg.channels.min_c0 {
                let Some((arfcn, tn)) = self.chan_src.acquire_c0() else { break };
                self.home_arfcn.get_or_insert(arfcn);
                self.add_channel(arfcn, tn);
            }
        }

        // Other-ARFCN minimum, grouped from the high end for adjacency.
        let total = self.chan_order.len() as u32;
        let cn_count = total.saturating_sub(c0_count.min(total));
        if cn_count < cfg.channels.min_cn {
            let need = (cfg.channels.min_cn - cn_count) as usize;
            for (arfcn, tn) in self.chan_src.acquire_group(need) {
                self.add_channel(arfcn, tn);
            }
        }

        if self.tbfs.len() > 0 {
            self.chan_idle_blocks = 0;
            // TBFs but no channels: try to get one on demand.
            if self.chan_order.is_empty() {
                if let Some((arfcn, tn)) = self.chan_src.acquire_c0() {
                    self.home_arfcn.get_or_insert(arfcn);
                    self.add_channel(arfcn, tn);
                }
            }
        } else {
            self.chan_idle_blocks += 1;
            if self.chan_idle_blocks > cfg.timers.chan_idle_secs * BLOCKS_PER_SECOND {
                self.free_idle_channel();
            }
        }

        // Grow on sustained demand. The congestion measure is averaged by
        // counting up and down one block at a time.
        if self.compute_utilization() > cfg.channels.congestion_threshold_pct as f32 / 100.0 {
            self.congestion_blocks += 1;
            if self.congestion_blocks > cfg.channels.congestion_secs * BLOCKS_PER_SECOND {
                self.congestion_blocks = 0;
                for (arfcn, tn) in self.chan_src.acquire_group(1) {
                    self.add_channel(arfcn, tn);
                }
            }
        } else if self.congestion_blocks > 0 {
            self.congestion_blocks -= 1;
        }
    }

    /// Approximately how many channels' worth of downlink the current TBFs
    /// want right now, smoothed over about five seconds. A stalled MS uses
    /// almost no bandwidth no matter how much data it has queued.
    pub fn compute_utilization(&mut self) -> f32 {
        let cfg = self.cfg.clone();
        let mut util = 0.0f32;
        for (_, tbf) in self.tbfs.iter() {
            match tbf.core.state() {
                TbfState::DataReadyToConnect | TbfState::DataWaiting1 | TbfState::DataWaiting2 => {
                    // Waiting to send a message.
                    util += 1.0;
                }
                TbfState::DataTransmit => {
                    util += match &tbf.engine {
                        crate::tbf::Engine::Down(e) => {
                            if e.stalled() {
                                0.2
                            } else {
                                1.0
                            }
                        }
                        crate::tbf::Engine::Up(_) => 1.0 / cfg.uplink.blocks_per_acknack as f32,
                    };
                }
                _ => {}
            }
        }
        const AVG_BLOCKS: f32 = (BLOCKS_PER_SECOND * 5) as f32;
        self.utilization_ewma = (util + self.utilization_ewma * (AVG_BLOCKS - 1.0)) / AVG_BLOCKS;
        self.utilization_ewma
    }

    fn free_idle_channel(&mut self) {
        self.chan_idle_blocks = 0;
        let cfg = self.cfg.clone();
        let min = (cfg.channels.min_c0 + cfg.channels.min_cn) as usize;
        if self.chan_order.len() <= min {
            return;
        }
        // Free from the back so the packet-channel block stays adjacent.
        if let Some(chan) = self.chan_order.last().copied() {
            self.remove_channel(chan);
        }
    }

    /// Rebuild the list of channels that can act as the control channel
    /// of a multislot group: one per adjacency run, positioned so the
    /// group's uplink/downlink pattern fits around it.
    fn pacch_rebuild(&mut self) {
        self.pacch_cache.clear();
        let cfg = self.cfg.clone();
        if self.chan_order.len() <= 2 {
            self.pacch_cache = self.chan_order.clone();
            return;
        }

        let chunk = cfg.channels.multislot_max_down.max(cfg.channels.multislot_max_up).clamp(1, 4) as usize;
        let down = cfg.channels.multislot_max_down as usize;
        let up = cfg.channels.multislot_max_up as usize;

        let mut run: Vec<ChanId> = Vec::new();
        let mut prev: Option<(u16, u8)> = None;
        let order = self.chan_order.clone();
        for chan in order.iter().chain(std::iter::once(&ChanId::invalid())) {
            let key = self.channels.get(*chan).map(|p| (p.arfcn, p.tn));
            let adjacent = match (prev, key) {
                (Some((pa, pt)), Some((a, t))) => pa == a && t == pt + 1,
                _ => false,
            };
            if adjacent {
                run.push(*chan);
            } else {
                if !run.is_empty() {
                    self.pacch_add_run(&run, chunk, down, up);
                }
                run.clear();
                if key.is_some() {
                    run.push(*chan);
                }
            }
            prev = key;
        }

        if self.pacch_cache.is_empty() {
            // All singletons; no multislot grouping possible, so anything
            // goes.
            self.pacch_cache = self.chan_order.clone();
        }
    }

    fn pacch_add_run(&mut self, run: &[ChanId], chunk: usize, down: usize, up: usize) {
        if run.len() < chunk {
            if run.len() > 1 {
                self.pacch_cache.push(run[1]);
            }
            return;
        }
        // Where in each chunk the control channel sits so the pattern
        // fits: e.g. 4-down/1-up wants it third, 1-down/4-up first.
        let offset = if down < up {
            0
        } else if chunk == 3 {
            1
        } else if chunk == 4 {
            if down >= up {
                2
            } else {
                0
            }
        } else {
            0
        };
        let full = run.len() / chunk;
        for i in 0..full {
            self.pacch_cache.push(run[i * chunk + offset]);
        }
        let leftover = run.len() - full * chunk;
        if leftover > 1 {
            let last = run.len() - leftover + offset.min(leftover - 1);
            self.pacch_cache.push(run[last]);
        }
    }

    /// Pick the control-capable channel with the lowest estimated load:
    /// a weighted sum of queued bytes and recent traffic per attached MS.
    pub fn pick_channel(&mut self) -> Option<ChanId> {
        if self.chan_order.is_empty() {
            return None;
        }
        if self.pacch_cache.is_empty() {
            self.pacch_rebuild();
        }
        let mut best: Option<(ChanId, u32)> = None;
        for chan in &self.pacch_cache {
            let mut load = 0u32;
            for (_, ms) in self.mss.iter() {
                if ms.pacch == Some(*chan) {
                    // Add 1 so an empty but occupied channel still loses to
                    // an unoccupied one.
                    load += 1 + ms.dl_queue.len() as u32 + ms.traffic_metric * 30;
                }
            }
            if best.map(|(_, b)| load < b).unwrap_or(true) {
                best = Some((*chan, load));
            }
        }
        best.map(|(c, _)| c)
    }

    // ================================================================
    // MS service and registry
    // ================================================================

    pub fn find_ms_by_tlli(&self, tlli: Tlli) -> Option<MsId> {
        for (id, ms) in self.mss.iter() {
            if ms.matches_tlli(tlli) {
                return Some(id);
            }
        }
        None
    }

    /// The upper layer reports that `tlli` and `alias` are the same
    /// physical phone. The cross reference keeps us from launching
    /// conflicting assignments; the superseded record gets no retries. It
    /// is never followed for deletion.
    pub fn alias_tlli(&mut self, tlli: Tlli, alias: Tlli) {
        let Some(ms_id) = self.find_ms_by_tlli(tlli) else { return };
        if let Some(ms) = self.mss.get_mut(ms_id) {
            ms.alt_tlli = Some(alias);
        }
        if let Some(alias_id) = self.find_ms_by_tlli(alias) {
            if alias_id != ms_id {
                if let Some(old) = self.mss.get_mut(alias_id) {
                    old.deprecated = true;
                }
            }
        }
    }

    pub fn find_or_create_ms(&mut self, tlli: Tlli) -> MsId {
        if let Some(id) = self.find_ms_by_tlli(tlli) {
            // About to be used; dont let it idle out underneath the user.
            if let Some(ms) = self.mss.get_mut(id) {
                ms.idle_blocks = 0;
            }
            return id;
        }
        let id = self.mss.insert(MsInfo::new(tlli, self.bsn_now));
        self.mss.get_mut(id).unwrap().id = id;
        tracing::info!("new MS {} tlli={:08x}", id, tlli);
        id
    }

    fn remove_ms(&mut self, ms_id: MsId) {
        if let Some(ms) = self.mss.remove(ms_id) {
            tracing::info!("forgetting idle MS {} tlli={:08x}", ms_id, ms.tlli);
        }
    }

    /// Per-tick MS service: timers, counters, watchdogs, and starting
    /// downlink TBFs from the queue.
    fn service_ms(&mut self, ms_id: MsId) {
        let Some(mut ms) = self.mss.take(ms_id) else { return };
        let cfg = self.cfg.clone();
        let now = self.bsn_now;

        if ms.t3193.valid() && ms.t3193.expired(now) {
            ms.t3193.invalidate();
        }

        if !ms.tbfs.is_empty() {
            ms.idle_blocks = 0;
        } else {
            ms.idle_blocks += 1;
            // Once the MS has left the packet channel (T3192 over on its
            // side), let go of the channel binding so the next session
            // re-picks the least loaded channel.
            if !ms.ch_downs.is_empty() && !ms.t3193.valid() && ms.idle_blocks > BLOCKS_PER_SECOND {
                tracing::debug!("{} channel assignment released", ms);
                ms.deassign_channels();
            }
            if ms.idle_blocks > cfg.timers.ms_idle_secs * BLOCKS_PER_SECOND {
                self.mss.put(ms_id, ms);
                self.remove_ms(ms_id);
                return;
            }
        }

        // N3101: the MS is ignoring its USF grants.
        if ms.n3101 > cfg.counters.n3101_max {
            self.stop_ms(&mut ms, DirFilter::Up, StopCause::N3101, CancelMode::RetryAfterWait);
        }

        // T3191: final downlink block never acknowledged.
        if ms.t3191.valid() && ms.t3191.expired(now) {
            ms.t3191.invalidate();
            self.stop_ms(&mut ms, DirFilter::Down, StopCause::T3191, CancelMode::RetryAfterWait);
        }

        // Start a downlink TBF if a PDU is waiting and no downlink TBF
        // exists in any state; a dead one legitimately blocks the queue
        // until its quarantine lapses.
        if !ms.dl_queue.is_empty() {
            let (mut blocking, blocker) = ms.count_tbfs(&self.tbfs, DirFilter::Down, TbfClass::Any);
            // TBFs of an aliased record (same phone, different TLLI) block
            // the queue just the same.
            if let Some(alias) = ms.alt_tlli {
                match self.find_ms_by_tlli(alias) {
                    Some(alias_id) if alias_id != ms_id => {
                        if let Some(other) = self.mss.get(alias_id) {
                            blocking += other.count_tbfs(&self.tbfs, DirFilter::Down, TbfClass::Any).0;
                        }
                    }
                    _ => {
                        // The old record expired naturally; never worry
                        // about it again.
                        ms.alt_tlli = None;
                    }
                }
            }
            if blocking == 0 {
                let pdu = ms.dl_queue.pop_front().unwrap();
                // The queued TLLI is authoritative; adopt it at the TBF
                // boundary.
                ms.change_tlli(pdu.tlli);
                ms.stalled = 0;
                self.create_downlink_tbf(&mut ms, pdu, ChannelCoding::Cs4);
            } else if let Some(blocker) = blocker {
                let active = self.tbfs.get(blocker).map(|t| t.core.is_active()).unwrap_or(false);
                let stalltype = if active { 1 } else { 2 };
                if stalltype != ms.stalled {
                    tracing::debug!("{} downlink queue stalled by {} tbf {}", ms, if active { "active" } else { "dead" }, blocker);
                    ms.stalled = stalltype;
                }
            }
        }

        // Overriding TBF killer: the per-state timers should cover every
        // case, but a bug in any substate could hang a TBF forever. This
        // one catches all.
        if !ms.tbfs.is_empty() && cfg.timers.nonresponsive > 0 && ms.talk_up.elapsed_msecs(now) > cfg.timers.nonresponsive as i32 {
            self.stop_ms(&mut ms, DirFilter::Either, StopCause::NonResponsive, CancelMode::NoRetry);
        }

        if now.value() % 24 == 0 {
            ms.traffic_metric /= 2;
        }

        self.mss.put(ms_id, ms);
    }

    /// Stop all active TBFs of this MS in the given direction.
    fn stop_ms(&mut self, ms: &mut MsInfo, dir: DirFilter, cause: StopCause, mode: CancelMode) {
        for id in ms.tbfs.clone() {
            let Some(mut tbf) = self.tbfs.take(id) else { continue };
            if dir.matches(tbf.core.dir) && tbf.core.is_active() {
                tbf.cancel(ms, self, cause, mode);
            }
            self.tbfs.put(id, tbf);
        }
    }

    pub(crate) fn create_downlink_tbf(&mut self, ms: &mut MsInfo, pdu: QueuedPdu, coding_max: ChannelCoding) {
        let cfg = self.cfg.clone();
        let tbf = Tbf::new_down(ms, pdu, coding_max, &cfg, self.bsn_now);
        let id = self.register_tbf(tbf, ms);
        tracing::debug!("new downlink TBF {} for {}", id, ms);
    }

    fn register_tbf(&mut self, tbf: Tbf, ms: &mut MsInfo) -> TbfId {
        let id = self.tbfs.insert(tbf);
        self.tbfs.get_mut(id).unwrap().core.id = id;
        ms.tbfs.push(id);
        self.service_order.push(id);
        id
    }

    /// Channel assignment for an MS's first TBF: PACCH plus, when
    /// configured and possible, adjacent channels for multislot.
    pub(crate) fn assign_channels(&mut self, ms: &mut MsInfo) -> bool {
        if !ms.ch_downs.is_empty() {
            return true;
        }
        let pacch = match ms.pacch {
            Some(c) if self.channels.contains(c) => c,
            _ => match self.pick_channel() {
                Some(c) => c,
                None => return false,
            },
        };
        ms.pacch = Some(pacch);
        ms.ch_downs.push(pacch);
        ms.ch_ups.push(pacch);

        let cfg = self.cfg.clone();
        let maxdown = cfg.channels.multislot_max_down.max(1) as usize;
        let maxup = cfg.channels.multislot_max_up.max(1) as usize;
        if maxdown > 1 || maxup > 1 {
            self.try_multislot(ms, pacch, maxdown, maxup);
        }

        let channels = &self.channels;
        ms.ch_downs.sort_by_key(|c| channels.get(*c).map(|p| p.tn));
        ms.ch_ups.sort_by_key(|c| channels.get(*c).map(|p| p.tn));
        tracing::debug!("{} channels assigned {}d/{}u pacch={}", ms, ms.ch_downs.len(), ms.ch_ups.len(), pacch);
        true
    }

    /// Multislot patterns around the PACCH, letters per timeslot:
    /// D down-only, U up-only, B bidirectional, P the PACCH itself.
    fn try_multislot(&mut self, ms: &mut MsInfo, pacch: ChanId, maxdown: usize, maxup: usize) {
        let patterns: &[&str] = match (maxdown.min(4), maxup.min(4)) {
            (4, _) => &["DDPD", "DPB", "DBP", "PB", "BP"],
            (_, 4) => &["PUUU", "PBU", "BPU", "PB", "BP"],
            (3, _) => &["DPB", "DBP", "PB", "BP"],
            (_, 3) => &["PBU", "BPU", "PB", "BP"],
            (2, _) | (_, 2) => &["PB", "BP"],
            _ => return,
        };
        for pattern in patterns {
            if self.try_add_pattern(ms, pacch, pattern) {
                return;
            }
        }
    }

    fn try_add_pattern(&mut self, ms: &mut MsInfo, pacch: ChanId, pattern: &str) -> bool {
        let Some(p) = self.channels.get(pacch) else { return false };
        let (arfcn, ptn) = (p.arfcn, p.tn);
        let before = pattern.find('P').unwrap_or(0);
        let first_tn = (ptn as i32 - before as i32).rem_euclid(8) as u8;

        // All slots in the pattern must exist (the PACCH itself counts).
        let mut picks: Vec<(char, ChanId)> = Vec::new();
        for (i, c) in pattern.chars().enumerate() {
            let tn = (first_tn as usize + i) as u8 % 8;
            if c == 'P' {
                continue;
            }
            let Some(chan) = self.find_channel(arfcn, tn) else { return false };
            picks.push((c, chan));
        }
        for (c, chan) in picks {
            match c {
                'D' => ms.ch_downs.push(chan),
                'U' => ms.ch_ups.push(chan),
                'B' => {
                    ms.ch_downs.push(chan);
                    ms.ch_ups.push(chan);
                }
                _ => {}
            }
        }
        true
    }

    pub fn find_channel(&self, arfcn: u16, tn: u8) -> Option<ChanId> {
        self.chan_order
            .iter()
            .find(|c| self.channels.get(**c).map(|p| p.arfcn == arfcn && p.tn == tn).unwrap_or(false))
            .copied()
    }

    // ================================================================
    // Uplink block processing
    // ================================================================

    fn process_uplink_block(&mut self, chan: ChanId, blk: UlRadioBlock) {
        // Pair the block with any reservation first: this books control
        // acknowledgements against the right transaction even when the
        // payload is something else entirely.
        let res = self.channels.get_mut(chan).and_then(|p| p.reservations.recv(blk.bsn));
        let mut on_rach_res = false;
        let mut res_tbf = None;
        if let Some(res) = res {
            on_rach_res = res.kind == ResKind::Rach;
            if let Some(tbf_id) = res.tbf {
                res_tbf = Some(tbf_id);
                if let Some((mut tbf, mut ms)) = self.take_tbf_ms(tbf_id) {
                    tracing::debug!("recvReservation {:?} ttype={:?} {}", res.kind, res.subtype, tbf_id);
                    tbf.core.recv_ack(res.subtype);
                    match res.kind {
                        ResKind::Poll => ms.stat_ccch_res.add_good(),
                        ResKind::Rrbp => ms.stat_rrbp_res.add_good(),
                        ResKind::Rach => {}
                    }
                    ms.talked_up(self.bsn_now, false);
                    self.put_tbf_ms(tbf_id, tbf, ms);
                }
            }
        }

        match blk.kind {
            UlBlockKind::Data(db) => {
                // Data blocks are routed by TFI, not USF; the USF memory
                // only helps identify who was granted a block nobody claims.
                let Some(tbf_id) = self.tfis.get(Direction::Up, db.tfi) else {
                    let granted = self.channels.get(chan).and_then(|p| p.usfs.granted_for(blk.bsn));
                    tracing::warn!(
                        "uplink data block with TFI={} sn={} unassociated with TBF (usf granted {:?})",
                        db.tfi,
                        db.sn,
                        granted
                    );
                    return;
                };
                if let Some(expected) = res_tbf {
                    gprs_core::assert_warn!(expected == tbf_id, "incoming block reservation {} does not match {}", expected, tbf_id);
                }
                let Some((mut tbf, mut ms)) = self.take_tbf_ms(tbf_id) else { return };
                ms.sig.set_rad_data(blk.rad.rssi, blk.rad.timing_error);
                ms.talked_up(self.bsn_now, true);
                tbf.recv_data_block(&mut ms, self, db);
                self.put_tbf_ms(tbf_id, tbf, ms);
            }
            UlBlockKind::Control(bits) => {
                let msg = match self.codec.decode_control(&bits) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("failed decoding uplink control block: {}", e);
                        return;
                    }
                };
                tracing::debug!("<- {} on {:?}", msg.name(), chan);
                self.dispatch_ul_msg(chan, blk.rad, msg, on_rach_res);
            }
        }
    }

    fn dispatch_ul_msg(&mut self, chan: ChanId, rad: RadData, msg: gprs_msgs::UlMsg, on_rach_res: bool) {
        use gprs_msgs::UlMsg;
        match msg {
            UlMsg::ControlAck(ack) => {
                // The transaction bookkeeping already happened via the
                // reservation; just refresh the MS.
                if let Some(ms_id) = self.find_ms_by_tlli(ack.tlli) {
                    if let Some(ms) = self.mss.get_mut(ms_id) {
                        ms.sig.set_rad_data(rad.rssi, rad.timing_error);
                        ms.talked_up(self.bsn_now, true);
                    }
                }
            }
            UlMsg::ResourceRequest(req) => {
                self.handle_resource_request(chan, rad, req, on_rach_res);
            }
            UlMsg::DownlinkAckNack(acknack) => {
                let Some(tbf_id) = self.tfis.get(Direction::Down, acknack.tfi) else {
                    tracing::warn!("downlink acknack for unknown TFI={}", acknack.tfi);
                    return;
                };
                let Some((mut tbf, mut ms)) = self.take_tbf_ms(tbf_id) else { return };
                ms.sig.set_rad_data(rad.rssi, rad.timing_error);
                ms.sig.c_value.add_point(acknack.quality.c_value as f64);
                ms.talked_up(self.bsn_now, false);
                tbf.recv_acknack(&mut ms, self, &acknack.desc);
                self.put_tbf_ms(tbf_id, tbf, ms);
            }
        }
    }

    /// The MS wants an uplink TBF (two phase access: this is the message
    /// it sent in its RACH-granted single block, or on a polled block
    /// during a running session).
    fn handle_resource_request(&mut self, chan: ChanId, rad: RadData, req: gprs_msgs::PacketResourceRequest, on_rach_res: bool) {
        let cfg = self.cfg.clone();
        let now = self.bsn_now;

        let ms_id = match req.addr {
            MsAddr::Tlli(tlli) => self.find_or_create_ms(tlli),
            MsAddr::Gtfi { dir, tfi } => {
                // Identification by TFI only works while that TBF lives.
                match self.tfis.get(dir, tfi).and_then(|t| self.tbfs.get(t)).map(|t| t.core.ms) {
                    Some(ms) => ms,
                    None => {
                        tracing::info!("resource request for unidentified MS (TFI {} gone)", tfi);
                        return;
                    }
                }
            }
        };
        let Some(mut ms) = self.mss.take(ms_id) else { return };
        ms.sig.set_rad_data(rad.rssi, rad.timing_error);
        ms.talked_up(now, false);
        ms.n3101 = 0;

        // The MS is listening to the channel the request arrived on until
        // we tell it otherwise.
        if ms.pacch.is_none() {
            ms.pacch = Some(chan);
        }

        // A RACH-path request while downlink TBFs run means the MS
        // restarted contention and considers those sessions gone.
        if on_rach_res {
            let (downs, _) = ms.count_tbfs(&self.tbfs, DirFilter::Down, TbfClass::Active);
            if downs > 0 {
                tracing::info!("{} RACH during active downlink transfer", ms);
                self.stop_ms(&mut ms, DirFilter::Down, StopCause::Rach, CancelMode::RetryAfterWait);
            }
        }

        // Only one uplink TBF per MS.
        let (active, active_id) = ms.count_tbfs(&self.tbfs, DirFilter::Up, TbfClass::Active);
        if active >= 1 {
            let active_id = active_id.unwrap();
            let state = self.tbfs.get(active_id).map(|t| t.core.state());
            match state {
                Some(TbfState::DataFinal) => {
                    // That TBF already completed and its final ack round is
                    // running; a fresh TBF may start alongside.
                }
                Some(s) if TbfClass::Transmitting.matches(s) => {
                    // A new PDU with different priority; reissuing the TBF
                    // mid-flight confuses more phones than it helps, so
                    // just let the current one finish.
                    tracing::info!("{} denied second uplink TBF (transmitting)", ms);
                    self.mss.put(ms_id, ms);
                    return;
                }
                _ => {
                    // Still being assigned. Adopt a changed TLLI (attach
                    // complete coming in under the new identity); otherwise
                    // ignore the duplicate request.
                    if let MsAddr::Tlli(tlli) = req.addr {
                        if let Some(tbf) = self.tbfs.get_mut(active_id) {
                            if tbf.core.tlli != tlli {
                                tracing::info!("changing uplink TBF tlli to {:08x}", tlli);
                                tbf.core.tlli = tlli;
                            } else {
                                tracing::debug!("{} duplicate uplink request ignored", ms);
                            }
                        }
                    }
                    self.mss.put(ms_id, ms);
                    return;
                }
            }
        }

        let tlli = match req.addr {
            MsAddr::Tlli(t) => t,
            MsAddr::Gtfi { .. } => ms.tlli,
        };
        let tbf = Tbf::new_up(&mut ms, tlli, req.crd.octet_count, &cfg, now);
        let id = self.register_tbf(tbf, &mut ms);
        // The MS listens for the uplink assignment until T3168 runs out.
        ms.t3168.set_future(now, cfg.timers.t3168);
        tracing::debug!("new uplink TBF {} for {} octets={}", id, ms, req.crd.octet_count);
        self.mss.put(ms_id, ms);
    }

    // ================================================================
    // Downlink service
    // ================================================================

    /// Produce at most one downlink block for this channel: TBFs in
    /// round-robin order, then an idle block if a USF grant needs a ride.
    fn dl_service(&mut self, chan: ChanId) {
        self.staged = None;

        let order = self.service_order.clone();
        for tbf_id in order {
            let can_use = self
                .tbfs
                .get(tbf_id)
                .and_then(|t| self.mss.get(t.core.ms))
                .map(|ms| ms.can_use_downlink(chan))
                .unwrap_or(false);
            if !can_use {
                continue;
            }
            let Some((mut tbf, mut ms)) = self.take_tbf_ms(tbf_id) else { continue };
            let used = tbf.service_downlink(&mut ms, self, chan);
            self.put_tbf_ms(tbf_id, tbf, ms);
            if used {
                // Fairness: the winner goes to the back of the line.
                self.service_order.retain(|t| *t != tbf_id);
                self.service_order.push(tbf_id);
                break;
            }
        }

        self.finalize_tx(chan);
    }

    /// Commit this channel's block for the tick: pick the USF for the next
    /// uplink block, then hand the staged (or an idle) block to the phy.
    fn finalize_tx(&mut self, chan: ChanId) {
        let cfg = self.cfg.clone();
        let now = self.bsn_now;

        // GSM 05.02 6.3.2.2.1: the USF in downlink block N assigns uplink
        // block N+1. No grant if that block is reserved (or parity-held
        // for reservations).
        let next_up = now.next();
        let reserved = self
            .channels
            .get(chan)
            .map(|p| p.reservations.get(next_up).is_some())
            .unwrap_or(true);
        let parity_held = cfg.debug.odd_block_reservations && next_up.value() % 2 == 1;
        let usf = if reserved || parity_held { 0 } else { self.find_needy_usf(chan) };
        if let Some(pdch) = self.channels.get_mut(chan) {
            pdch.usfs.remember(usf, now);
        }

        match self.staged.take() {
            Some(mut staged) => {
                staged.flags.usf = usf;
                self.stats.tx_blocks += 1;
                self.phy.transmit(chan, now, staged.bits, staged.flags);
            }
            None if usf != 0 => {
                // Nothing to say, but the grant has to ride on something.
                self.stats.tx_blocks += 1;
                self.phy.transmit(
                    chan,
                    now,
                    Vec::new(),
                    TxFlags {
                        kind: TxKind::Idle,
                        coding: ChannelCoding::Cs1,
                        usf,
                        rrbp: None,
                    },
                );
            }
            None => {}
        }
    }

    /// Pick the USF of an uplink TBF on this channel that wants the slot,
    /// fair by longest-waiting MS. Grants count toward N3101 until the MS
    /// answers with a block.
    fn find_needy_usf(&mut self, chan: ChanId) -> Usf {
        let now = self.bsn_now;
        let mut best: Option<(Usf, MsId, i32)> = None;
        for usf in crate::resources::USF_MIN..=crate::resources::USF_MAX {
            let holder = match self.channels.get_mut(chan) {
                Some(pdch) => pdch.usfs.holder(usf, now),
                None => None,
            };
            let Some(ms_id) = holder else { continue };
            let Some(ms) = self.mss.get(ms_id) else { continue };
            let wants = ms.tbfs.iter().any(|id| self.tbfs.get(*id).map(|t| t.wants_uplink_grant()).unwrap_or(false));
            if !wants {
                continue;
            }
            let age = if ms.last_usf_grant.valid() {
                now.delta(ms.last_usf_grant)
            } else {
                i32::MAX
            };
            if best.map(|(_, _, a)| age > a).unwrap_or(true) {
                best = Some((usf, ms_id, age));
            }
        }
        match best {
            Some((usf, ms_id, _)) => {
                if let Some(ms) = self.mss.get_mut(ms_id) {
                    ms.count_usf_grant(now, true);
                }
                usf
            }
            None => 0,
        }
    }

    // ================================================================
    // Send helpers used by the TBF/engine code
    // ================================================================

    pub(crate) fn make_rrbp(&mut self, chan: ChanId, tbf: TbfId, ttype: MsgTransType) -> Option<(Bsn, u8)> {
        let cfg = self.cfg.clone();
        let now = self.bsn_now;
        self.channels
            .get_mut(chan)?
            .reservations
            .make_rrbp(now, tbf, ttype, cfg.debug.rrbp_min, cfg.debug.odd_block_reservations)
    }

    /// Reservation for a poll attached to a CCCH message, far enough out
    /// to cover the AGCH queue drain (and the paging multiframes in DRX).
    pub(crate) fn make_ccch_reservation(&mut self, chan: ChanId, tbf: TbfId, ttype: MsgTransType, agch_load: u32, drx: bool) -> Option<Bsn> {
        let cfg = self.cfg.clone();
        let mut first = self.bsn_now.add(12 * agch_load as i32 + cfg.debug.ms_response_blocks as i32 + 1);
        if drx {
            first = first.add(22);
        }
        self.channels.get_mut(chan)?.reservations.make_after(
            first,
            ResKind::Poll,
            ttype,
            Some(tbf),
            None,
            cfg.debug.odd_block_reservations,
        )
    }

    fn bump_counter(core: &mut TbfCore, counter: TxCounter) {
        match counter {
            TxCounter::None => {}
            TxCounter::Assign => core.assign_count += 1,
            TxCounter::Release => core.release_count += 1,
            TxCounter::N3103 => core.n3103 += 1,
            TxCounter::N3105 => core.n3105 += 1,
        }
    }

    /// Stage a control message as this channel's block for the tick.
    pub(crate) fn stage_control(
        &mut self,
        chan: ChanId,
        core: Option<&mut TbfCore>,
        msg: DlMsg,
        poll: PollMode,
        ttype: MsgTransType,
        counter: TxCounter,
    ) -> bool {
        if self.staged.is_some() {
            return false;
        }
        let mut rrbp = None;
        if poll != PollMode::No {
            if let Some(core) = core {
                match self.make_rrbp(chan, core.id, ttype) {
                    Some((bsn, code)) => {
                        core.trans.set_ack_expected(bsn, ttype);
                        rrbp = Some(code);
                        Self::bump_counter(core, counter);
                    }
                    None => {
                        if poll == PollMode::Required {
                            return false;
                        }
                    }
                }
            }
        }
        tracing::debug!("-> {} on {:?} rrbp={:?}", msg.name(), chan, rrbp);
        let bits = self.codec.encode_control(&msg);
        self.staged = Some(StagedTx {
            bits,
            flags: TxFlags {
                kind: TxKind::Control,
                coding: ChannelCoding::Cs1,
                usf: 0,
                rrbp,
            },
        });
        true
    }

    /// Stage a data block as this channel's block for the tick.
    pub(crate) fn stage_data(
        &mut self,
        chan: ChanId,
        core: &mut TbfCore,
        ms: &mut MsInfo,
        mut block: DlDataBlock,
        poll: PollMode,
        ttype: MsgTransType,
        counter: TxCounter,
    ) -> bool {
        if self.staged.is_some() {
            return false;
        }
        let mut rrbp = None;
        if poll != PollMode::No {
            match self.make_rrbp(chan, core.id, ttype) {
                Some((bsn, code)) => {
                    core.trans.set_ack_expected(bsn, ttype);
                    rrbp = Some(code);
                    Self::bump_counter(core, counter);
                    ms.stat_rrbp_res.add_total();
                }
                None => {
                    if poll == PollMode::Required {
                        return false;
                    }
                }
            }
        }
        block.tfi = core.tfi.unwrap_or(0);
        tracing::trace!("-> data sn={} fbi={} cc={} rrbp={:?}", block.sn, block.fbi, block.coding, rrbp);
        let coding = block.coding;
        let bits = self.codec.encode_data(&block);
        self.staged = Some(StagedTx {
            bits,
            flags: TxFlags {
                kind: TxKind::Data,
                coding,
                usf: 0,
                rrbp,
            },
        });
        ms.talked_down(self.bsn_now);
        true
    }

    // ================================================================
    // Upper layer queue
    // ================================================================

    fn drain_upper_queue(&mut self) {
        while let Ok(mut pdu) = self.queues.dl_rx.try_recv() {
            self.stats.pdus_queued += 1;
            if pdu.data.len() > gprs_core::coding::PDU_MAX_LEN {
                tracing::warn!("downlink PDU for {:08x} truncated from {} octets", pdu.tlli, pdu.data.len());
                pdu.data.truncate(gprs_core::coding::PDU_MAX_LEN);
            }
            let ms_id = self.find_or_create_ms(pdu.tlli);
            let now = self.bsn_now;
            if let Some(ms) = self.mss.get_mut(ms_id) {
                ms.dl_queue.push_back(QueuedPdu {
                    tlli: pdu.tlli,
                    data: pdu.data,
                    descr: pdu.descr,
                    enqueued_at: now,
                    keepalive: false,
                });
            }
        }
    }

    // ================================================================
    // Registry plumbing
    // ================================================================

    pub(crate) fn take_tbf_ms(&mut self, id: TbfId) -> Option<(Tbf, MsInfo)> {
        let tbf = self.tbfs.take(id)?;
        match self.mss.take(tbf.core.ms) {
            Some(ms) => Some((tbf, ms)),
            None => {
                self.tbfs.put(id, tbf);
                None
            }
        }
    }

    pub(crate) fn put_tbf_ms(&mut self, id: TbfId, tbf: Tbf, ms: MsInfo) {
        let ms_id = tbf.core.ms;
        self.tbfs.put(id, tbf);
        self.mss.put(ms_id, ms);
    }

    /// Remove TBFs that have released their resources and have nothing
    /// outstanding.
    fn sweep_deleted(&mut self) {
        let now = self.bsn_now;
        for id in self.tbfs.handles() {
            let done = self
                .tbfs
                .get(id)
                .map(|t| t.core.state() == TbfState::Deleting && !t.core.trans.pending(now))
                .unwrap_or(false);
            if !done {
                continue;
            }
            if let Some(tbf) = self.tbfs.remove(id) {
                if self.expired_log.len() >= 16 {
                    self.expired_log.pop_front();
                }
                self.expired_log.push_back(format!(
                    "{} dir={} cause={:?} descr={}",
                    id, tbf.core.dir, tbf.core.cause, tbf.core.descr
                ));
                if let Some(ms) = self.mss.get_mut(tbf.core.ms) {
                    ms.tbfs.retain(|t| *t != id);
                }
            }
            self.service_order.retain(|t| *t != id);
        }
    }

    // ================================================================
    // Administrative interface
    // ================================================================

    /// Force-cancel one TBF, administrative.
    pub fn force_cancel_tbf(&mut self, id: TbfId) -> bool {
        let Some((mut tbf, mut ms)) = self.take_tbf_ms(id) else { return false };
        tbf.cancel(&mut ms, self, StopCause::ShutDown, CancelMode::NoRetry);
        self.put_tbf_ms(id, tbf, ms);
        true
    }

    /// Read-only dump of channels, MSs and TBFs.
    pub fn dump(&self, out: &mut impl std::fmt::Write) {
        let _ = writeln!(
            out,
            "MAC now={} channels={} ms={} tbfs={} stats={:?}",
            self.bsn_now,
            self.chan_order.len(),
            self.mss.len(),
            self.tbfs.len(),
            self.stats
        );
        for chan in &self.chan_order {
            if let Some(pdch) = self.channels.get(*chan) {
                let _ = writeln!(out, "{}", pdch);
                pdch.usfs.dump(out);
                pdch.reservations.dump(out);
            }
        }
        self.tfis.dump(out);
        for (_, ms) in self.mss.iter() {
            ms.dump(out);
        }
        for (id, tbf) in self.tbfs.iter() {
            let _ = writeln!(
                out,
                "TBF {} dir={} state={:?} tfi={:?} tlli={:08x} cause={:?}",
                id,
                tbf.core.dir,
                tbf.core.state(),
                tbf.core.tfi,
                tbf.core.tlli,
                tbf.core.cause
            );
            match &tbf.engine {
                crate::tbf::Engine::Up(e) => e.dump(out),
                crate::tbf::Engine::Down(e) => e.dump(out),
            }
        }
        for line in &self.expired_log {
            let _ = writeln!(out, "expired: {}", line);
        }
    }
}

/// Run the scheduler until `running` clears. Each tick holds the lock; the
/// pacing sleep does not. With debug.single_step set the loop exits
/// immediately and the caller drives `tick` by hand.
pub fn run_loop(mac: &Arc<Mutex<Mac>>, running: &AtomicBool) {
    {
        let mac = mac.lock().expect("scheduler mutex poisoned");
        if mac.cfg.debug.single_step {
            tracing::info!("single-step mode: service loop not started");
            return;
        }
    }
    tracing::info!("MAC service loop starting");
    while running.load(Ordering::SeqCst) {
        {
            let mut mac = mac.lock().expect("scheduler mutex poisoned");
            mac.tick();
        }
        std::thread::sleep(Duration::from_millis(BLOCK_TIME_MSECS as u64));
    }
    tracing::info!("MAC service loop ending");
}
