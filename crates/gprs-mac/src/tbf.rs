use gprs_core::{Bsn, BsnTimer, ChannelCoding, Direction, Tfi, Tlli};
use gprs_msgs::{
    AckNackDescription, DlMsg, MsAddr, MsgCodec, PacketDownlinkAssignment, PacketPowerControl, PacketTbfRelease,
    PacketUplinkAssignment, UlDataBlock,
};
use gprs_config::StackConfig;

use crate::arena::{MsId, TbfId};
use crate::msinfo::MsInfo;
use crate::ports::PhyPort;
use crate::rlc::{DownEngine, UpEngine};
use crate::sched::{Mac, PollMode, TxCounter, BSN_LAG};
use gprs_core::direction::DirFilter;

/// All MS share the same open-loop power parameters for now.
const POWER_ALPHA: u8 = 10;
const POWER_GAMMA: u8 = 20;

/// TBF life cycle. Dont set directly, go through TbfCore::set_state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbfState {
    Unused,
    /// Waiting on resources: channels, TFI, and (uplink) USF. Retried
    /// every tick until all succeed or patience runs out.
    DataReadyToConnect,
    /// Assignment sent; waiting for the acknowledgement tied to a
    /// reservation.
    DataWaiting1,
    /// Optional second assignment step (multislot over CCCH).
    DataWaiting2,
    /// Steady state; the RLC engine does the work.
    DataTransmit,
    /// All data moved; waiting for the session-final acknowledgement.
    DataFinal,
    /// Packet TBF Release being retried until acknowledged, after which
    /// the session may be retried as a fresh TBF.
    TbfRelease,
    /// Done, kept around until outstanding reservations expire.
    Finished,
    /// Unusable but still holding resources for the quarantine interval,
    /// to avoid races with a peer that has not given up on the session.
    Dead,
    /// Resources released; removed at the next safe point.
    Deleting,
}

/// Why a TBF was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    AssignCounter,
    ShutDown,
    Stuck,
    /// Running TBF killed by the MS restarting contention.
    Rach,
    ReleaseCounter,
    NonResponsive,
    Congestion,
    N3101,
    N3103,
    N3105,
    T3168,
    T3191,
    Unknown,
}

/// What to do about the session after cancelling its TBF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Retry makes no sense for an uplink TBF; the MS drives those.
    RetryInapplicable,
    NoRetry,
    /// Send a Packet TBF Release first so the peer does not try to pull
    /// old blocks into the next session; retry after its ack.
    RetryAfterRelease,
    RetryAfterWait,
}

/// State classes for counting TBFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbfClass {
    Any,
    Active,
    Transmitting,
}

impl TbfClass {
    pub fn matches(self, state: TbfState) -> bool {
        // Deleting and Unused never count for anything.
        if matches!(state, TbfState::Deleting | TbfState::Unused) {
            return false;
        }
        match self {
            TbfClass::Any => true,
            TbfClass::Active => matches!(
                state,
                TbfState::DataReadyToConnect
                    | TbfState::DataWaiting1
                    | TbfState::DataWaiting2
                    | TbfState::DataTransmit
                    | TbfState::DataFinal
                    | TbfState::TbfRelease
            ),
            // DataWaiting1 is left out: we have not heard back from the MS
            // after the assignment, so we dont know what it is listening to.
            TbfClass::Transmitting => matches!(state, TbfState::DataWaiting2 | TbfState::DataTransmit | TbfState::DataFinal),
        }
    }
}

/// Message transaction slots. Each state uses one type, but on error paths
/// a message of the previous state may still be outstanding, so they are
/// tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgTransType {
    None,
    /// Ack to the first assignment message (CCCH or PACCH).
    Assign1,
    /// Ack to the optional second (multislot) assignment.
    Assign2,
    /// Ack to the final block / final ack-nack. N3103 uplink, N3105 down.
    DataFinal,
    /// Ack-nack polls during steady-state transfer.
    Transmit,
    TbfRelease,
}

impl MsgTransType {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        match self {
            MsgTransType::None => 0,
            MsgTransType::Assign1 => 1,
            MsgTransType::Assign2 => 2,
            MsgTransType::DataFinal => 3,
            MsgTransType::Transmit => 4,
            MsgTransType::TbfRelease => 5,
        }
    }
}

/// Reliable-message bookkeeping: which acknowledgements are outstanding
/// and when they are due. One reservation at a time per transaction type.
#[derive(Debug, Clone)]
pub struct MsgTransaction {
    expected_bsn: [Bsn; MsgTransType::COUNT],
    ack_bits: u8,
    expected_bits: u8,
}

impl Default for MsgTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgTransaction {
    pub fn new() -> MsgTransaction {
        MsgTransaction {
            expected_bsn: [Bsn::INVALID; MsgTransType::COUNT],
            ack_bits: 0,
            expected_bits: 0,
        }
    }

    /// Note when we expect the acknowledgement; the MS may send data
    /// blocks before then.
    pub fn set_ack_expected(&mut self, when: Bsn, t: MsgTransType) {
        tracing::trace!("set_ack_expected when={} type={:?}", when, t);
        self.expected_bsn[t.index()] = when;
        self.ack_bits &= !(1 << t.index());
        self.expected_bits |= 1 << t.index();
    }

    /// A message for this TBF arrived.
    pub fn recv_ack(&mut self, t: MsgTransType) {
        tracing::trace!("recv_ack type={:?}", t);
        self.ack_bits |= 1 << t.index();
        self.expected_bits &= !(1 << t.index());
    }

    pub fn got_ack(&mut self, t: MsgTransType, clear: bool) -> bool {
        let result = self.ack_bits & (1 << t.index()) != 0;
        if result && clear {
            self.expected_bits &= !(1 << t.index());
            self.expected_bsn[t.index()] = Bsn::INVALID;
        }
        result
    }

    /// Is this message still outstanding? We wait lag-time extra blocks
    /// beyond the reservation to be sure we dont launch a resend while the
    /// answer is still being received.
    pub fn pending_one(&self, now: Bsn, t: MsgTransType) -> bool {
        self.expected_bits & (1 << t.index()) != 0
            && self.expected_bsn[t.index()].valid()
            && self.expected_bsn[t.index()].add(BSN_LAG).is_at_or_after(now)
    }

    /// Is any reservation currently outstanding?
    pub fn pending(&self, now: Bsn) -> bool {
        if self.expected_bits == 0 {
            return false;
        }
        self.expected_bsn
            .iter()
            .any(|bsn| bsn.valid() && bsn.add(BSN_LAG).is_at_or_after(now))
    }
}

/// Direction-agnostic TBF state; the direction-specific behavior lives in
/// the RLC engine variant next to it.
pub struct TbfCore {
    pub id: TbfId,
    pub ms: MsId,
    pub dir: Direction,
    state: TbfState,
    pub tfi: Option<Tfi>,
    /// TLLI of an uplink TBF; differs from the MS record only across a
    /// second attach after the TLLI change procedure.
    pub tlli: Tlli,
    pub attached: bool,
    pub assignment_on_ccch: bool,
    /// Whether the extra timing advance message went out already.
    pub ta_sent: bool,
    pub trans: MsgTransaction,

    pub n3103: u32,
    pub n3105: u32,
    pub assign_count: u32,
    pub ccch_assign_count: u32,
    pub release_count: u32,
    /// Ticks spent failing to collect resources in DataReadyToConnect.
    pub attach_tries: u32,

    pub dead_timer: BsnTimer,
    pub cause: Option<StopCause>,
    /// Retries throttle back to a slower coding via this cap.
    pub coding_max: ChannelCoding,
    pub started_at: Bsn,
    /// What was in this TBF, for error reporting.
    pub descr: String,
}

impl TbfCore {
    pub fn state(&self) -> TbfState {
        self.state
    }

    pub fn set_state(&mut self, state: TbfState, cfg: &StackConfig, now: Bsn) {
        if self.state == state {
            return;
        }
        tracing::debug!("{} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        if state == TbfState::Dead {
            // How long the TBF reserves its resources while dead.
            let quarantine = match self.dir {
                Direction::Up => cfg.timers.t3169,
                Direction::Down => cfg.timers.t3195,
            };
            self.dead_timer.set_future(now, quarantine);
        }
    }

    pub fn is_active(&self) -> bool {
        TbfClass::Active.matches(self.state)
    }

    pub fn is_transmitting(&self) -> bool {
        TbfClass::Transmitting.matches(self.state)
    }

    pub fn is_primary(&self, ms: &MsInfo, chan: crate::arena::ChanId) -> bool {
        ms.pacch == Some(chan)
    }

    pub fn recv_ack(&mut self, t: MsgTransType) {
        self.trans.recv_ack(t);
        // Not every ack is an RRBP data poll answer, but resetting the
        // miss counter on any contact is harmless.
        self.n3105 = 0;
    }

    /// Coding for the next block: locked to CS-1 when capped there,
    /// otherwise chosen from the MS's signal quality.
    pub fn coding(&self, ms: &MsInfo, cfg: &StackConfig) -> ChannelCoding {
        if self.coding_max == ChannelCoding::Cs1 {
            return ChannelCoding::Cs1;
        }
        let dynamic = if ms.sig.rssi.count() > 0 && ms.sig.rssi.mean() > cfg.downlink.coding_rssi_threshold as f64 {
            ChannelCoding::Cs4
        } else {
            ChannelCoding::Cs1
        };
        dynamic.min(self.coding_max)
    }

    pub fn finish_success(&mut self, ms: &mut MsInfo, cfg: &StackConfig, now: Bsn) {
        tracing::info!("{} finished ok, descr={}", self.id, self.descr);
        ms.t3191.invalidate();
        self.set_state(TbfState::Finished, cfg, now);
        // After a downlink TBF the MS camps on the packet channel for
        // T3192; T3193 tracks that on our side.
        if self.dir == Direction::Down {
            ms.t3193.set_future(now, cfg.timers.t3193_effective());
        }
    }
}

pub enum Engine {
    Up(UpEngine),
    Down(DownEngine),
}

/// What an engine wants done to its TBF; executed at the TBF level where
/// both halves are in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    FinishSuccess,
    Cancel(StopCause, CancelMode),
}

/// One Temporary Block Flow: one direction of one data session, wrapping
/// exactly one RLC engine and driving it through the assignment /
/// transmit / release state machine.
pub struct Tbf {
    pub core: TbfCore,
    pub engine: Engine,
}

impl Tbf {
    fn new_core(ms: &mut MsInfo, dir: Direction, tlli: Tlli, coding_max: ChannelCoding, now: Bsn) -> TbfCore {
        // Reset the watchdog stamps so a fresh TBF is not killed before it
        // has a chance to do anything.
        ms.talk_up.set_now(now);
        ms.talk_down.set_now(now);
        ms.count_tbfs += 1;
        TbfCore {
            id: TbfId::invalid(),
            ms: ms.id,
            dir,
            state: TbfState::Unused,
            tfi: None,
            tlli,
            attached: false,
            assignment_on_ccch: false,
            ta_sent: false,
            trans: MsgTransaction::new(),
            n3103: 0,
            n3105: 0,
            assign_count: 0,
            ccch_assign_count: 0,
            release_count: 0,
            attach_tries: 0,
            dead_timer: BsnTimer::new(),
            cause: None,
            coding_max,
            started_at: now,
            descr: String::new(),
        }
    }

    pub fn new_up(ms: &mut MsInfo, tlli: Tlli, octet_count: u16, cfg: &StackConfig, now: Bsn) -> Tbf {
        let mut core = Self::new_core(ms, Direction::Up, tlli, ChannelCoding::Cs4, now);
        core.state = TbfState::DataReadyToConnect;
        let persistent = cfg.uplink.persist_ms > 0;
        Tbf {
            core,
            engine: Engine::Up(UpEngine::new(octet_count, persistent, ms.num_usf_grants)),
        }
    }

    pub fn new_down(ms: &mut MsInfo, pdu: crate::msinfo::QueuedPdu, coding_max: ChannelCoding, cfg: &StackConfig, now: Bsn) -> Tbf {
        let mut core = Self::new_core(ms, Direction::Down, pdu.tlli, coding_max, now);
        core.state = TbfState::DataReadyToConnect;
        core.descr = pdu.descr.clone();
        ms.stalled = 0;
        let mut engine = DownEngine::new(cfg.downlink.poll_interval);
        engine.write_high_side(ms, pdu);
        Tbf {
            core,
            engine: Engine::Down(engine),
        }
    }

    // ----------------------------------------------------------------
    // Resource attachment
    // ----------------------------------------------------------------

    fn allocate_tfi(&mut self, mac: &mut Mac) -> bool {
        if self.core.tfi.is_none() {
            let Some(tfi) = mac.tfis.find_free(self.core.dir) else {
                tracing::info!("TFI congestion on {}", self.core.dir);
                return false;
            };
            self.core.tfi = Some(tfi);
        }
        mac.tfis.set(self.core.dir, self.core.tfi.unwrap(), self.core.id);
        true
    }

    fn allocate_usfs(&mut self, ms: &mut MsInfo, mac: &mut Mac) -> bool {
        let now = mac.now();
        for chan in ms.ch_ups.clone() {
            let Some(pdch) = mac.channels.get_mut(chan) else { continue };
            // The USF only works on a bidirectional timeslot.
            let tn = pdch.tn;
            if !ms.ch_downs.iter().any(|c| mac.channels.get(*c).map(|p| p.tn) == Some(tn)) {
                continue;
            }
            let Some(pdch) = mac.channels.get_mut(chan) else { continue };
            match pdch.usfs.allocate(ms.id, now) {
                Some(usf) => {
                    ms.usfs[tn as usize] = usf;
                }
                None => {
                    // Keep what we collected so far and try again later.
                    tracing::info!("USF congestion on uplink {}", pdch);
                    return false;
                }
            }
        }
        true
    }

    /// Collect channels, a TFI, and (uplink) a USF. Failures are
    /// non-fatal: the caller retries next tick.
    fn attach(&mut self, ms: &mut MsInfo, mac: &mut Mac) -> bool {
        if !mac.assign_channels(ms) {
            return false;
        }
        if !self.allocate_tfi(mac) {
            return false;
        }
        if self.core.dir == Direction::Up && !self.allocate_usfs(ms, mac) {
            return false;
        }
        self.core.attached = true;
        true
    }

    /// Release TFI and, if this was the MS's last live uplink TBF, its
    /// USFs. Channels stay with the MS.
    pub(crate) fn detach(&mut self, ms: &mut MsInfo, mac: &mut Mac) {
        if !self.core.attached {
            return;
        }
        self.core.attached = false;
        let cfg = mac.cfg.clone();
        self.core.set_state(TbfState::Deleting, &cfg, mac.now());
        if let Some(tfi) = self.core.tfi.take() {
            mac.tfis.clear(self.core.dir, tfi);
        }
        if self.core.dir == Direction::Up {
            self.clean_usfs(ms, mac);
        }
    }

    /// Relinquish the MS's USFs unless some other live uplink TBF of this
    /// MS still needs them. Dead TBFs no longer hold USFs.
    fn clean_usfs(&self, ms: &mut MsInfo, mac: &mut Mac) {
        let any_active_uplinks = ms.tbfs.iter().any(|id| {
            if *id == self.core.id {
                return false;
            }
            mac.tbfs
                .get(*id)
                .map(|t| t.core.dir == Direction::Up && t.core.attached && t.core.state() != TbfState::Dead)
                .unwrap_or(false)
        });
        if any_active_uplinks {
            return;
        }
        let now = mac.now();
        for chan in &ms.ch_ups {
            if let Some(pdch) = mac.channels.get_mut(*chan) {
                pdch.usfs.free(ms.id, now, false);
            }
        }
        ms.num_usf_grants = 0;
        ms.acknack_usf_grant = 0;
        ms.usfs = [0; 8];
    }

    /// Quarantine the MS's USFs: the TBF died, and the peer may still
    /// answer old grants for a while.
    fn fail_usfs(&self, ms: &MsInfo, mac: &mut Mac) {
        let now = mac.now();
        for chan in &ms.ch_ups {
            if let Some(pdch) = mac.channels.get_mut(*chan) {
                pdch.usfs.free(ms.id, now, true);
            }
        }
    }

    // ----------------------------------------------------------------
    // Teardown
    // ----------------------------------------------------------------

    /// Kill the TBF, either because it timed out or for reasons beyond its
    /// purview (shutdown, RACH restart).
    pub fn cancel(&mut self, ms: &mut MsInfo, mac: &mut Mac, cause: StopCause, mode: CancelMode) {
        let cfg = mac.cfg.clone();
        let now = mac.now();

        // Separate statistics for TBFs that never got connected.
        match self.core.state() {
            TbfState::DataTransmit | TbfState::DataFinal | TbfState::Finished => {
                ms.count_tbf_fail += 1;
            }
            _ => {
                ms.count_tbf_no_connect += 1;
            }
        }

        if self.core.dir == Direction::Up {
            self.fail_usfs(ms, mac);
        }

        let mut mode = mode;
        if ms.deprecated {
            mode = CancelMode::NoRetry;
        }

        let need_release = mode == CancelMode::RetryAfterRelease && self.core.dir == Direction::Down && self.core.is_transmitting();
        let retry = self.core.dir == Direction::Down
            && !ms.deprecated
            && cfg.downlink.retry_coding > 0
            && matches!(mode, CancelMode::RetryAfterRelease | CancelMode::RetryAfterWait);

        tracing::warn!(
            "{} {} cause={:?} state={:?} descr={}",
            if need_release { "releasing tbf" } else { "failed tbf" },
            self.core.id,
            cause,
            self.core.state(),
            self.core.descr
        );
        ms.t3191.invalidate();
        self.core.cause = Some(cause);
        self.core
            .set_state(if need_release { TbfState::TbfRelease } else { TbfState::Dead }, &cfg, now);

        if retry && mode == CancelMode::RetryAfterWait {
            self.retry(ms, mac);
        }
    }

    /// Downlink only: re-enqueue the most recent PDU as a fresh TBF at a
    /// conservative coding.
    fn retry(&mut self, ms: &mut MsInfo, mac: &mut Mac) {
        let cfg = mac.cfg.clone();
        if self.core.dir != Direction::Up && cfg.downlink.retry_coding > 0 && !ms.deprecated {
            let coding = ChannelCoding::from_index((cfg.downlink.retry_coding - 1).min(3) as u8).unwrap_or(ChannelCoding::Cs1);
            // The engine kept the last sdu; if it never started, the pdu is
            // still sitting in the queue.
            let pdu = match &mut self.engine {
                Engine::Down(e) => e.take_retry_pdu(),
                Engine::Up(_) => None,
            }
            .or_else(|| ms.dl_queue.pop_front());
            if let Some(pdu) = pdu {
                let expire_blocks = (cfg.downlink.pdu_expire_ms / gprs_core::BLOCK_TIME_MSECS) as i32;
                if mac.now().delta(pdu.enqueued_at) < expire_blocks {
                    mac.create_downlink_tbf(ms, pdu, coding);
                } else {
                    tracing::info!("{} retry pdu too old, dropped", self.core.id);
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Per-tick service
    // ----------------------------------------------------------------

    /// The few cases for a TBF whose MS has no channels yet (or no longer).
    pub fn service_unattached(&mut self, ms: &mut MsInfo, mac: &mut Mac) {
        let cfg = mac.cfg.clone();
        let now = mac.now();
        match self.core.state() {
            TbfState::Unused => {
                tracing::error!("{} with uninitialized state", self.core.id);
                self.cancel(ms, mac, StopCause::Unknown, CancelMode::NoRetry);
            }
            TbfState::DataReadyToConnect => {
                if self.attach(ms, mac) {
                    self.core.set_state(TbfState::DataWaiting1, &cfg, now);
                } else {
                    self.note_attach_failure(ms, mac);
                }
            }
            TbfState::Dead => {
                // The MS may have lost its channel assignment, so the dead
                // case must be handled here as well as in the attached path.
                if self.core.dead_timer.expired(now) {
                    self.detach(ms, mac);
                }
            }
            TbfState::Deleting => {
                // Swept by the scheduler once nothing is pending.
            }
            _ => {}
        }
    }

    fn note_attach_failure(&mut self, ms: &mut MsInfo, mac: &mut Mac) {
        self.core.attach_tries += 1;
        // Resource congestion is non-fatal per attempt, but a TBF that
        // cannot connect at all is eventually thrown back. The patience
        // must outlast the 5 second USF quarantine, or a TBF waiting on a
        // quarantined slot would never get it.
        let patience_blocks = 10 * gprs_core::BLOCKS_PER_SECOND;
        if self.core.attach_tries > patience_blocks {
            self.cancel(ms, mac, StopCause::Congestion, CancelMode::RetryAfterWait);
        }
    }

    /// See if the TBF can send anything on this downlink channel; returns
    /// true if it produced the channel's block for this tick.
    pub fn service_downlink(&mut self, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> bool {
        let cfg = mac.cfg.clone();
        loop {
            let now = mac.now();
            match self.core.state() {
                TbfState::Unused => {
                    tracing::error!("{} with uninitialized state", self.core.id);
                    self.cancel(ms, mac, StopCause::Unknown, CancelMode::NoRetry);
                    return false;
                }

                TbfState::DataReadyToConnect => {
                    if self.attach(ms, mac) {
                        self.core.set_state(TbfState::DataWaiting1, &cfg, now);
                        continue;
                    }
                    self.note_attach_failure(ms, mac);
                    return false;
                }

                TbfState::DataWaiting1 => {
                    if !self.core.is_primary(ms, chan) {
                        return false;
                    }
                    if self.core.trans.got_ack(MsgTransType::Assign1, true) {
                        if self.core.dir == Direction::Up {
                            // The RACH started this timer; the MS stops it
                            // on receiving the assignment.
                            ms.t3168.invalidate();
                        }
                        self.core.set_state(TbfState::DataWaiting2, &cfg, now);
                        continue;
                    }
                    if self.core.trans.pending(now) {
                        return false;
                    }
                    if self.core.assign_count > cfg.counters.assign_max {
                        self.cancel(ms, mac, StopCause::AssignCounter, CancelMode::NoRetry);
                        return false;
                    }
                    return self.send_assignment(ms, mac, chan);
                }

                TbfState::DataWaiting2 => {
                    if !self.core.is_primary(ms, chan) {
                        return false;
                    }
                    // A CCCH downlink assignment already carried a starting
                    // time, so no timing advance message is required; the
                    // extra one is useful to confirm the MS really listens.
                    if self.core.dir == Direction::Down
                        && self.core.assignment_on_ccch
                        && cfg.debug.send_extra_ta
                        && !self.core.ta_sent
                    {
                        let msg = DlMsg::PowerControl(PacketPowerControl {
                            addr: MsAddr::Tlli(self.core.tlli),
                            alpha: POWER_ALPHA,
                            gamma: POWER_GAMMA,
                            timing_advance: timing_advance(ms),
                        });
                        if !mac.stage_control(chan, Some(&mut self.core), msg, PollMode::IfPossible, MsgTransType::Assign2, TxCounter::None) {
                            return false;
                        }
                        self.core.ta_sent = true;
                        self.core.set_state(TbfState::DataTransmit, &cfg, now);
                        return true;
                    }
                    // The CCCH immediate assignment is single-slot only; a
                    // multislot upgrade would need a second assignment on
                    // PACCH here. Single-slot proceeds directly.
                    self.core.set_state(TbfState::DataTransmit, &cfg, now);
                    continue;
                }

                TbfState::DataTransmit => {
                    // Nonresponsive downlink: no answer to RRBP data polls.
                    if self.core.n3105 > cfg.counters.n3105_max {
                        self.cancel(ms, mac, StopCause::N3105, CancelMode::RetryAfterRelease);
                        return false;
                    }
                    return self.engine_service(ms, mac, chan);
                }

                TbfState::DataFinal => {
                    // Nonresponsive uplink: no answer to the final acknack.
                    if self.core.n3103 > cfg.counters.n3103_max {
                        self.cancel(ms, mac, StopCause::N3103, CancelMode::RetryInapplicable);
                        return false;
                    }
                    return self.engine_service(ms, mac, chan);
                }

                TbfState::TbfRelease => {
                    if !self.core.is_primary(ms, chan) {
                        return false;
                    }
                    return self.send_tbf_release(ms, mac, chan);
                }

                TbfState::Finished => {
                    // Hang around until we are sure the MS has stopped
                    // talking to us.
                    if !self.core.trans.pending(now) {
                        self.detach(ms, mac);
                    }
                    return false;
                }

                TbfState::Dead => {
                    if self.core.dead_timer.expired(now) {
                        self.detach(ms, mac);
                    }
                    return false;
                }

                TbfState::Deleting => return false,
            }
        }
    }

    fn engine_service(&mut self, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> bool {
        let Tbf { core, engine } = self;
        let (used, action) = match engine {
            Engine::Down(e) => e.service(core, ms, mac, chan),
            Engine::Up(e) => e.service(core, ms, mac, chan),
        };
        self.apply(ms, mac, action);
        used
    }

    fn apply(&mut self, ms: &mut MsInfo, mac: &mut Mac, action: Option<EngineAction>) {
        match action {
            None => {}
            Some(EngineAction::FinishSuccess) => {
                let cfg = mac.cfg.clone();
                self.core.finish_success(ms, &cfg, mac.now());
            }
            Some(EngineAction::Cancel(cause, mode)) => {
                self.cancel(ms, mac, cause, mode);
            }
        }
    }

    // ----------------------------------------------------------------
    // Message sending
    // ----------------------------------------------------------------

    /// Send (or resend) the assignment for this TBF, on PACCH when the MS
    /// is camped on the packet channel, on CCCH when it is packet-idle.
    fn send_assignment(&mut self, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> bool {
        let cfg = mac.cfg.clone();
        let now = mac.now();

        if ms.t3193.valid() && ms.t3193.expired(now) {
            ms.t3193.invalidate();
        }
        if ms.t3168.valid() && ms.t3168.expired(now) {
            ms.t3168.invalidate();
            if self.core.dir == Direction::Up {
                // The MS stopped listening for our uplink assignment.
                self.cancel(ms, mac, StopCause::T3168, CancelMode::NoRetry);
                return false;
            }
        }

        // Which channel is the MS listening to? If any TBF is moving, or
        // T3168/T3193 is running, it is on PACCH; otherwise CCCH.
        let mut onccch = self.core.dir == Direction::Down;
        let (transmitting, _) = ms.count_tbfs(&mac.tbfs, DirFilter::Either, TbfClass::Transmitting);
        if transmitting > 0 || ms.t3193.valid() {
            onccch = false;
        }
        if ms.t3168.valid() {
            // While T3168 runs the MS ignores downlink assignments
            // entirely (GSM 04.60 7.1.3.1). Wait it out.
            if self.core.dir == Direction::Down {
                return false;
            }
            onccch = false;
        }

        // After a few unanswered tries, alternate between the channels in
        // case our idea of the MS's mode is simply wrong.
        if self.core.dir == Direction::Down && self.core.assign_count >= 4 {
            onccch = !self.core.assignment_on_ccch;
        }
        self.core.assignment_on_ccch = self.core.dir == Direction::Down && onccch;

        if self.core.assignment_on_ccch {
            self.send_assignment_ccch(ms, mac, chan);
            // We did not use the packet channel downlink.
            return false;
        }

        let msg = self.build_assignment(ms, mac, &cfg);
        let sent = mac.stage_control(chan, Some(&mut self.core), msg, PollMode::Required, MsgTransType::Assign1, TxCounter::Assign);
        if sent {
            ms.talked_down(now);
        }
        sent
    }

    fn build_assignment(&mut self, ms: &MsInfo, mac: &Mac, cfg: &StackConfig) -> DlMsg {
        let tfi = self.core.tfi.unwrap_or(0);
        let arfcn = ms
            .pacch
            .and_then(|c| mac.channels.get(c))
            .map(|p| p.arfcn)
            .unwrap_or(0);
        match self.core.dir {
            Direction::Up => {
                let mut usfs = Vec::new();
                let mut mask = 0u8;
                for chan in &ms.ch_ups {
                    if let Some(pdch) = mac.channels.get(*chan) {
                        let usf = ms.usfs[pdch.tn as usize];
                        if usf != 0 {
                            usfs.push((pdch.tn, usf));
                            mask |= 1 << (7 - pdch.tn);
                        }
                    }
                }
                DlMsg::UplinkAssignment(PacketUplinkAssignment {
                    addr: MsAddr::Tlli(self.core.tlli),
                    tfi,
                    usfs,
                    coding: self.core.coding(ms, cfg),
                    arfcn,
                    timeslot_mask: mask,
                    timing_advance: timing_advance(ms),
                })
            }
            Direction::Down => DlMsg::DownlinkAssignment(PacketDownlinkAssignment {
                addr: MsAddr::Tlli(self.core.tlli),
                tfi,
                arfcn,
                timeslot_mask: ms.downlink_timeslot_mask(&mac.channels),
                timing_advance: timing_advance(ms),
                control_ack: true,
            }),
        }
    }

    /// Downlink assignment for a packet-idle MS, sent on the access grant
    /// channel with a polled reservation on our PACCH.
    fn send_assignment_ccch(&mut self, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) {
        let cfg = mac.cfg.clone();
        let load = mac.phy.agch_load();
        if cfg.debug.agch_qmax > 0 && load > cfg.debug.agch_qmax {
            tracing::info!("CCCH congestion delayed assignment for {}", self.core.id);
            return;
        }
        // The MS may have dropped into DRX (paging) mode; after a few
        // unanswered CCCH assignments push the reservation out past the
        // paging multiframes.
        let drx = self.core.ccch_assign_count >= 4;
        let Some(bsn) = mac.make_ccch_reservation(chan, self.core.id, MsgTransType::Assign1, load, drx) else {
            return; // Try again later.
        };
        self.core.trans.set_ack_expected(bsn, MsgTransType::Assign1);
        ms.stat_ccch_res.add_total();

        let msg = self.build_assignment(ms, mac, &cfg);
        let bits = mac.codec.encode_control(&msg);
        mac.phy.send_agch(bits);
        self.core.assign_count += 1;
        self.core.ccch_assign_count += 1;
        ms.talked_down(mac.now());
        tracing::debug!("{} assignment on CCCH, load={} res={}", self.core.id, load, bsn);
    }

    /// Retry the Packet TBF Release message until acknowledged, then let
    /// the session retry as a fresh TBF.
    fn send_tbf_release(&mut self, ms: &mut MsInfo, mac: &mut Mac, chan: crate::arena::ChanId) -> bool {
        let cfg = mac.cfg.clone();
        let now = mac.now();
        if self.core.trans.pending(now) {
            return false;
        }
        if self.core.trans.got_ack(MsgTransType::TbfRelease, true) {
            self.detach(ms, mac);
            self.retry(ms, mac);
            return false;
        }
        if self.core.release_count > cfg.counters.tbf_release_max {
            self.cancel(ms, mac, StopCause::ReleaseCounter, CancelMode::RetryAfterWait);
            return false;
        }
        let msg = DlMsg::TbfRelease(PacketTbfRelease {
            dir: self.core.dir,
            tfi: self.core.tfi.unwrap_or(0),
            cause: 2, // abnormal
        });
        mac.stage_control(chan, Some(&mut self.core), msg, PollMode::Required, MsgTransType::TbfRelease, TxCounter::Release)
    }

    // ----------------------------------------------------------------
    // Uplink input
    // ----------------------------------------------------------------

    /// A Packet Downlink Ack/Nack arrived for this (downlink) TBF.
    pub fn recv_acknack(&mut self, ms: &mut MsInfo, mac: &mut Mac, desc: &AckNackDescription) {
        let Tbf { core, engine } = self;
        let Engine::Down(e) = engine else {
            tracing::warn!("{} acknack for an uplink TBF, dropped", core.id);
            return;
        };
        core.recv_ack(MsgTransType::Transmit);
        let cfg = mac.cfg.clone();
        let action = e.recv_acknack(core, ms, &cfg, mac.now(), desc);
        self.apply(ms, mac, action);
    }

    /// An uplink data block arrived for this (uplink) TBF.
    pub fn recv_data_block(&mut self, ms: &mut MsInfo, mac: &mut Mac, block: UlDataBlock) {
        let cfg = mac.cfg.clone();
        let now = mac.now();
        match self.core.state() {
            TbfState::DataWaiting1 => {
                // Data before the control ack: the assignment clearly made
                // it through.
                ms.t3168.invalidate();
                self.core.set_state(TbfState::DataTransmit, &cfg, now);
            }
            TbfState::Dead => {
                tracing::warn!("{} received uplink data block after expiration", self.core.id);
                return;
            }
            _ => {}
        }
        ms.n3101 = 0;
        let Tbf { core, engine } = self;
        let Engine::Up(e) = engine else {
            tracing::warn!("{} data block for a downlink TBF, dropped", core.id);
            return;
        };
        e.recv_data_block(core, ms, &mut *mac.upper, &cfg, now, block);
    }

    /// Does this TBF want USF grants on the uplink right now? Not in
    /// DataFinal (all blocks received, only the RRBP round remains) and
    /// not while a persistent uplink winds down.
    pub fn wants_uplink_grant(&self) -> bool {
        if self.core.dir != Direction::Up || self.core.state() != TbfState::DataTransmit {
            return false;
        }
        match &self.engine {
            Engine::Up(e) => e.wants_grants(),
            Engine::Down(_) => false,
        }
    }
}

fn timing_advance(ms: &MsInfo) -> u8 {
    // One TA step is ~550 m of one-way range, 3.7 usec of round trip.
    let te = ms.sig.timing_error.current();
    te.clamp(0.0, 63.0) as u8
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::arena::Arena;
    use gprs_core::Bsn;

    /// Mint live TbfIds for allocator tests. The arena is leaked: only the
    /// handles matter.
    pub fn dummy_tbf_ids(n: usize) -> Vec<TbfId> {
        let cfg = StackConfig::default();
        let now = Bsn::new(0);
        let mut mss: Arena<crate::msinfo::MsInfo> = Arena::new();
        let ms_id = mss.insert(crate::msinfo::MsInfo::new(0x8000_0001, now));
        let mut tbfs: Arena<Tbf> = Arena::new();
        let mut ids = Vec::new();
        for _ in 0..n {
            let ms = mss.get_mut(ms_id).unwrap();
            let tbf = Tbf::new_up(ms, 0x8000_0001, 100, &cfg, now);
            let id = tbfs.insert(tbf);
            tbfs.get_mut(id).unwrap().core.id = id;
            ids.push(id);
        }
        std::mem::forget(tbfs);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_transaction() {
        let mut t = MsgTransaction::new();
        let now = Bsn::new(100);
        assert!(!t.pending(now));

        t.set_ack_expected(now.add(6), MsgTransType::Assign1);
        assert!(t.pending(now));
        assert!(t.pending_one(now, MsgTransType::Assign1));
        assert!(!t.pending_one(now, MsgTransType::Transmit));
        // Still pending through the lag window
        assert!(t.pending(now.add(6 + BSN_LAG)));
        assert!(!t.pending(now.add(6 + BSN_LAG + 1)));

        assert!(!t.got_ack(MsgTransType::Assign1, false));
        t.recv_ack(MsgTransType::Assign1);
        assert!(!t.pending(now));
        assert!(t.got_ack(MsgTransType::Assign1, true));
        // Cleared: second query still reports the ack bit (not cleared by
        // got_ack), but nothing pending
        assert!(t.got_ack(MsgTransType::Assign1, true));
    }

    #[test]
    fn test_state_classes() {
        assert!(TbfClass::Active.matches(TbfState::DataReadyToConnect));
        assert!(TbfClass::Active.matches(TbfState::TbfRelease));
        assert!(!TbfClass::Active.matches(TbfState::Dead));
        assert!(!TbfClass::Active.matches(TbfState::Finished));
        assert!(!TbfClass::Transmitting.matches(TbfState::DataWaiting1));
        assert!(TbfClass::Transmitting.matches(TbfState::DataTransmit));
        assert!(!TbfClass::Any.matches(TbfState::Deleting));
    }
}
