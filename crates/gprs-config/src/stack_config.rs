use std::sync::Arc;

/// Counters from GSM 04.60 section 13 plus local retry bounds.
#[derive(Debug, Clone)]
pub struct CfgCounters {
    /// Unanswered USF grants before an uplink TBF is considered dead.
    /// Should be greater than 8; some handsets wait 3 block periods
    /// before they start answering USFs.
    pub n3101_max: u32,
    /// Unanswered final uplink ack/nack polls.
    pub n3103_max: u32,
    /// Unanswered RRBP data polls.
    pub n3105_max: u32,
    /// Assignment message retries before giving up on a TBF.
    pub assign_max: u32,
    /// Packet TBF Release message retries.
    pub tbf_release_max: u32,
    /// Blocks sent with no ack/nack progress before a downlink TBF is
    /// declared stuck and cancelled.
    pub stuck_window_blocks: u32,
}

impl Default for CfgCounters {
    fn default() -> Self {
        Self {
            n3101_max: 20,
            n3103_max: 8,
            n3105_max: 12,
            assign_max: 5,
            tbf_release_max: 5,
            stuck_window_blocks: 250,
        }
    }
}

/// Timers from GSM 04.60 section 13, in msecs unless noted.
#[derive(Debug, Clone)]
pub struct CfgTimers {
    /// MS-side wait for an uplink assignment after a resource request.
    pub t3168: u32,
    /// Resource quarantine after a nonresponsive uplink TBF.
    pub t3169: u32,
    /// Waiting for acknowledgement of the final downlink data block.
    pub t3191: u32,
    /// How long the MS camps on the packet channel after a downlink TBF
    /// (T3192 in the MS). 0 means derive as T3192 + 50 ms.
    pub t3193: u32,
    /// Resource quarantine after a nonresponsive downlink TBF.
    pub t3195: u32,
    /// Seconds an MS record may be idle before we forget it.
    pub ms_idle_secs: u32,
    /// Seconds the channel pool may be idle before shrinking.
    pub chan_idle_secs: u32,
    /// Overriding TBF killer: msecs with no uplink traffic at all from an
    /// MS with live TBFs. 0 disables.
    pub nonresponsive: u32,
    /// The MS-side T3192 code value in msecs, used to derive t3193.
    pub t3192: u32,
}

impl Default for CfgTimers {
    fn default() -> Self {
        Self {
            t3168: 2500,
            t3169: 5000,
            t3191: 5000,
            t3193: 0,
            t3195: 5000,
            ms_idle_secs: 600,
            chan_idle_secs: 6000,
            nonresponsive: 6000,
            t3192: 500,
        }
    }
}

impl CfgTimers {
    /// T3193 must outlast the MS's T3192; when unset, add 50 msecs slop.
    pub fn t3193_effective(&self) -> u32 {
        if self.t3193 == 0 {
            self.t3192 + 50
        } else {
            self.t3193
        }
    }
}

/// Channel pool policy.
#[derive(Debug, Clone)]
pub struct CfgChannels {
    /// Minimum packet channels held on the home ARFCN (C0).
    pub min_c0: u32,
    /// Minimum packet channels held on other ARFCNs.
    pub min_cn: u32,
    /// Multislot assignment maxima. 1 disables multislot.
    pub multislot_max_down: u32,
    pub multislot_max_up: u32,
    /// Demand exceeding available bandwidth by this much, in percent,
    /// counts as congestion.
    pub congestion_threshold_pct: u32,
    /// Seconds of sustained congestion before growing the pool.
    pub congestion_secs: u32,
}

impl Default for CfgChannels {
    fn default() -> Self {
        Self {
            min_c0: 1,
            min_cn: 0,
            multislot_max_down: 1,
            multislot_max_up: 1,
            congestion_threshold_pct: 200,
            congestion_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgDownlink {
    /// Blocks between RRBP ack/nack polls in steady state.
    pub poll_interval: u32,
    /// Coding scheme index (1..=4) used when retrying a failed TBF;
    /// 0 disables the retry entirely.
    pub retry_coding: u32,
    /// Persistent (keep-alive) downlink TBF mode; 0 disables.
    pub persist_ms: u32,
    pub keepalive_ms: u32,
    /// Queued PDUs older than this are dropped instead of retried.
    pub pdu_expire_ms: u32,
    /// Use CS-4 toward an MS whose mean RSSI exceeds this, CS-1 otherwise
    /// (applies to both directions).
    pub coding_rssi_threshold: i32,
}

impl Default for CfgDownlink {
    fn default() -> Self {
        Self {
            poll_interval: 8,
            retry_coding: 1,
            persist_ms: 0,
            keepalive_ms: 300,
            pdu_expire_ms: 30000,
            coding_rssi_threshold: -40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfgUplink {
    /// Received blocks between unsolicited ack/nacks.
    pub blocks_per_acknack: u32,
    /// Extended uplink TBF (persistent) mode; 0 disables.
    pub persist_ms: u32,
    pub keepalive_ms: u32,
}

impl Default for CfgUplink {
    fn default() -> Self {
        Self {
            blocks_per_acknack: 10,
            persist_ms: 0,
            keepalive_ms: 300,
        }
    }
}

/// Bring-up toggles. These are read once at startup and must stay out of
/// the per-block control flow.
#[derive(Debug, Clone)]
pub struct CfgDebug {
    /// Disable real-time pacing; the tick is advanced manually.
    pub single_step: bool,
    /// Reserve only odd-numbered uplink blocks, leaving even blocks
    /// guaranteed free of uplink data.
    pub odd_block_reservations: bool,
    /// Minimum RRBP code (0..=3) to use; raise when a desynced radio
    /// clock makes near reservations unanswerable.
    pub rrbp_min: u32,
    /// Blocks the MS needs between receiving a CCCH reservation and
    /// reacting (GSM 05.10 6.11.1 plus clock slop).
    pub ms_response_blocks: u32,
    /// Drop RACHes when the AGCH queue exceeds this depth; 0 = unlimited.
    pub agch_qmax: u32,
    /// Follow a CCCH downlink assignment with a polled power control /
    /// timing advance message, to prove the MS is really listening.
    pub send_extra_ta: bool,
}

impl Default for CfgDebug {
    fn default() -> Self {
        Self {
            single_step: false,
            odd_block_reservations: false,
            rrbp_min: 0,
            ms_response_blocks: 4,
            agch_qmax: 0,
            send_extra_ta: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub debug_log: Option<String>,
    pub counters: CfgCounters,
    pub timers: CfgTimers,
    pub channels: CfgChannels,
    pub downlink: CfgDownlink,
    pub uplink: CfgUplink,
    pub debug: CfgDebug,
}

impl StackConfig {
    /// Validate that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.counters.n3101_max <= 8 {
            return Err("counters.n3101_max must be greater than 8 (GSM 04.60 sec 13)".into());
        }
        if !(0..=3).contains(&self.debug.rrbp_min) {
            return Err("debug.rrbp_min must be in 0..=3".into());
        }
        if self.downlink.retry_coding > 4 {
            return Err("downlink.retry_coding must be 0 (off) or 1..=4".into());
        }
        // poll_interval plus the RRBP guard must stay well inside the
        // 64-block window or every TBF would stall before its first poll.
        if self.downlink.poll_interval == 0 || self.downlink.poll_interval >= 56 {
            return Err("downlink.poll_interval must be in 1..56".into());
        }
        if self.uplink.blocks_per_acknack == 0 {
            return Err("uplink.blocks_per_acknack must be nonzero".into());
        }
        if self.channels.multislot_max_down == 0 || self.channels.multislot_max_up == 0 {
            return Err("multislot maxima must be at least 1".into());
        }
        Ok(())
    }
}

/// Shared configuration handle, immutable after construction.
#[derive(Clone)]
pub struct SharedConfig {
    cfg: Arc<StackConfig>,
}

impl SharedConfig {
    pub fn from_config(cfg: StackConfig) -> Self {
        match cfg.validate() {
            Ok(_) => {}
            Err(e) => panic!("Invalid stack configuration: {}", e),
        }
        Self { cfg: Arc::new(cfg) }
    }

    /// Access immutable config.
    pub fn config(&self) -> Arc<StackConfig> {
        Arc::clone(&self.cfg)
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::from_config(StackConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        StackConfig::default().validate().unwrap();
    }

    #[test]
    fn test_t3193_derivation() {
        let mut t = CfgTimers::default();
        assert_eq!(t.t3193_effective(), 550);
        t.t3193 = 700;
        assert_eq!(t.t3193_effective(), 700);
    }

    #[test]
    fn test_validate_rejects() {
        let mut cfg = StackConfig::default();
        cfg.counters.n3101_max = 4;
        assert!(cfg.validate().is_err());

        let mut cfg = StackConfig::default();
        cfg.debug.rrbp_min = 5;
        assert!(cfg.validate().is_err());
    }
}
