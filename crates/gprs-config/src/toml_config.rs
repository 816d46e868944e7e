use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use super::stack_config::{SharedConfig, StackConfig};

/// Build `SharedConfig` from a TOML configuration file
pub fn from_toml_str(toml_str: &str) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    // Various sanity checks
    let expected_config_version = "0.3";
    if !root.config_version.eq(expected_config_version) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, expected_config_version
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    for (name, extra) in [
        ("counters", root.counters.as_ref().map(|s| &s.extra)),
        ("timers", root.timers.as_ref().map(|s| &s.extra)),
        ("channels", root.channels.as_ref().map(|s| &s.extra)),
        ("downlink", root.downlink.as_ref().map(|s| &s.extra)),
        ("uplink", root.uplink.as_ref().map(|s| &s.extra)),
        ("debug", root.debug.as_ref().map(|s| &s.extra)),
    ] {
        if let Some(extra) = extra {
            if !extra.is_empty() {
                return Err(format!("Unrecognized fields in {}: {:?}", name, sorted_keys(extra)).into());
            }
        }
    }

    let mut cfg = StackConfig::default();
    cfg.debug_log = root.debug_log;

    if let Some(c) = root.counters {
        apply_counters_patch(&mut cfg, c);
    }
    if let Some(t) = root.timers {
        apply_timers_patch(&mut cfg, t);
    }
    if let Some(c) = root.channels {
        apply_channels_patch(&mut cfg, c);
    }
    if let Some(d) = root.downlink {
        apply_downlink_patch(&mut cfg, d);
    }
    if let Some(u) = root.uplink {
        apply_uplink_patch(&mut cfg, u);
    }
    if let Some(d) = root.debug {
        apply_debug_patch(&mut cfg, d);
    }

    cfg.validate()?;
    Ok(SharedConfig::from_config(cfg))
}

/// Build `SharedConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `SharedConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let f = File::open(path)?;
    from_reader(BufReader::new(f))
}

fn apply_counters_patch(cfg: &mut StackConfig, src: CountersDto) {
    let dst = &mut cfg.counters;
    if let Some(v) = src.n3101_max {
        dst.n3101_max = v;
    }
    if let Some(v) = src.n3103_max {
        dst.n3103_max = v;
    }
    if let Some(v) = src.n3105_max {
        dst.n3105_max = v;
    }
    if let Some(v) = src.assign_max {
        dst.assign_max = v;
    }
    if let Some(v) = src.tbf_release_max {
        dst.tbf_release_max = v;
    }
    if let Some(v) = src.stuck_window_blocks {
        dst.stuck_window_blocks = v;
    }
}

fn apply_timers_patch(cfg: &mut StackConfig, src: TimersDto) {
    let dst = &mut cfg.timers;
    if let Some(v) = src.t3168 {
        dst.t3168 = v;
    }
    if let Some(v) = src.t3169 {
        dst.t3169 = v;
    }
    if let Some(v) = src.t3191 {
        dst.t3191 = v;
    }
    if let Some(v) = src.t3192 {
        dst.t3192 = v;
    }
    if let Some(v) = src.t3193 {
        dst.t3193 = v;
    }
    if let Some(v) = src.t3195 {
        dst.t3195 = v;
    }
    if let Some(v) = src.ms_idle_secs {
        dst.ms_idle_secs = v;
    }
    if let Some(v) = src.chan_idle_secs {
        dst.chan_idle_secs = v;
    }
    if let Some(v) = src.nonresponsive {
        dst.nonresponsive = v;
    }
}

fn apply_channels_patch(cfg: &mut StackConfig, src: ChannelsDto) {
    let dst = &mut cfg.channels;
    if let Some(v) = src.min_c0 {
        dst.min_c0 = v;
    }
    if let Some(v) = src.min_cn {
        dst.min_cn = v;
    }
    if let Some(v) = src.multislot_max_down {
        dst.multislot_max_down = v;
    }
    if let Some(v) = src.multislot_max_up {
        dst.multislot_max_up = v;
    }
    if let Some(v) = src.congestion_threshold_pct {
        dst.congestion_threshold_pct = v;
    }
    if let Some(v) = src.congestion_secs {
        dst.congestion_secs = v;
    }
}

fn apply_downlink_patch(cfg: &mut StackConfig, src: DownlinkDto) {
    let dst = &mut cfg.downlink;
    if let Some(v) = src.poll_interval {
        dst.poll_interval = v;
    }
    if let Some(v) = src.retry_coding {
        dst.retry_coding = v;
    }
    if let Some(v) = src.persist_ms {
        dst.persist_ms = v;
    }
    if let Some(v) = src.keepalive_ms {
        dst.keepalive_ms = v;
    }
    if let Some(v) = src.pdu_expire_ms {
        dst.pdu_expire_ms = v;
    }
    if let Some(v) = src.coding_rssi_threshold {
        dst.coding_rssi_threshold = v;
    }
}

fn apply_uplink_patch(cfg: &mut StackConfig, src: UplinkDto) {
    let dst = &mut cfg.uplink;
    if let Some(v) = src.blocks_per_acknack {
        dst.blocks_per_acknack = v;
    }
    if let Some(v) = src.persist_ms {
        dst.persist_ms = v;
    }
    if let Some(v) = src.keepalive_ms {
        dst.keepalive_ms = v;
    }
}

fn apply_debug_patch(cfg: &mut StackConfig, src: DebugDto) {
    let dst = &mut cfg.debug;
    if let Some(v) = src.single_step {
        dst.single_step = v;
    }
    if let Some(v) = src.odd_block_reservations {
        dst.odd_block_reservations = v;
    }
    if let Some(v) = src.rrbp_min {
        dst.rrbp_min = v;
    }
    if let Some(v) = src.ms_response_blocks {
        dst.ms_response_blocks = v;
    }
    if let Some(v) = src.agch_qmax {
        dst.agch_qmax = v;
    }
    if let Some(v) = src.send_extra_ta {
        dst.send_extra_ta = v;
    }
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&str> {
    let mut v: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
    v.sort_unstable();
    v
}

/// ----------------------- DTOs for input shape -----------------------

#[derive(Deserialize)]
struct TomlConfigRoot {
    config_version: String,
    debug_log: Option<String>,

    #[serde(default)]
    counters: Option<CountersDto>,

    #[serde(default)]
    timers: Option<TimersDto>,

    #[serde(default)]
    channels: Option<ChannelsDto>,

    #[serde(default)]
    downlink: Option<DownlinkDto>,

    #[serde(default)]
    uplink: Option<UplinkDto>,

    #[serde(default)]
    debug: Option<DebugDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct CountersDto {
    n3101_max: Option<u32>,
    n3103_max: Option<u32>,
    n3105_max: Option<u32>,
    assign_max: Option<u32>,
    tbf_release_max: Option<u32>,
    stuck_window_blocks: Option<u32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct TimersDto {
    t3168: Option<u32>,
    t3169: Option<u32>,
    t3191: Option<u32>,
    t3192: Option<u32>,
    t3193: Option<u32>,
    t3195: Option<u32>,
    ms_idle_secs: Option<u32>,
    chan_idle_secs: Option<u32>,
    nonresponsive: Option<u32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct ChannelsDto {
    min_c0: Option<u32>,
    min_cn: Option<u32>,
    multislot_max_down: Option<u32>,
    multislot_max_up: Option<u32>,
    congestion_threshold_pct: Option<u32>,
    congestion_secs: Option<u32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct DownlinkDto {
    poll_interval: Option<u32>,
    retry_coding: Option<u32>,
    persist_ms: Option<u32>,
    keepalive_ms: Option<u32>,
    pdu_expire_ms: Option<u32>,
    coding_rssi_threshold: Option<i32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct UplinkDto {
    blocks_per_acknack: Option<u32>,
    persist_ms: Option<u32>,
    keepalive_ms: Option<u32>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct DebugDto {
    single_step: Option<bool>,
    odd_block_reservations: Option<bool>,
    rrbp_min: Option<u32>,
    ms_response_blocks: Option<u32>,
    agch_qmax: Option<u32>,
    send_extra_ta: Option<bool>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let cfg = from_toml_str("config_version = \"0.3\"\n").unwrap();
        assert_eq!(cfg.config().counters.n3101_max, 20);
    }

    #[test]
    fn test_patched_sections() {
        let cfg = from_toml_str(
            r#"
config_version = "0.3"

[counters]
n3101_max = 24

[timers]
t3191 = 4000

[debug]
single_step = true
"#,
        )
        .unwrap();
        let c = cfg.config();
        assert_eq!(c.counters.n3101_max, 24);
        assert_eq!(c.counters.n3103_max, 8);
        assert_eq!(c.timers.t3191, 4000);
        assert!(c.debug.single_step);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(from_toml_str("config_version = \"0.3\"\nbogus = 1\n").is_err());
        assert!(from_toml_str("config_version = \"0.3\"\n[counters]\nn3101max = 24\n").is_err());
        assert!(from_toml_str("config_version = \"9.9\"\n").is_err());
    }
}
