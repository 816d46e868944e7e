use clap::Parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gprs_config::{toml_config, SharedConfig};
use gprs_core::{debug, Bsn, Tlli};
use gprs_mac::arena::ChanId;
use gprs_mac::{sched, ChannelSource, Mac, PhyPort, TxFlags, UpperLayer};
use gprs_msgs::FlatCodec;

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> SharedConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

/// Stand-in physical layer: logs transmissions instead of radiating them.
/// A real deployment implements PhyPort against the channel coder.
struct NullPhy;

impl PhyPort for NullPhy {
    fn transmit(&mut self, chan: ChanId, bsn: Bsn, bits: Vec<u8>, flags: TxFlags) {
        tracing::trace!("tx chan={} bsn={} len={} {:?}", chan, bsn, bits.len(), flags);
    }

    fn send_agch(&mut self, bits: Vec<u8>) {
        tracing::trace!("agch len={}", bits.len());
    }
}

/// Static channel pool standing in for the circuit-switched side.
struct StaticChannels {
    free: Vec<(u16, u8)>,
}

impl ChannelSource for StaticChannels {
    fn acquire_c0(&mut self) -> Option<(u16, u8)> {
        if self.free.is_empty() {
            None
        } else {
            Some(self.free.remove(0))
        }
    }

    fn acquire_group(&mut self, need: usize) -> Vec<(u16, u8)> {
        let take = need.min(self.free.len());
        self.free.split_off(self.free.len() - take)
    }

    fn release(&mut self, arfcn: u16, tn: u8) {
        self.free.push((arfcn, tn));
    }
}

/// Upper layer stub: logs completed uplink PDUs. A real deployment wires
/// this to the SGSN-facing session layer.
struct LogUpper;

impl UpperLayer for LogUpper {
    fn deliver_pdu(&mut self, tlli: Tlli, data: Vec<u8>) {
        tracing::info!("uplink PDU tlli={:08x} len={}", tlli, data.len());
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "GPRS RLC/MAC base station scheduler",
    long_about = "Runs the GPRS RLC/MAC scheduler using the provided TOML configuration file"
)]
struct Args {
    /// Config file (required)
    #[arg(help = "TOML config with counters, timers and channel policy")]
    config: String,

    /// ARFCN of the home carrier
    #[arg(long, default_value_t = 51)]
    arfcn: u16,
}

fn main() {
    let args = Args::parse();
    let cfg = load_config_from_toml(&args.config);
    let _log_guard = debug::setup_logging_default(cfg.config().debug_log.clone());

    let pool: Vec<(u16, u8)> = (0..8).map(|tn| (args.arfcn, tn)).collect();
    let (mac, _handle) = Mac::new(
        cfg,
        Box::new(FlatCodec),
        Box::new(NullPhy),
        Box::new(StaticChannels { free: pool }),
        Box::new(LogUpper),
    );
    let mac = Arc::new(Mutex::new(mac));

    // Set up Ctrl+C handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl+C handler");

    sched::run_loop(&mac, &running);

    let mut out = String::new();
    mac.lock().unwrap().dump(&mut out);
    println!("{}", out);
}
