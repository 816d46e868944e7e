//! Test bed assembling a full scheduler with stub collaborators, driven
//! tick by tick in single-step mode.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use gprs_config::{SharedConfig, StackConfig};
use gprs_core::{Bsn, ChannelCoding, Tlli};
use gprs_mac::{ChannelSource, Mac, MacHandle, PhyPort, TxFlags, TxKind, UpperLayer};
use gprs_mac::arena::ChanId;
use gprs_msgs::{
    DlMsg, FlatCodec, PacketControlAck, PacketDownlinkAckNack, PacketResourceRequest, RadData, UlBlockKind, UlDataBlock,
    UlMacHeader, UlMsg, UlRadioBlock,
};

#[derive(Debug, Clone)]
pub struct TxRecord {
    pub chan: ChanId,
    pub bsn: Bsn,
    pub bits: Vec<u8>,
    pub flags: TxFlags,
}

#[derive(Default)]
pub struct PhyLog {
    pub tx: Vec<TxRecord>,
    pub agch: Vec<Vec<u8>>,
}

struct LogPhy {
    log: Arc<Mutex<PhyLog>>,
}

impl PhyPort for LogPhy {
    fn transmit(&mut self, chan: ChanId, bsn: Bsn, bits: Vec<u8>, flags: TxFlags) {
        self.log.lock().unwrap().tx.push(TxRecord { chan, bsn, bits, flags });
    }

    fn send_agch(&mut self, bits: Vec<u8>) {
        self.log.lock().unwrap().agch.push(bits);
    }
}

/// Circuit-switched side stub: a fixed pool of channels on one ARFCN.
struct StubChannels {
    c0: Vec<(u16, u8)>,
    others: Vec<(u16, u8)>,
}

impl ChannelSource for StubChannels {
    fn acquire_c0(&mut self) -> Option<(u16, u8)> {
        if self.c0.is_empty() {
            None
        } else {
            Some(self.c0.remove(0))
        }
    }

    fn acquire_group(&mut self, need: usize) -> Vec<(u16, u8)> {
        let take = need.min(self.others.len());
        self.others.split_off(self.others.len() - take)
    }

    fn release(&mut self, arfcn: u16, tn: u8) {
        self.c0.push((arfcn, tn));
    }
}

#[derive(Default)]
pub struct UpperLog {
    pub pdus: Vec<(Tlli, Vec<u8>)>,
}

struct LogUpper {
    log: Arc<Mutex<UpperLog>>,
}

impl UpperLayer for LogUpper {
    fn deliver_pdu(&mut self, tlli: Tlli, data: Vec<u8>) {
        self.log.lock().unwrap().pdus.push((tlli, data));
    }
}

pub struct TestBed {
    pub mac: Mac,
    pub handle: MacHandle,
    pub phy: Arc<Mutex<PhyLog>>,
    pub upper: Arc<Mutex<UpperLog>>,
    pub codec: FlatCodec,
}

pub fn default_test_config() -> StackConfig {
    let mut cfg = StackConfig::default();
    cfg.debug.single_step = true;
    cfg
}

impl TestBed {
    pub fn new(cfg: StackConfig) -> TestBed {
        let phy = Arc::new(Mutex::new(PhyLog::default()));
        let upper = Arc::new(Mutex::new(UpperLog::default()));
        let (mac, handle) = Mac::new(
            SharedConfig::from_config(cfg),
            Box::new(FlatCodec),
            Box::new(LogPhy { log: phy.clone() }),
            Box::new(StubChannels {
                c0: vec![(51, 2), (51, 3), (51, 4)],
                others: vec![(52, 5), (52, 6), (52, 7)],
            }),
            Box::new(LogUpper { log: upper.clone() }),
        );
        TestBed {
            mac,
            handle,
            phy,
            upper,
            codec: FlatCodec,
        }
    }

    pub fn tick(&mut self) {
        self.mac.tick();
    }

    pub fn tick_n(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    pub fn now(&self) -> Bsn {
        self.mac.now()
    }

    /// The (arfcn, tn) of a channel handle.
    pub fn chan_pos(&self, chan: ChanId) -> (u16, u8) {
        let pdch = self.mac.channels.get(chan).expect("unknown channel");
        (pdch.arfcn, pdch.tn)
    }

    /// Take every transmit record so far.
    pub fn take_tx(&mut self) -> Vec<TxRecord> {
        std::mem::take(&mut self.phy.lock().unwrap().tx)
    }

    /// Take and decode the AGCH (CCCH) messages sent so far.
    pub fn take_agch(&mut self) -> Vec<DlMsg> {
        let raw = std::mem::take(&mut self.phy.lock().unwrap().agch);
        raw.iter().map(|bits| self.codec.decode_downlink(bits).expect("bad agch msg")).collect()
    }

    /// Decode the control messages among a set of transmit records.
    pub fn decode_controls(&self, records: &[TxRecord]) -> Vec<(TxRecord, DlMsg)> {
        records
            .iter()
            .filter(|r| r.flags.kind == TxKind::Control)
            .map(|r| (r.clone(), self.codec.decode_downlink(&r.bits).expect("bad control msg")))
            .collect()
    }

    pub fn delivered_pdus(&self) -> Vec<(Tlli, Vec<u8>)> {
        self.upper.lock().unwrap().pdus.clone()
    }

    // -------------------------------------------------------------
    // MS-side stimuli
    // -------------------------------------------------------------

    pub fn send_rach(&mut self, code: u8, frame: u32) {
        self.handle.deliver_rach(code, frame, RadData { rssi: -60.0, timing_error: 2.0 });
    }

    fn send_control(&mut self, arfcn: u16, tn: u8, bsn: Bsn, msg: &UlMsg) {
        let bits = self.codec.encode_uplink(msg);
        self.handle.deliver_uplink_block(
            arfcn,
            tn,
            UlRadioBlock {
                bsn,
                rad: RadData { rssi: -60.0, timing_error: 2.0 },
                kind: UlBlockKind::Control(bits),
            },
        );
    }

    pub fn send_resource_request(&mut self, arfcn: u16, tn: u8, bsn: Bsn, tlli: Tlli, octets: u16) {
        let msg = UlMsg::ResourceRequest(PacketResourceRequest {
            addr: gprs_msgs::MsAddr::Tlli(tlli),
            crd: gprs_msgs::ChannelRequestDescription {
                peak_throughput: 1,
                radio_priority: 2,
                rlc_unack_mode: false,
                llc_frame_type: 1,
                octet_count: octets,
            },
        });
        self.send_control(arfcn, tn, bsn, &msg);
    }

    pub fn send_control_ack(&mut self, arfcn: u16, tn: u8, bsn: Bsn, tlli: Tlli) {
        self.send_control(arfcn, tn, bsn, &UlMsg::ControlAck(PacketControlAck { tlli }));
    }

    pub fn send_dl_acknack(&mut self, arfcn: u16, tn: u8, bsn: Bsn, acknack: PacketDownlinkAckNack) {
        self.send_control(arfcn, tn, bsn, &UlMsg::DownlinkAckNack(acknack));
    }

    pub fn send_data_block(&mut self, arfcn: u16, tn: u8, bsn: Bsn, tfi: u8, sn: u8, countdown: u8, payload: Vec<u8>) {
        self.handle.deliver_uplink_block(
            arfcn,
            tn,
            UlRadioBlock {
                bsn,
                rad: RadData { rssi: -60.0, timing_error: 2.0 },
                kind: UlBlockKind::Data(UlDataBlock {
                    mac: UlMacHeader { countdown, stall: false },
                    tfi,
                    sn,
                    extended: true,
                    coding: ChannelCoding::Cs1,
                    payload,
                }),
            },
        );
    }

    // -------------------------------------------------------------
    // Scenario building blocks
    // -------------------------------------------------------------

    /// RACH in and answer the single-block grant with a resource request;
    /// returns the channel the exchange happened on.
    pub fn establish_uplink_request(&mut self, tlli: Tlli, octets: u16) -> (u16, u8) {
        self.send_rach(0x78, 100);
        self.tick();
        let agch = self.take_agch();
        let ia = agch
            .iter()
            .rev()
            .find_map(|m| match m {
                DlMsg::ImmediateAssignment(ia) => Some(ia.clone()),
                _ => None,
            })
            .expect("no immediate assignment on AGCH");
        let reserved = Bsn::new(ia.reserved_frame as i32);

        // Run up to the reserved block and answer in it.
        while self.now().is_before(reserved) {
            self.tick();
        }
        self.send_resource_request(ia.arfcn, ia.tn, reserved, tlli, octets);
        self.tick();
        (ia.arfcn, ia.tn)
    }

    /// Full uplink establishment: RACH, resource request, assignment ack.
    /// Returns (arfcn, tn, tfi, usf) of the running session.
    pub fn establish_uplink_session(&mut self, tlli: Tlli, octets: u16) -> (u16, u8, u8, u8) {
        let (arfcn, tn) = self.establish_uplink_request(tlli, octets);
        let tx = self.take_tx();
        let (_rec, ua, reserved) = self
            .last_control(&tx, |m| match m {
                DlMsg::UplinkAssignment(ua) => Some(ua.clone()),
                _ => None,
            })
            .expect("no uplink assignment sent");
        while self.now().is_before(reserved) {
            self.tick();
        }
        self.send_control_ack(arfcn, tn, reserved, tlli);
        self.tick();
        (arfcn, tn, ua.tfi, ua.usfs.first().map(|(_, u)| *u).unwrap_or(0))
    }

    /// Find the most recent control message of a kind on the packet
    /// channel, with the BSN its RRBP reservation points at.
    pub fn last_control<F, T>(&mut self, records: &[TxRecord], pick: F) -> Option<(TxRecord, T, Bsn)>
    where
        F: Fn(&DlMsg) -> Option<T>,
    {
        for (rec, msg) in self.decode_controls(records).into_iter().rev() {
            if let Some(t) = pick(&msg) {
                let reserved = rec.flags.rrbp.map(|r| rec.bsn.add(3 + r as i32)).unwrap_or(Bsn::INVALID);
                return Some((rec, t, reserved));
            }
        }
        None
    }
}
