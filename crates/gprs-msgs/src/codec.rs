use gprs_core::{ChannelCoding, Direction, Tlli};

use crate::control::*;
use crate::data::DlDataBlock;

/// Decode failure for a received control block. The block is logged and
/// dropped; decode errors never propagate out of the service loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadMessageType(u8),
    BadValue(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated control block"),
            DecodeError::BadMessageType(t) => write!(f, "unknown message type {}", t),
            DecodeError::BadValue(what) => write!(f, "bad value: {}", what),
        }
    }
}

impl std::error::Error for DecodeError {}

/// The bit-exact serialization boundary. The core constructs abstract
/// message records and hands them here; it never inspects raw bit offsets
/// itself. A production implementation wraps the CSN.1 encoder of the
/// radio stack; [`FlatCodec`] is a self-contained stand-in.
pub trait MsgCodec: Send {
    /// Encode a downlink control message for transmission.
    fn encode_control(&self, msg: &DlMsg) -> Vec<u8>;

    /// Encode a downlink data block for transmission.
    fn encode_data(&self, block: &DlDataBlock) -> Vec<u8>;

    /// Decode a received uplink control block.
    fn decode_control(&self, bits: &[u8]) -> Result<UlMsg, DecodeError>;
}

// ---------------------------------------------------------------------
// FlatCodec: a plain tagged-byte representation. Not the air interface
// format; used by tests and the loopback phy backend.
// ---------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct FlatCodec;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(tag: u8) -> Writer {
        Writer { buf: vec![tag] }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn bitmap(&mut self, bits: &[bool; ACKNACK_BITMAP_LEN]) {
        for chunk in bits.chunks(8) {
            let mut b = 0u8;
            for (i, &set) in chunk.iter().enumerate() {
                if set {
                    b |= 1 << (7 - i);
                }
            }
            self.buf.push(b);
        }
    }
    fn addr(&mut self, addr: &MsAddr) {
        match addr {
            MsAddr::Tlli(tlli) => {
                self.u8(0);
                self.u32(*tlli);
            }
            MsAddr::Gtfi { dir, tfi } => {
                self.u8(1);
                self.u8(dir.index() as u8);
                self.u8(*tfi);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(v)
    }
    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }
    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(((self.u8()? as u16) << 8) | self.u8()? as u16)
    }
    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(((self.u16()? as u32) << 16) | self.u16()? as u32)
    }
    fn bitmap(&mut self) -> Result<[bool; ACKNACK_BITMAP_LEN], DecodeError> {
        let mut out = [false; ACKNACK_BITMAP_LEN];
        for chunk in out.chunks_mut(8) {
            let b = self.u8()?;
            for (i, slot) in chunk.iter_mut().enumerate() {
                *slot = b & (1 << (7 - i)) != 0;
            }
        }
        Ok(out)
    }
    fn addr(&mut self) -> Result<MsAddr, DecodeError> {
        match self.u8()? {
            0 => Ok(MsAddr::Tlli(self.u32()? as Tlli)),
            1 => {
                let dir = match self.u8()? {
                    0 => Direction::Up,
                    1 => Direction::Down,
                    _ => return Err(DecodeError::BadValue("direction")),
                };
                Ok(MsAddr::Gtfi { dir, tfi: self.u8()? })
            }
            _ => Err(DecodeError::BadValue("addr kind")),
        }
    }
}

const TAG_CONTROL_ACK: u8 = 0x81;
const TAG_RESOURCE_REQUEST: u8 = 0x82;
const TAG_DL_ACKNACK: u8 = 0x83;

const TAG_IMM_ASSIGN: u8 = 0x01;
const TAG_UL_ASSIGN: u8 = 0x02;
const TAG_DL_ASSIGN: u8 = 0x03;
const TAG_UL_ACKNACK: u8 = 0x04;
const TAG_TBF_RELEASE: u8 = 0x05;
const TAG_POWER_CONTROL: u8 = 0x06;
const TAG_DATA: u8 = 0x40;

impl FlatCodec {
    /// Encode an uplink control message. The network side never does this;
    /// it exists so tests and MS simulators can feed decode_control.
    pub fn encode_uplink(&self, msg: &UlMsg) -> Vec<u8> {
        match msg {
            UlMsg::ControlAck(m) => {
                let mut w = Writer::new(TAG_CONTROL_ACK);
                w.u32(m.tlli);
                w.buf
            }
            UlMsg::ResourceRequest(m) => {
                let mut w = Writer::new(TAG_RESOURCE_REQUEST);
                w.addr(&m.addr);
                w.u8(m.crd.peak_throughput);
                w.u8(m.crd.radio_priority);
                w.bool(m.crd.rlc_unack_mode);
                w.u8(m.crd.llc_frame_type);
                w.u16(m.crd.octet_count);
                w.buf
            }
            UlMsg::DownlinkAckNack(m) => {
                let mut w = Writer::new(TAG_DL_ACKNACK);
                w.u8(m.tfi);
                w.bool(m.desc.final_ack);
                w.u8(m.desc.ssn);
                w.bitmap(&m.desc.bitmap);
                w.u8(m.quality.c_value);
                w.u8(m.quality.rxqual);
                w.u8(m.quality.sign_var);
                w.buf
            }
        }
    }

    /// Decode a downlink control message; the inverse of encode_control.
    pub fn decode_downlink(&self, bits: &[u8]) -> Result<DlMsg, DecodeError> {
        let mut r = Reader::new(bits);
        let tag = r.u8()?;
        match tag {
            TAG_IMM_ASSIGN => Ok(DlMsg::ImmediateAssignment(ImmediateAssignment {
                request_code: r.u8()?,
                request_frame: r.u32()?,
                reserved_frame: r.u32()?,
                timing_advance: r.u8()?,
                arfcn: r.u16()?,
                tn: r.u8()?,
                poll: r.bool()?,
            })),
            TAG_UL_ASSIGN => {
                let addr = r.addr()?;
                let tfi = r.u8()?;
                let n = r.u8()? as usize;
                let mut usfs = Vec::with_capacity(n);
                for _ in 0..n {
                    usfs.push((r.u8()?, r.u8()?));
                }
                Ok(DlMsg::UplinkAssignment(PacketUplinkAssignment {
                    addr,
                    tfi,
                    usfs,
                    coding: ChannelCoding::from_index(r.u8()?).ok_or(DecodeError::BadValue("coding"))?,
                    arfcn: r.u16()?,
                    timeslot_mask: r.u8()?,
                    timing_advance: r.u8()?,
                }))
            }
            TAG_DL_ASSIGN => Ok(DlMsg::DownlinkAssignment(PacketDownlinkAssignment {
                addr: r.addr()?,
                tfi: r.u8()?,
                arfcn: r.u16()?,
                timeslot_mask: r.u8()?,
                timing_advance: r.u8()?,
                control_ack: r.bool()?,
            })),
            TAG_UL_ACKNACK => Ok(DlMsg::UplinkAckNack(PacketUplinkAckNack {
                tfi: r.u8()?,
                desc: AckNackDescription {
                    final_ack: r.bool()?,
                    ssn: r.u8()?,
                    bitmap: r.bitmap()?,
                },
                coding_command: ChannelCoding::from_index(r.u8()?).ok_or(DecodeError::BadValue("coding"))?,
            })),
            TAG_TBF_RELEASE => Ok(DlMsg::TbfRelease(PacketTbfRelease {
                dir: if r.u8()? == 0 { Direction::Up } else { Direction::Down },
                tfi: r.u8()?,
                cause: r.u8()?,
            })),
            TAG_POWER_CONTROL => Ok(DlMsg::PowerControl(PacketPowerControl {
                addr: r.addr()?,
                alpha: r.u8()?,
                gamma: r.u8()?,
                timing_advance: r.u8()?,
            })),
            t => Err(DecodeError::BadMessageType(t)),
        }
    }
}

impl MsgCodec for FlatCodec {
    fn encode_control(&self, msg: &DlMsg) -> Vec<u8> {
        match msg {
            DlMsg::ImmediateAssignment(m) => {
                let mut w = Writer::new(TAG_IMM_ASSIGN);
                w.u8(m.request_code);
                w.u32(m.request_frame);
                w.u32(m.reserved_frame);
                w.u8(m.timing_advance);
                w.u16(m.arfcn);
                w.u8(m.tn);
                w.bool(m.poll);
                w.buf
            }
            DlMsg::UplinkAssignment(m) => {
                let mut w = Writer::new(TAG_UL_ASSIGN);
                w.addr(&m.addr);
                w.u8(m.tfi);
                w.u8(m.usfs.len() as u8);
                for (tn, usf) in &m.usfs {
                    w.u8(*tn);
                    w.u8(*usf);
                }
                w.u8(m.coding.index());
                w.u16(m.arfcn);
                w.u8(m.timeslot_mask);
                w.u8(m.timing_advance);
                w.buf
            }
            DlMsg::DownlinkAssignment(m) => {
                let mut w = Writer::new(TAG_DL_ASSIGN);
                w.addr(&m.addr);
                w.u8(m.tfi);
                w.u16(m.arfcn);
                w.u8(m.timeslot_mask);
                w.u8(m.timing_advance);
                w.bool(m.control_ack);
                w.buf
            }
            DlMsg::UplinkAckNack(m) => {
                let mut w = Writer::new(TAG_UL_ACKNACK);
                w.u8(m.tfi);
                w.bool(m.desc.final_ack);
                w.u8(m.desc.ssn);
                w.bitmap(&m.desc.bitmap);
                w.u8(m.coding_command.index());
                w.buf
            }
            DlMsg::TbfRelease(m) => {
                let mut w = Writer::new(TAG_TBF_RELEASE);
                w.u8(m.dir.index() as u8);
                w.u8(m.tfi);
                w.u8(m.cause);
                w.buf
            }
            DlMsg::PowerControl(m) => {
                let mut w = Writer::new(TAG_POWER_CONTROL);
                w.addr(&m.addr);
                w.u8(m.alpha);
                w.u8(m.gamma);
                w.u8(m.timing_advance);
                w.buf
            }
        }
    }

    fn encode_data(&self, block: &DlDataBlock) -> Vec<u8> {
        let mut w = Writer::new(TAG_DATA);
        w.u8(block.coding.index());
        w.u8(block.tfi);
        w.u8(block.sn);
        w.bool(block.fbi);
        w.bool(block.extended);
        w.u16(block.payload.len() as u16);
        w.buf.extend_from_slice(&block.payload);
        w.buf
    }

    fn decode_control(&self, bits: &[u8]) -> Result<UlMsg, DecodeError> {
        let mut r = Reader::new(bits);
        let tag = r.u8()?;
        match tag {
            TAG_CONTROL_ACK => Ok(UlMsg::ControlAck(PacketControlAck { tlli: r.u32()? })),
            TAG_RESOURCE_REQUEST => Ok(UlMsg::ResourceRequest(PacketResourceRequest {
                addr: r.addr()?,
                crd: ChannelRequestDescription {
                    peak_throughput: r.u8()?,
                    radio_priority: r.u8()?,
                    rlc_unack_mode: r.bool()?,
                    llc_frame_type: r.u8()?,
                    octet_count: r.u16()?,
                },
            })),
            TAG_DL_ACKNACK => Ok(UlMsg::DownlinkAckNack(PacketDownlinkAckNack {
                tfi: r.u8()?,
                desc: AckNackDescription {
                    final_ack: r.bool()?,
                    ssn: r.u8()?,
                    bitmap: r.bitmap()?,
                },
                quality: ChannelQuality {
                    c_value: r.u8()?,
                    rxqual: r.u8()?,
                    sign_var: r.u8()?,
                },
            })),
            t => Err(DecodeError::BadMessageType(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uplink_roundtrip() {
        let codec = FlatCodec;
        let mut bitmap = [false; ACKNACK_BITMAP_LEN];
        bitmap[0] = true;
        bitmap[5] = true;
        bitmap[63] = true;
        let msgs = [
            UlMsg::ControlAck(PacketControlAck { tlli: 0xc000_1234 }),
            UlMsg::ResourceRequest(PacketResourceRequest {
                addr: MsAddr::Tlli(0x8000_0001),
                crd: ChannelRequestDescription {
                    peak_throughput: 3,
                    radio_priority: 1,
                    rlc_unack_mode: false,
                    llc_frame_type: 0,
                    octet_count: 512,
                },
            }),
            UlMsg::DownlinkAckNack(PacketDownlinkAckNack {
                tfi: 17,
                desc: AckNackDescription {
                    final_ack: false,
                    ssn: 42,
                    bitmap,
                },
                quality: ChannelQuality {
                    c_value: 30,
                    rxqual: 2,
                    sign_var: 1,
                },
            }),
        ];
        for msg in msgs {
            let bits = codec.encode_uplink(&msg);
            let back = codec.decode_control(&bits).unwrap();
            assert_eq!(format!("{:?}", back), format!("{:?}", msg));
        }
    }

    #[test]
    fn test_downlink_roundtrip() {
        let codec = FlatCodec;
        let msg = DlMsg::UplinkAssignment(PacketUplinkAssignment {
            addr: MsAddr::Gtfi {
                dir: Direction::Up,
                tfi: 3,
            },
            tfi: 3,
            usfs: vec![(2, 1), (3, 1)],
            coding: ChannelCoding::Cs2,
            arfcn: 51,
            timeslot_mask: 0b0000_1100,
            timing_advance: 7,
        });
        let bits = codec.encode_control(&msg);
        let back = codec.decode_downlink(&bits).unwrap();
        assert_eq!(format!("{:?}", back), format!("{:?}", msg));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = FlatCodec;
        assert_eq!(codec.decode_control(&[]), Err(DecodeError::Truncated));
        assert!(matches!(codec.decode_control(&[0xff, 1, 2]), Err(DecodeError::BadMessageType(_))));
        assert_eq!(codec.decode_control(&[TAG_CONTROL_ACK, 1]), Err(DecodeError::Truncated));
    }
}
