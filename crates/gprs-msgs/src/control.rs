use gprs_core::{ChannelCoding, Direction, Tfi, Tlli, Usf};

/// How a control message addresses an MS. A TBF-scoped message may use the
/// global TFI; an MS that has no TBF yet can only be addressed by TLLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsAddr {
    Tlli(Tlli),
    Gtfi { dir: Direction, tfi: Tfi },
}

/// The window size of the ack/nack bitmap.
pub const ACKNACK_BITMAP_LEN: usize = 64;

/// GSM 04.60 12.3 Ack/Nack Description.
///
/// The bitmap is indexed backwards from SSN: bit i covers sequence number
/// (ssn - 1 - i) mod 128. When final_ack is set the rest is ignored.
#[derive(Clone, PartialEq, Eq)]
pub struct AckNackDescription {
    pub final_ack: bool,
    pub ssn: u8,
    pub bitmap: [bool; ACKNACK_BITMAP_LEN],
}

impl AckNackDescription {
    pub fn new_final() -> Self {
        Self {
            final_ack: true,
            ssn: 0,
            bitmap: [false; ACKNACK_BITMAP_LEN],
        }
    }
}

impl std::fmt::Debug for AckNackDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let acked = self.bitmap.iter().filter(|&&b| b).count();
        write!(f, "AckNack(final={} ssn={} acked={}/64)", self.final_ack, self.ssn, acked)
    }
}

/// GSM 04.60 11.2.16 Channel Request Description, inside a resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelRequestDescription {
    pub peak_throughput: u8,
    pub radio_priority: u8,
    pub rlc_unack_mode: bool,
    pub llc_frame_type: u8,
    /// Octets the MS wants to send. 0 means open-ended.
    pub octet_count: u16,
}

/// Channel quality report carried in a Packet Downlink Ack/Nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelQuality {
    pub c_value: u8,
    pub rxqual: u8,
    pub sign_var: u8,
}

// ------------------------- downlink messages -------------------------

/// Answer to a RACH on CCCH: a single-block uplink reservation.
#[derive(Debug, Clone)]
pub struct ImmediateAssignment {
    /// Request reference: the RACH code and (truncated) frame it came in.
    pub request_code: u8,
    pub request_frame: u32,
    /// Frame number of the reserved single uplink block.
    pub reserved_frame: u32,
    pub timing_advance: u8,
    pub arfcn: u16,
    pub tn: u8,
    /// Ask the MS to answer the reservation with a control acknowledgement.
    pub poll: bool,
}

#[derive(Debug, Clone)]
pub struct PacketUplinkAssignment {
    pub addr: MsAddr,
    pub tfi: Tfi,
    /// (timeslot, usf) for each assigned uplink channel.
    pub usfs: Vec<(u8, Usf)>,
    pub coding: ChannelCoding,
    pub arfcn: u16,
    pub timeslot_mask: u8,
    pub timing_advance: u8,
}

#[derive(Debug, Clone)]
pub struct PacketDownlinkAssignment {
    pub addr: MsAddr,
    pub tfi: Tfi,
    pub arfcn: u16,
    pub timeslot_mask: u8,
    pub timing_advance: u8,
    /// Tells the MS this assignment supersedes any earlier TBF state.
    pub control_ack: bool,
}

#[derive(Debug, Clone)]
pub struct PacketUplinkAckNack {
    pub tfi: Tfi,
    pub desc: AckNackDescription,
    /// Coding the MS must use from now on.
    pub coding_command: ChannelCoding,
}

#[derive(Debug, Clone)]
pub struct PacketTbfRelease {
    pub dir: Direction,
    pub tfi: Tfi,
    /// 0 normal, 2 abnormal.
    pub cause: u8,
}

#[derive(Debug, Clone)]
pub struct PacketPowerControl {
    pub addr: MsAddr,
    pub alpha: u8,
    pub gamma: u8,
    pub timing_advance: u8,
}

/// Downlink RLC/MAC control message records, encoded by the external codec.
#[derive(Debug, Clone)]
pub enum DlMsg {
    ImmediateAssignment(ImmediateAssignment),
    UplinkAssignment(PacketUplinkAssignment),
    DownlinkAssignment(PacketDownlinkAssignment),
    UplinkAckNack(PacketUplinkAckNack),
    TbfRelease(PacketTbfRelease),
    PowerControl(PacketPowerControl),
}

impl DlMsg {
    pub fn name(&self) -> &'static str {
        match self {
            DlMsg::ImmediateAssignment(_) => "ImmediateAssignment",
            DlMsg::UplinkAssignment(_) => "PacketUplinkAssignment",
            DlMsg::DownlinkAssignment(_) => "PacketDownlinkAssignment",
            DlMsg::UplinkAckNack(_) => "PacketUplinkAckNack",
            DlMsg::TbfRelease(_) => "PacketTbfRelease",
            DlMsg::PowerControl(_) => "PacketPowerControl",
        }
    }
}

// ------------------------- uplink messages -------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketControlAck {
    pub tlli: Tlli,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketResourceRequest {
    pub addr: MsAddr,
    pub crd: ChannelRequestDescription,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketDownlinkAckNack {
    pub tfi: Tfi,
    pub desc: AckNackDescription,
    pub quality: ChannelQuality,
}

/// Uplink RLC/MAC control message records, decoded by the external codec.
#[derive(Debug, Clone, PartialEq)]
pub enum UlMsg {
    ControlAck(PacketControlAck),
    ResourceRequest(PacketResourceRequest),
    DownlinkAckNack(PacketDownlinkAckNack),
}

impl UlMsg {
    pub fn name(&self) -> &'static str {
        match self {
            UlMsg::ControlAck(_) => "PacketControlAck",
            UlMsg::ResourceRequest(_) => "PacketResourceRequest",
            UlMsg::DownlinkAckNack(_) => "PacketDownlinkAckNack",
        }
    }
}
