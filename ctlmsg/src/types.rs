//! Structured values embedded in control messages: flow specifications,
//! flow/DTCP configuration and statistics snapshots.
use crate::wire::{Dec, Enc};
use std::io::{Error, ErrorKind, Result};

/// QoS requirements asked by an application for a flow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowSpec {
    /// Maximum tolerated gap in SDUs; `u64::MAX` means unbounded.
    pub max_sdu_gap: u64,
    /// Average required bandwidth, bits per second. Zero means don't care.
    pub avg_bandwidth: u64,
    /// Maximum tolerated delay in microseconds. Zero means don't care.
    pub max_delay: u32,
    /// Maximum tolerated loss, in 1/10000 units.
    pub max_loss: u16,
    /// SDUs must be delivered in order.
    pub in_order_delivery: bool,
    /// Message boundaries are preserved.
    pub msg_boundaries: bool,
}

impl Default for FlowSpec {
    fn default() -> Self {
        Self::best_effort()
    }
}

impl FlowSpec {
    /// The spec that asks for nothing: any gap, any bandwidth, any delay.
    pub fn best_effort() -> Self {
        Self {
            max_sdu_gap: u64::MAX,
            avg_bandwidth: 0,
            max_delay: 0,
            max_loss: 0,
            in_order_delivery: false,
            msg_boundaries: true,
        }
    }

    /// True if this spec can be satisfied by an unreliable datagram flow.
    pub fn is_best_effort(&self) -> bool {
        self.max_sdu_gap == u64::MAX && self.avg_bandwidth == 0 && self.max_delay == 0
            && self.max_loss == 0 && !self.in_order_delivery
    }

    pub(crate) fn encode(&self, e: &mut Enc) {
        e.u64(self.max_sdu_gap);
        e.u64(self.avg_bandwidth);
        e.u32(self.max_delay);
        e.u16(self.max_loss);
        e.flag(self.in_order_delivery);
        e.flag(self.msg_boundaries);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        Ok(Self {
            max_sdu_gap: d.u64()?,
            avg_bandwidth: d.u64()?,
            max_delay: d.u32()?,
            max_loss: d.u16()?,
            in_order_delivery: d.flag()?,
            msg_boundaries: d.flag()?,
        })
    }
}

/// Flow control discipline selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FcType {
    /// No flow control.
    None = 0,
    /// Sliding window flow control.
    Window = 1,
}

impl Default for FcType {
    fn default() -> Self {
        FcType::None
    }
}

/// DTCP knobs negotiated per flow.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DtcpConfig {
    /// Flow control enabled.
    pub flow_control: bool,
    /// Retransmission control enabled.
    pub rtx_control: bool,
    /// Flow control discipline.
    pub fc_type: FcType,
    /// Closed window queue bound, PDUs.
    pub max_cwq_len: u16,
    /// Initial window credit, PDUs.
    pub initial_credit: u16,
    /// Retransmission queue bound, PDUs.
    pub max_rtxq_len: u16,
}

impl DtcpConfig {
    /// Window flow control with the given credit and queue bounds.
    pub fn window(initial_credit: u16, max_cwq_len: u16) -> Self {
        Self {
            flow_control: true,
            rtx_control: false,
            fc_type: FcType::Window,
            max_cwq_len,
            initial_credit,
            max_rtxq_len: 0,
        }
    }

    pub(crate) fn encode(&self, e: &mut Enc) {
        e.flag(self.flow_control);
        e.flag(self.rtx_control);
        e.u8(self.fc_type as u8);
        e.u16(self.max_cwq_len);
        e.u16(self.initial_credit);
        e.u16(self.max_rtxq_len);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        let flow_control = d.flag()?;
        let rtx_control = d.flag()?;
        let fc_type = match d.u8()? {
            0 => FcType::None,
            1 => FcType::Window,
            _ => return Err(Error::new(ErrorKind::InvalidData, "bad fc type")),
        };
        Ok(Self {
            flow_control,
            rtx_control,
            fc_type,
            max_cwq_len: d.u16()?,
            initial_credit: d.u16()?,
            max_rtxq_len: d.u16()?,
        })
    }
}

/// Kernel-side per-flow configuration, the result of policy negotiation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlowConfig {
    /// DTCP parameters; `DtcpConfig::default()` disables DTCP entirely.
    pub dtcp: DtcpConfig,
}

impl FlowConfig {
    pub(crate) fn encode(&self, e: &mut Enc) {
        self.dtcp.encode(e);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        Ok(Self { dtcp: DtcpConfig::decode(d)? })
    }
}

/// Aggregated traffic counters of one IPCP.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IpcpStats {
    /// Transmitted PDUs.
    pub tx_pkt: u64,
    /// Transmitted bytes.
    pub tx_byte: u64,
    /// Transmit errors (no route, zombie, lower failure).
    pub tx_err: u64,
    /// Received PDUs.
    pub rx_pkt: u64,
    /// Received bytes.
    pub rx_byte: u64,
    /// Receive errors (no flow, malformed PCI).
    pub rx_err: u64,
}

impl IpcpStats {
    pub(crate) fn encode(&self, e: &mut Enc) {
        e.u64(self.tx_pkt);
        e.u64(self.tx_byte);
        e.u64(self.tx_err);
        e.u64(self.rx_pkt);
        e.u64(self.rx_byte);
        e.u64(self.rx_err);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        Ok(Self {
            tx_pkt: d.u64()?,
            tx_byte: d.u64()?,
            tx_err: d.u64()?,
            rx_pkt: d.u64()?,
            rx_byte: d.u64()?,
            rx_err: d.u64()?,
        })
    }
}

/// Per-flow traffic counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowStats {
    /// SDUs written by the local user.
    pub tx_pkt: u64,
    /// Bytes written by the local user.
    pub tx_byte: u64,
    /// SDUs delivered to the local user.
    pub rx_pkt: u64,
    /// Bytes delivered to the local user.
    pub rx_byte: u64,
}

impl FlowStats {
    pub(crate) fn encode(&self, e: &mut Enc) {
        e.u64(self.tx_pkt);
        e.u64(self.tx_byte);
        e.u64(self.rx_pkt);
        e.u64(self.rx_byte);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        Ok(Self {
            tx_pkt: d.u64()?,
            tx_byte: d.u64()?,
            rx_pkt: d.u64()?,
            rx_byte: d.u64()?,
        })
    }
}

/// Snapshot of the DTP state machine of one flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DtpState {
    /// Sender left window edge.
    pub snd_lwe: u64,
    /// Sender right window edge.
    pub snd_rwe: u64,
    /// Next sequence number to be consumed by a transfer PDU.
    pub next_seq_num_to_send: u64,
    /// Sequence number of the last transfer PDU handed to the lower flow.
    pub last_seq_num_sent: u64,
    /// Last control sequence number received.
    pub last_ctrl_seq_num_rcvd: u64,
    /// Next control sequence number to send.
    pub next_snd_ctl_seq: u64,
    /// Receiver left window edge.
    pub rcv_lwe: u64,
    /// Receiver right window edge.
    pub rcv_rwe: u64,
    /// Largest sequence number received.
    pub max_seq_num_rcvd: u64,
    /// Closed window queue occupancy.
    pub cwq_len: u32,
    /// Closed window queue bound.
    pub max_cwq_len: u32,
    /// Retransmission queue occupancy.
    pub rtxq_len: u32,
    /// Retransmission queue bound.
    pub max_rtxq_len: u32,
    /// Smoothed round trip estimate, microseconds.
    pub rtt_us: u64,
    /// Round trip deviation estimate, microseconds.
    pub rtt_stddev_us: u64,
}

impl DtpState {
    pub(crate) fn encode(&self, e: &mut Enc) {
        e.u64(self.snd_lwe);
        e.u64(self.snd_rwe);
        e.u64(self.next_seq_num_to_send);
        e.u64(self.last_seq_num_sent);
        e.u64(self.last_ctrl_seq_num_rcvd);
        e.u64(self.next_snd_ctl_seq);
        e.u64(self.rcv_lwe);
        e.u64(self.rcv_rwe);
        e.u64(self.max_seq_num_rcvd);
        e.u32(self.cwq_len);
        e.u32(self.max_cwq_len);
        e.u32(self.rtxq_len);
        e.u32(self.max_rtxq_len);
        e.u64(self.rtt_us);
        e.u64(self.rtt_stddev_us);
    }

    pub(crate) fn decode(d: &mut Dec) -> Result<Self> {
        Ok(Self {
            snd_lwe: d.u64()?,
            snd_rwe: d.u64()?,
            next_seq_num_to_send: d.u64()?,
            last_seq_num_sent: d.u64()?,
            last_ctrl_seq_num_rcvd: d.u64()?,
            next_snd_ctl_seq: d.u64()?,
            rcv_lwe: d.u64()?,
            rcv_rwe: d.u64()?,
            max_seq_num_rcvd: d.u64()?,
            cwq_len: d.u32()?,
            max_cwq_len: d.u32()?,
            rtxq_len: d.u32()?,
            max_rtxq_len: d.u32()?,
            rtt_us: d.u64()?,
            rtt_stddev_us: d.u64()?,
        })
    }
}
