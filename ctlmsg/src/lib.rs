//! # Control device message schema
//! Every exchange between user space and the stack core happens through
//! length-delimited serialized messages written to and read from a control
//! device. One message per write; responses and asynchronous events are
//! queued per device and read back one message per read.
//!
//! A message is a fixed header followed by a body whose shape is determined
//! by the message type:
//!
//! ```text
//! 0       8       16      24      32      56
//! +-------+-------+-------+-------+-------+----
//! | ver   | msg_type      | event_id      | body ...
//! +-------+-------+-------+-------+-------+----
//! ```
//!
//! Scalars are big endian, strings carry a u16 length prefix. The numbered
//! type table is the wire contract; the numbers never change meaning.
mod types;
mod wire;

pub use crate::types::{DtcpConfig, DtpState, FcType, FlowConfig, FlowSpec, FlowStats, IpcpStats};

use crate::wire::{Dec, Enc};
use bytes::BytesMut;
use std::io::{Error, ErrorKind, Result};

/// Wire format version.
pub const VERSION: u8 = 1;
/// Length of the fixed message header.
pub const HDR_LEN: usize = 7;

/// "Any IPCP" / "no IPCP" id.
pub const IPCP_ID_NONE: u16 = 0xffff;
/// "Not valid" port id.
pub const PORT_ID_NONE: u16 = 0xffff;
/// "Not valid" CEP id.
pub const CEP_ID_NONE: u16 = 0xffff;
/// "Not valid" address.
pub const ADDR_NULL: u64 = 0;

/// Positive response code.
pub const RESP_SUCC: u8 = 0;
/// Negative response code.
pub const RESP_ERR: u8 = 1;

/// Kind of an `IpcpUpdate` broadcast.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpdateKind {
    /// A new IPCP appeared (also replayed on subscription).
    Add = 1,
    /// An IPCP attribute changed.
    Upd = 2,
    /// An IPCP is being destroyed, its uipcp should detach.
    UipcpDel = 3,
    /// An IPCP is gone.
    Del = 4,
}

impl UpdateKind {
    fn decode(v: u8) -> Result<Self> {
        Ok(match v {
            1 => UpdateKind::Add,
            2 => UpdateKind::Upd,
            3 => UpdateKind::UipcpDel,
            4 => UpdateKind::Del,
            _ => return Err(Error::new(ErrorKind::InvalidData, "bad update kind")),
        })
    }
}

/// A control message: the event id from the header plus the typed body.
#[derive(Clone, Debug, PartialEq)]
pub struct Msg {
    /// Request/response correlation id, chosen by the requester.
    pub event_id: u32,
    /// Typed body.
    pub body: Body,
}

impl Msg {
    /// Builds a message with event id zero (events, notifications).
    pub fn event(body: Body) -> Self {
        Self { event_id: 0, body }
    }

    /// Builds a request/response with the given correlation id.
    pub fn new(event_id: u32, body: Body) -> Self {
        Self { event_id, body }
    }
}

/// Message bodies, one variant per entry of the numbered type table.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// 1: create an IPCP.
    IpcpCreate {
        /// IPCP name, unique per namespace.
        name: String,
        /// DIF type, selects the factory.
        dif_type: String,
        /// DIF joined by the new IPCP, created on first use.
        dif_name: String,
    },
    /// 2: answer to `IpcpCreate`.
    IpcpCreateResp {
        /// Id assigned to the new IPCP.
        ipcp_id: u16,
    },
    /// 3: destroy an IPCP.
    IpcpDestroy {
        /// Id of the IPCP to tear down.
        ipcp_id: u16,
    },
    /// 4: start or continue a paginated flow enumeration.
    FlowFetch {
        /// Restrict to one IPCP, `IPCP_ID_NONE` for all.
        ipcp_id: u16,
    },
    /// 5: one entry of a flow enumeration.
    FlowFetchResp {
        /// Set on the terminating entry, which carries no flow.
        end: bool,
        /// IPCP supporting the flow.
        ipcp_id: u16,
        /// Local port id.
        local_port: u16,
        /// Remote port id.
        remote_port: u16,
        /// Local address.
        local_addr: u64,
        /// Remote address.
        remote_addr: u64,
        /// Flow specification.
        spec: FlowSpec,
        /// Flow control configured on this flow.
        flow_control: bool,
    },
    /// 6: set one configuration parameter of an IPCP.
    IpcpConfig {
        /// Target IPCP.
        ipcp_id: u16,
        /// Parameter name.
        name: String,
        /// Parameter value, textual.
        value: String,
    },
    /// 7: install a PDUFT entry.
    IpcpPduftSet {
        /// IPCP owning the forwarding table.
        ipcp_id: u16,
        /// Destination address to match.
        dst_addr: u64,
        /// Local port of the N-1 flow to forward on.
        local_port: u16,
    },
    /// 8: remove the PDUFT entry for an address.
    IpcpPduftDel {
        /// IPCP owning the forwarding table.
        ipcp_id: u16,
        /// Destination address to remove.
        dst_addr: u64,
    },
    /// 9: clear the whole PDUFT.
    IpcpPduftFlush {
        /// IPCP owning the forwarding table.
        ipcp_id: u16,
    },
    /// 10: register or unregister an application name.
    ApplRegister {
        /// DIF to register in, empty string selects any DIF.
        dif_name: String,
        /// True to register, false to unregister.
        reg: bool,
        /// Application name.
        appl_name: String,
    },
    /// 11: answer to `ApplRegister`, possibly issued by the uipcp.
    ApplRegisterResp {
        /// IPCP the name was registered to.
        ipcp_id: u16,
        /// Mirror of the request direction.
        reg: bool,
        /// `RESP_SUCC` or `RESP_ERR`.
        response: u8,
        /// Application name.
        appl_name: String,
    },
    /// 12: flow allocation request, application to kernel; also the shape
    /// reflected to the uipcp with the kernel-filled fields set.
    FaReq {
        /// DIF to allocate in, empty string selects any DIF.
        dif_name: String,
        /// Upper IPCP to bind, `IPCP_ID_NONE` for an application flow.
        upper_ipcp_id: u16,
        /// Requesting application name.
        local_appl: String,
        /// Peer application name.
        remote_appl: String,
        /// QoS asked for.
        flowspec: FlowSpec,
        /// Filled by the kernel on reflection: allocated port.
        local_port: u16,
        /// Filled by the kernel on reflection: allocated CEP.
        local_cep: u16,
        /// Filled by the kernel on reflection: flow uid.
        uid: u32,
    },
    /// 13: flow allocation response, application to kernel; also the shape
    /// reflected to the uipcp.
    FaResp {
        /// Correlation id of the kernel-generated request event.
        kevent_id: u32,
        /// IPCP supporting the flow.
        ipcp_id: u16,
        /// Upper IPCP to bind, `IPCP_ID_NONE` for an application flow.
        upper_ipcp_id: u16,
        /// Port id of the flow being answered.
        port_id: u16,
        /// Zero accepts the flow.
        response: u8,
        /// Filled by the kernel on reflection: local CEP.
        cep_id: u16,
    },
    /// 14: flow allocation request arrived, kernel to application.
    FaReqArrived {
        /// Kernel event id to quote back in `FaResp`.
        kevent_id: u32,
        /// IPCP supporting the flow.
        ipcp_id: u16,
        /// Allocated local port id.
        port_id: u16,
        /// Destination application.
        local_appl: String,
        /// Requesting application.
        remote_appl: String,
        /// DIF the flow lives in.
        dif_name: String,
        /// QoS asked by the initiator.
        flowspec: FlowSpec,
    },
    /// 15: flow allocation response arrived, kernel to initiator.
    FaRespArrived {
        /// Port id of the requested flow.
        port_id: u16,
        /// Zero means the flow is allocated.
        response: u8,
    },
    /// 16: attach the issuing control device to an IPCP as its uipcp.
    IpcpUipcpSet {
        /// Target IPCP.
        ipcp_id: u16,
    },
    /// 17: block until a uipcp attaches to the IPCP.
    IpcpUipcpWait {
        /// Target IPCP.
        ipcp_id: u16,
    },
    /// 18: uipcp-driven `fa_req_arrived` injection.
    UipcpFaReqArrived {
        /// Uipcp-generated event id, becomes the flow uid.
        kevent_id: u32,
        /// IPCP the request arrived to.
        ipcp_id: u16,
        /// Remote port id.
        remote_port: u16,
        /// Remote CEP id.
        remote_cep: u16,
        /// QoS id.
        qos_id: u8,
        /// Remote address.
        remote_addr: u64,
        /// Destination application.
        local_appl: String,
        /// Requesting application.
        remote_appl: String,
        /// Negotiated flow configuration.
        flowcfg: FlowConfig,
        /// QoS asked by the initiator.
        flowspec: FlowSpec,
    },
    /// 19: uipcp-driven `fa_resp_arrived` injection.
    UipcpFaRespArrived {
        /// IPCP the response arrived to.
        ipcp_id: u16,
        /// Local port of the initiator flow.
        local_port: u16,
        /// Remote port id.
        remote_port: u16,
        /// Remote CEP id.
        remote_cep: u16,
        /// QoS id.
        qos_id: u8,
        /// Remote address.
        remote_addr: u64,
        /// Zero accepts the flow.
        response: u8,
        /// Negotiated flow configuration.
        flowcfg: FlowConfig,
    },
    /// 20: deallocate a flow.
    FlowDealloc {
        /// IPCP supporting the flow.
        ipcp_id: u16,
        /// Port id of the flow.
        port_id: u16,
        /// Flow uid, guards against port id reuse.
        uid: u32,
    },
    /// 21: flow gone, kernel to uipcp.
    FlowDeallocated {
        /// IPCP that supported the flow.
        ipcp_id: u16,
        /// Local port id of the dead flow.
        local_port_id: u16,
        /// Remote port id of the dead flow.
        remote_port_id: u16,
        /// Remote address of the dead flow.
        remote_addr: u64,
    },
    /// 22: ask for flow statistics.
    FlowStatsReq {
        /// Port id of the flow.
        port_id: u16,
    },
    /// 23: flow statistics snapshot.
    FlowStatsResp {
        /// Traffic counters.
        stats: FlowStats,
        /// DTP state machine snapshot.
        dtp: DtpState,
    },
    /// 24: update the configuration of a live flow.
    FlowCfgUpdate {
        /// Port id of the flow.
        port_id: u16,
        /// New configuration.
        flowcfg: FlowConfig,
    },
    /// 25: can this IPCP satisfy the given flow spec?
    IpcpQosSupported {
        /// Target IPCP.
        ipcp_id: u16,
        /// QoS in question.
        flowspec: FlowSpec,
    },
    /// 26: re-home the issuer's registrations on an IPCP to another device.
    ApplMove {
        /// Target IPCP.
        ipcp_id: u16,
        /// Per-namespace id of the destination control device.
        fd: u32,
    },
    /// 27: start or continue a paginated registration enumeration.
    RegFetch {
        /// Restrict to one IPCP, `IPCP_ID_NONE` for all.
        ipcp_id: u16,
    },
    /// 28: one entry of a registration enumeration.
    RegFetchResp {
        /// Set on the terminating entry.
        end: bool,
        /// IPCP the name is registered to.
        ipcp_id: u16,
        /// Registration still waiting for uipcp confirmation.
        pending: bool,
        /// Application name.
        appl_name: String,
    },
    /// 29: IPCP state broadcast to subscribed devices.
    IpcpUpdate {
        /// What happened.
        kind: UpdateKind,
        /// Subject IPCP.
        ipcp_id: u16,
        /// IPCP address.
        ipcp_addr: u64,
        /// Transmit header room hint.
        txhdroom: u16,
        /// Receive header room hint.
        rxhdroom: u16,
        /// Tail room hint.
        tailroom: u16,
        /// Maximum SDU size.
        max_sdu_size: u32,
        /// IPCP name, empty on `Del`.
        ipcp_name: String,
        /// DIF name, empty on `Del`.
        dif_name: String,
        /// DIF type, empty on `Del`.
        dif_type: String,
    },
    /// 30: ask for IPCP statistics.
    IpcpStatsReq {
        /// Target IPCP.
        ipcp_id: u16,
    },
    /// 31: IPCP statistics snapshot.
    IpcpStatsResp {
        /// Aggregated counters.
        stats: IpcpStats,
    },
    /// 32: read one configuration parameter of an IPCP.
    IpcpConfigGetReq {
        /// Target IPCP.
        ipcp_id: u16,
        /// Parameter name.
        param_name: String,
    },
    /// 33: answer to `IpcpConfigGetReq`.
    IpcpConfigGetResp {
        /// Parameter value, textual.
        param_value: String,
    },
    /// 34: configure a weighted round robin scheduler.
    IpcpSchedWrr {
        /// Target IPCP.
        ipcp_id: u16,
        /// Per-class weights.
        weights: Vec<u16>,
        /// Scheduling quantum, bytes.
        quantum: u32,
        /// Per-queue bound, PDUs.
        max_queue_size: u32,
    },
    /// 35: configure a priority FIFO scheduler.
    IpcpSchedPfifo {
        /// Target IPCP.
        ipcp_id: u16,
        /// Number of priority levels.
        prio_levels: u16,
        /// Per-queue bound, PDUs.
        max_queue_size: u32,
    },
}

impl Body {
    /// Numeric message type of this body.
    pub fn msg_type(&self) -> u16 {
        match self {
            Body::IpcpCreate { .. } => 1,
            Body::IpcpCreateResp { .. } => 2,
            Body::IpcpDestroy { .. } => 3,
            Body::FlowFetch { .. } => 4,
            Body::FlowFetchResp { .. } => 5,
            Body::IpcpConfig { .. } => 6,
            Body::IpcpPduftSet { .. } => 7,
            Body::IpcpPduftDel { .. } => 8,
            Body::IpcpPduftFlush { .. } => 9,
            Body::ApplRegister { .. } => 10,
            Body::ApplRegisterResp { .. } => 11,
            Body::FaReq { .. } => 12,
            Body::FaResp { .. } => 13,
            Body::FaReqArrived { .. } => 14,
            Body::FaRespArrived { .. } => 15,
            Body::IpcpUipcpSet { .. } => 16,
            Body::IpcpUipcpWait { .. } => 17,
            Body::UipcpFaReqArrived { .. } => 18,
            Body::UipcpFaRespArrived { .. } => 19,
            Body::FlowDealloc { .. } => 20,
            Body::FlowDeallocated { .. } => 21,
            Body::FlowStatsReq { .. } => 22,
            Body::FlowStatsResp { .. } => 23,
            Body::FlowCfgUpdate { .. } => 24,
            Body::IpcpQosSupported { .. } => 25,
            Body::ApplMove { .. } => 26,
            Body::RegFetch { .. } => 27,
            Body::RegFetchResp { .. } => 28,
            Body::IpcpUpdate { .. } => 29,
            Body::IpcpStatsReq { .. } => 30,
            Body::IpcpStatsResp { .. } => 31,
            Body::IpcpConfigGetReq { .. } => 32,
            Body::IpcpConfigGetResp { .. } => 33,
            Body::IpcpSchedWrr { .. } => 34,
            Body::IpcpSchedPfifo { .. } => 35,
        }
    }
}

/// Serializes a message, header included.
pub fn serialize(msg: &Msg) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    let mut e = Enc(&mut buf);
    e.u8(VERSION);
    e.u16(msg.body.msg_type());
    e.u32(msg.event_id);
    match &msg.body {
        Body::IpcpCreate { name, dif_type, dif_name } => {
            e.string(name);
            e.string(dif_type);
            e.string(dif_name);
        }
        Body::IpcpCreateResp { ipcp_id } => e.u16(*ipcp_id),
        Body::IpcpDestroy { ipcp_id } => e.u16(*ipcp_id),
        Body::FlowFetch { ipcp_id } => e.u16(*ipcp_id),
        Body::FlowFetchResp {
            end,
            ipcp_id,
            local_port,
            remote_port,
            local_addr,
            remote_addr,
            spec,
            flow_control,
        } => {
            e.flag(*end);
            e.u16(*ipcp_id);
            e.u16(*local_port);
            e.u16(*remote_port);
            e.u64(*local_addr);
            e.u64(*remote_addr);
            spec.encode(&mut e);
            e.flag(*flow_control);
        }
        Body::IpcpConfig { ipcp_id, name, value } => {
            e.u16(*ipcp_id);
            e.string(name);
            e.string(value);
        }
        Body::IpcpPduftSet { ipcp_id, dst_addr, local_port } => {
            e.u16(*ipcp_id);
            e.u64(*dst_addr);
            e.u16(*local_port);
        }
        Body::IpcpPduftDel { ipcp_id, dst_addr } => {
            e.u16(*ipcp_id);
            e.u64(*dst_addr);
        }
        Body::IpcpPduftFlush { ipcp_id } => e.u16(*ipcp_id),
        Body::ApplRegister { dif_name, reg, appl_name } => {
            e.string(dif_name);
            e.flag(*reg);
            e.string(appl_name);
        }
        Body::ApplRegisterResp { ipcp_id, reg, response, appl_name } => {
            e.u16(*ipcp_id);
            e.flag(*reg);
            e.u8(*response);
            e.string(appl_name);
        }
        Body::FaReq {
            dif_name,
            upper_ipcp_id,
            local_appl,
            remote_appl,
            flowspec,
            local_port,
            local_cep,
            uid,
        } => {
            e.string(dif_name);
            e.u16(*upper_ipcp_id);
            e.string(local_appl);
            e.string(remote_appl);
            flowspec.encode(&mut e);
            e.u16(*local_port);
            e.u16(*local_cep);
            e.u32(*uid);
        }
        Body::FaResp { kevent_id, ipcp_id, upper_ipcp_id, port_id, response, cep_id } => {
            e.u32(*kevent_id);
            e.u16(*ipcp_id);
            e.u16(*upper_ipcp_id);
            e.u16(*port_id);
            e.u8(*response);
            e.u16(*cep_id);
        }
        Body::FaReqArrived {
            kevent_id,
            ipcp_id,
            port_id,
            local_appl,
            remote_appl,
            dif_name,
            flowspec,
        } => {
            e.u32(*kevent_id);
            e.u16(*ipcp_id);
            e.u16(*port_id);
            e.string(local_appl);
            e.string(remote_appl);
            e.string(dif_name);
            flowspec.encode(&mut e);
        }
        Body::FaRespArrived { port_id, response } => {
            e.u16(*port_id);
            e.u8(*response);
        }
        Body::IpcpUipcpSet { ipcp_id } => e.u16(*ipcp_id),
        Body::IpcpUipcpWait { ipcp_id } => e.u16(*ipcp_id),
        Body::UipcpFaReqArrived {
            kevent_id,
            ipcp_id,
            remote_port,
            remote_cep,
            qos_id,
            remote_addr,
            local_appl,
            remote_appl,
            flowcfg,
            flowspec,
        } => {
            e.u32(*kevent_id);
            e.u16(*ipcp_id);
            e.u16(*remote_port);
            e.u16(*remote_cep);
            e.u8(*qos_id);
            e.u64(*remote_addr);
            e.string(local_appl);
            e.string(remote_appl);
            flowcfg.encode(&mut e);
            flowspec.encode(&mut e);
        }
        Body::UipcpFaRespArrived {
            ipcp_id,
            local_port,
            remote_port,
            remote_cep,
            qos_id,
            remote_addr,
            response,
            flowcfg,
        } => {
            e.u16(*ipcp_id);
            e.u16(*local_port);
            e.u16(*remote_port);
            e.u16(*remote_cep);
            e.u8(*qos_id);
            e.u64(*remote_addr);
            e.u8(*response);
            flowcfg.encode(&mut e);
        }
        Body::FlowDealloc { ipcp_id, port_id, uid } => {
            e.u16(*ipcp_id);
            e.u16(*port_id);
            e.u32(*uid);
        }
        Body::FlowDeallocated { ipcp_id, local_port_id, remote_port_id, remote_addr } => {
            e.u16(*ipcp_id);
            e.u16(*local_port_id);
            e.u16(*remote_port_id);
            e.u64(*remote_addr);
        }
        Body::FlowStatsReq { port_id } => e.u16(*port_id),
        Body::FlowStatsResp { stats, dtp } => {
            stats.encode(&mut e);
            dtp.encode(&mut e);
        }
        Body::FlowCfgUpdate { port_id, flowcfg } => {
            e.u16(*port_id);
            flowcfg.encode(&mut e);
        }
        Body::IpcpQosSupported { ipcp_id, flowspec } => {
            e.u16(*ipcp_id);
            flowspec.encode(&mut e);
        }
        Body::ApplMove { ipcp_id, fd } => {
            e.u16(*ipcp_id);
            e.u32(*fd);
        }
        Body::RegFetch { ipcp_id } => e.u16(*ipcp_id),
        Body::RegFetchResp { end, ipcp_id, pending, appl_name } => {
            e.flag(*end);
            e.u16(*ipcp_id);
            e.flag(*pending);
            e.string(appl_name);
        }
        Body::IpcpUpdate {
            kind,
            ipcp_id,
            ipcp_addr,
            txhdroom,
            rxhdroom,
            tailroom,
            max_sdu_size,
            ipcp_name,
            dif_name,
            dif_type,
        } => {
            e.u8(*kind as u8);
            e.u16(*ipcp_id);
            e.u64(*ipcp_addr);
            e.u16(*txhdroom);
            e.u16(*rxhdroom);
            e.u16(*tailroom);
            e.u32(*max_sdu_size);
            e.string(ipcp_name);
            e.string(dif_name);
            e.string(dif_type);
        }
        Body::IpcpStatsReq { ipcp_id } => e.u16(*ipcp_id),
        Body::IpcpStatsResp { stats } => stats.encode(&mut e),
        Body::IpcpConfigGetReq { ipcp_id, param_name } => {
            e.u16(*ipcp_id);
            e.string(param_name);
        }
        Body::IpcpConfigGetResp { param_value } => e.string(param_value),
        Body::IpcpSchedWrr { ipcp_id, weights, quantum, max_queue_size } => {
            e.u16(*ipcp_id);
            e.u16(weights.len() as u16);
            for w in weights {
                e.u16(*w);
            }
            e.u32(*quantum);
            e.u32(*max_queue_size);
        }
        Body::IpcpSchedPfifo { ipcp_id, prio_levels, max_queue_size } => {
            e.u16(*ipcp_id);
            e.u16(*prio_levels);
            e.u32(*max_queue_size);
        }
    }
    buf
}

/// Parses one serialized message, header included. The whole buffer must
/// be consumed.
pub fn parse(buf: &[u8]) -> Result<Msg> {
    let mut d = Dec::new(buf);
    if d.u8()? != VERSION {
        return Err(Error::new(ErrorKind::InvalidData, "bad version"));
    }
    let msg_type = d.u16()?;
    let event_id = d.u32()?;
    let body = match msg_type {
        1 => Body::IpcpCreate {
            name: d.string()?,
            dif_type: d.string()?,
            dif_name: d.string()?,
        },
        2 => Body::IpcpCreateResp { ipcp_id: d.u16()? },
        3 => Body::IpcpDestroy { ipcp_id: d.u16()? },
        4 => Body::FlowFetch { ipcp_id: d.u16()? },
        5 => Body::FlowFetchResp {
            end: d.flag()?,
            ipcp_id: d.u16()?,
            local_port: d.u16()?,
            remote_port: d.u16()?,
            local_addr: d.u64()?,
            remote_addr: d.u64()?,
            spec: FlowSpec::decode(&mut d)?,
            flow_control: d.flag()?,
        },
        6 => Body::IpcpConfig {
            ipcp_id: d.u16()?,
            name: d.string()?,
            value: d.string()?,
        },
        7 => Body::IpcpPduftSet {
            ipcp_id: d.u16()?,
            dst_addr: d.u64()?,
            local_port: d.u16()?,
        },
        8 => Body::IpcpPduftDel { ipcp_id: d.u16()?, dst_addr: d.u64()? },
        9 => Body::IpcpPduftFlush { ipcp_id: d.u16()? },
        10 => Body::ApplRegister {
            dif_name: d.string()?,
            reg: d.flag()?,
            appl_name: d.string()?,
        },
        11 => Body::ApplRegisterResp {
            ipcp_id: d.u16()?,
            reg: d.flag()?,
            response: d.u8()?,
            appl_name: d.string()?,
        },
        12 => Body::FaReq {
            dif_name: d.string()?,
            upper_ipcp_id: d.u16()?,
            local_appl: d.string()?,
            remote_appl: d.string()?,
            flowspec: FlowSpec::decode(&mut d)?,
            local_port: d.u16()?,
            local_cep: d.u16()?,
            uid: d.u32()?,
        },
        13 => Body::FaResp {
            kevent_id: d.u32()?,
            ipcp_id: d.u16()?,
            upper_ipcp_id: d.u16()?,
            port_id: d.u16()?,
            response: d.u8()?,
            cep_id: d.u16()?,
        },
        14 => Body::FaReqArrived {
            kevent_id: d.u32()?,
            ipcp_id: d.u16()?,
            port_id: d.u16()?,
            local_appl: d.string()?,
            remote_appl: d.string()?,
            dif_name: d.string()?,
            flowspec: FlowSpec::decode(&mut d)?,
        },
        15 => Body::FaRespArrived { port_id: d.u16()?, response: d.u8()? },
        16 => Body::IpcpUipcpSet { ipcp_id: d.u16()? },
        17 => Body::IpcpUipcpWait { ipcp_id: d.u16()? },
        18 => Body::UipcpFaReqArrived {
            kevent_id: d.u32()?,
            ipcp_id: d.u16()?,
            remote_port: d.u16()?,
            remote_cep: d.u16()?,
            qos_id: d.u8()?,
            remote_addr: d.u64()?,
            local_appl: d.string()?,
            remote_appl: d.string()?,
            flowcfg: FlowConfig::decode(&mut d)?,
            flowspec: FlowSpec::decode(&mut d)?,
        },
        19 => Body::UipcpFaRespArrived {
            ipcp_id: d.u16()?,
            local_port: d.u16()?,
            remote_port: d.u16()?,
            remote_cep: d.u16()?,
            qos_id: d.u8()?,
            remote_addr: d.u64()?,
            response: d.u8()?,
            flowcfg: FlowConfig::decode(&mut d)?,
        },
        20 => Body::FlowDealloc {
            ipcp_id: d.u16()?,
            port_id: d.u16()?,
            uid: d.u32()?,
        },
        21 => Body::FlowDeallocated {
            ipcp_id: d.u16()?,
            local_port_id: d.u16()?,
            remote_port_id: d.u16()?,
            remote_addr: d.u64()?,
        },
        22 => Body::FlowStatsReq { port_id: d.u16()? },
        23 => Body::FlowStatsResp {
            stats: FlowStats::decode(&mut d)?,
            dtp: DtpState::decode(&mut d)?,
        },
        24 => Body::FlowCfgUpdate {
            port_id: d.u16()?,
            flowcfg: FlowConfig::decode(&mut d)?,
        },
        25 => Body::IpcpQosSupported {
            ipcp_id: d.u16()?,
            flowspec: FlowSpec::decode(&mut d)?,
        },
        26 => Body::ApplMove { ipcp_id: d.u16()?, fd: d.u32()? },
        27 => Body::RegFetch { ipcp_id: d.u16()? },
        28 => Body::RegFetchResp {
            end: d.flag()?,
            ipcp_id: d.u16()?,
            pending: d.flag()?,
            appl_name: d.string()?,
        },
        29 => Body::IpcpUpdate {
            kind: UpdateKind::decode(d.u8()?)?,
            ipcp_id: d.u16()?,
            ipcp_addr: d.u64()?,
            txhdroom: d.u16()?,
            rxhdroom: d.u16()?,
            tailroom: d.u16()?,
            max_sdu_size: d.u32()?,
            ipcp_name: d.string()?,
            dif_name: d.string()?,
            dif_type: d.string()?,
        },
        30 => Body::IpcpStatsReq { ipcp_id: d.u16()? },
        31 => Body::IpcpStatsResp { stats: IpcpStats::decode(&mut d)? },
        32 => Body::IpcpConfigGetReq {
            ipcp_id: d.u16()?,
            param_name: d.string()?,
        },
        33 => Body::IpcpConfigGetResp { param_value: d.string()? },
        34 => {
            let ipcp_id = d.u16()?;
            let n = d.u16()? as usize;
            let mut weights = Vec::with_capacity(n);
            for _ in 0..n {
                weights.push(d.u16()?);
            }
            Body::IpcpSchedWrr {
                ipcp_id,
                weights,
                quantum: d.u32()?,
                max_queue_size: d.u32()?,
            }
        }
        35 => Body::IpcpSchedPfifo {
            ipcp_id: d.u16()?,
            prio_levels: d.u16()?,
            max_queue_size: d.u32()?,
        },
        _ => return Err(Error::new(ErrorKind::InvalidData, "unknown message type")),
    };
    d.finish()?;
    Ok(Msg { event_id, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(msg: Msg) {
        let ser = serialize(&msg);
        let parsed = parse(&ser).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(serialize(&parsed), ser);
    }

    #[test]
    fn test_roundtrip_ipcp_family() {
        rt(Msg::new(7, Body::IpcpCreate {
            name: "nx".into(),
            dif_type: "normal".into(),
            dif_name: "d1".into(),
        }));
        rt(Msg::new(7, Body::IpcpCreateResp { ipcp_id: 0 }));
        rt(Msg::new(8, Body::IpcpDestroy { ipcp_id: 3 }));
        rt(Msg::new(9, Body::IpcpConfig {
            ipcp_id: 1,
            name: "mss".into(),
            value: "1400".into(),
        }));
        rt(Msg::new(10, Body::IpcpConfigGetReq {
            ipcp_id: 1,
            param_name: "address".into(),
        }));
        rt(Msg::new(10, Body::IpcpConfigGetResp { param_value: "42".into() }));
        rt(Msg::new(11, Body::IpcpUipcpSet { ipcp_id: 2 }));
        rt(Msg::new(12, Body::IpcpUipcpWait { ipcp_id: 2 }));
        rt(Msg::new(13, Body::IpcpStatsReq { ipcp_id: 2 }));
        rt(Msg::event(Body::IpcpStatsResp {
            stats: IpcpStats { tx_pkt: 1, tx_byte: 2, tx_err: 3, rx_pkt: 4, rx_byte: 5, rx_err: 6 },
        }));
        rt(Msg::event(Body::IpcpUpdate {
            kind: UpdateKind::Add,
            ipcp_id: 0,
            ipcp_addr: 42,
            txhdroom: 32,
            rxhdroom: 0,
            tailroom: 4,
            max_sdu_size: 65535,
            ipcp_name: "nx".into(),
            dif_name: "d1".into(),
            dif_type: "normal".into(),
        }));
        rt(Msg::new(14, Body::IpcpQosSupported {
            ipcp_id: 1,
            flowspec: FlowSpec::best_effort(),
        }));
        rt(Msg::new(15, Body::IpcpSchedWrr {
            ipcp_id: 1,
            weights: vec![1, 2, 4],
            quantum: 1500,
            max_queue_size: 128,
        }));
        rt(Msg::new(16, Body::IpcpSchedPfifo {
            ipcp_id: 1,
            prio_levels: 3,
            max_queue_size: 128,
        }));
    }

    #[test]
    fn test_roundtrip_appl_family() {
        rt(Msg::new(1, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: true,
            appl_name: "alice".into(),
        }));
        rt(Msg::new(1, Body::ApplRegisterResp {
            ipcp_id: 0,
            reg: true,
            response: RESP_SUCC,
            appl_name: "alice".into(),
        }));
        rt(Msg::new(2, Body::ApplMove { ipcp_id: 0, fd: 3 }));
        rt(Msg::new(3, Body::RegFetch { ipcp_id: IPCP_ID_NONE }));
        rt(Msg::new(3, Body::RegFetchResp {
            end: false,
            ipcp_id: 0,
            pending: false,
            appl_name: "alice".into(),
        }));
    }

    #[test]
    fn test_roundtrip_flow_family() {
        rt(Msg::new(21, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "bob".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        }));
        rt(Msg::new(22, Body::FaResp {
            kevent_id: 77,
            ipcp_id: 0,
            upper_ipcp_id: IPCP_ID_NONE,
            port_id: 5,
            response: RESP_SUCC,
            cep_id: 0,
        }));
        rt(Msg::event(Body::FaReqArrived {
            kevent_id: 77,
            ipcp_id: 0,
            port_id: 5,
            local_appl: "bob".into(),
            remote_appl: "alice".into(),
            dif_name: "d1".into(),
            flowspec: FlowSpec::best_effort(),
        }));
        rt(Msg::new(21, Body::FaRespArrived { port_id: 5, response: RESP_SUCC }));
        rt(Msg::event(Body::UipcpFaReqArrived {
            kevent_id: 9,
            ipcp_id: 0,
            remote_port: 6,
            remote_cep: 6,
            qos_id: 0,
            remote_addr: 42,
            local_appl: "bob".into(),
            remote_appl: "alice".into(),
            flowcfg: FlowConfig { dtcp: DtcpConfig::window(64, 16) },
            flowspec: FlowSpec::best_effort(),
        }));
        rt(Msg::event(Body::UipcpFaRespArrived {
            ipcp_id: 0,
            local_port: 5,
            remote_port: 6,
            remote_cep: 6,
            qos_id: 0,
            remote_addr: 42,
            response: RESP_SUCC,
            flowcfg: FlowConfig::default(),
        }));
        rt(Msg::new(23, Body::FlowDealloc { ipcp_id: 0, port_id: 5, uid: 11 }));
        rt(Msg::event(Body::FlowDeallocated {
            ipcp_id: 0,
            local_port_id: 5,
            remote_port_id: 6,
            remote_addr: 42,
        }));
        rt(Msg::new(24, Body::FlowStatsReq { port_id: 5 }));
        rt(Msg::event(Body::FlowStatsResp {
            stats: FlowStats { tx_pkt: 10, tx_byte: 100, rx_pkt: 9, rx_byte: 90 },
            dtp: DtpState { snd_lwe: 3, snd_rwe: 67, cwq_len: 1, ..Default::default() },
        }));
        rt(Msg::new(25, Body::FlowCfgUpdate {
            port_id: 5,
            flowcfg: FlowConfig { dtcp: DtcpConfig::window(32, 8) },
        }));
        rt(Msg::new(26, Body::FlowFetch { ipcp_id: IPCP_ID_NONE }));
        rt(Msg::new(26, Body::FlowFetchResp {
            end: false,
            ipcp_id: 0,
            local_port: 5,
            remote_port: 6,
            local_addr: 1,
            remote_addr: 42,
            spec: FlowSpec::best_effort(),
            flow_control: true,
        }));
    }

    #[test]
    fn test_roundtrip_pduft_family() {
        rt(Msg::new(31, Body::IpcpPduftSet { ipcp_id: 1, dst_addr: 42, local_port: 7 }));
        rt(Msg::new(32, Body::IpcpPduftDel { ipcp_id: 1, dst_addr: 42 }));
        rt(Msg::new(33, Body::IpcpPduftFlush { ipcp_id: 1 }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(&[]).is_err());
        // Wrong version.
        let mut ser = serialize(&Msg::new(1, Body::FlowFetch { ipcp_id: 0 }));
        ser[0] = 2;
        assert!(parse(&ser).is_err());
        // Unknown type.
        let mut ser = serialize(&Msg::new(1, Body::FlowFetch { ipcp_id: 0 }));
        ser[2] = 0xff;
        assert!(parse(&ser).is_err());
        // Trailing bytes.
        let mut ser = serialize(&Msg::new(1, Body::FlowFetch { ipcp_id: 0 }));
        ser.extend_from_slice(&[0]);
        assert!(parse(&ser).is_err());
        // Truncation at every length.
        let ser = serialize(&Msg::new(1, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: true,
            appl_name: "alice".into(),
        }));
        for cut in 0..ser.len() {
            assert!(parse(&ser[..cut]).is_err());
        }
    }
}
