//! The per-flow data transfer engine: sequencing, windowed flow control
//! with a closed window queue, a retransmission queue pruned by control
//! acks, duplicate and gap handling on receive, and the two inactivity
//! timers.
use crate::NormalIpcp;
use async_std::task;
use bytes::BytesMut;
use ctlmsg::{DtcpConfig, FcType};
use futures_timer::Delay;
use pci::{CtrlPdu, Pdu, PDU_F_DRF, PDU_T_DT, PDU_T_FC, PDU_T_MGMT};
use ripc::{flow_put, sdu_rx_flow, Dtp, Error, FlowEntry, IpcpEntry, MgmtRoute, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Placeholder for MPL + R + A until peers exchange real bounds.
const MPL_R_A: Duration = Duration::from_millis(350);
/// Fallback retransmission queue bound when the config leaves it unset.
const RTXQ_LEN_DFLT: usize = 64;

fn snd_inact_delay() -> Duration {
    // 3 * (MPL + R + A)
    MPL_R_A * 3
}

fn rcv_inact_delay() -> Duration {
    // 2/3 * 2 * (MPL + R + A)
    MPL_R_A * 4 / 3
}

pub(crate) fn flow_init(dtp: &mut Dtp, cfg: &DtcpConfig) {
    dtp.set_drf = true;
    dtp.next_seq_num_to_send = 0;
    dtp.snd_lwe = 0;
    dtp.snd_rwe = 0;
    dtp.last_seq_num_sent = u64::MAX;
    dtp.rcv_lwe = 0;
    dtp.rcv_rwe = 0;
    dtp.max_seq_num_rcvd = u64::MAX;
    dtp.next_snd_ctl_seq = 0;
    dtp.last_ctrl_seq_num_rcvd = 0;

    if cfg.fc_type == FcType::Window {
        dtp.max_cwq_len = cfg.max_cwq_len as usize;
        dtp.snd_rwe += cfg.initial_credit as u64;
        dtp.rcv_rwe += cfg.initial_credit as u64;
    }
    if cfg.rtx_control {
        dtp.max_rtxq_len = if cfg.max_rtxq_len > 0 {
            cfg.max_rtxq_len as usize
        } else {
            RTXQ_LEN_DFLT
        };
    }
}

/// Receive-side classification of a transfer PDU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RxClass {
    /// DRF set: first PDU of a new run, state resynchronized.
    NewRun,
    /// Already delivered, drop.
    Duplicate,
    /// Lands inside a known gap; the left window edge jumps past it.
    GapFill,
    /// The next expected sequence number.
    InOrder,
    /// Beyond the highest seen; both edges jump.
    OutOfOrder,
}

/// Classifies one incoming transfer PDU and advances the receiver state.
/// Everything but duplicates is delivered immediately; a reordering
/// buffer is a policy extension.
pub(crate) fn classify(dtp: &mut Dtp, drf: bool, seqnum: u64) -> RxClass {
    if drf {
        // First PDU or new run: resynchronize.
        dtp.rcv_lwe = seqnum.wrapping_add(1);
        dtp.max_seq_num_rcvd = seqnum;
        return RxClass::NewRun;
    }
    if seqnum < dtp.rcv_lwe {
        return RxClass::Duplicate;
    }
    if dtp.rcv_lwe < seqnum && seqnum <= dtp.max_seq_num_rcvd {
        dtp.rcv_lwe = seqnum.wrapping_add(1);
        return RxClass::GapFill;
    }
    if seqnum == dtp.max_seq_num_rcvd.wrapping_add(1) {
        dtp.rcv_lwe = dtp.rcv_lwe.wrapping_add(1);
        dtp.max_seq_num_rcvd = dtp.max_seq_num_rcvd.wrapping_add(1);
        return RxClass::InOrder;
    }
    dtp.rcv_lwe = seqnum.wrapping_add(1);
    dtp.max_seq_num_rcvd = seqnum;
    RxClass::OutOfOrder
}

/// Sender-side bookkeeping for one freshly built transfer PDU: either it
/// fits the window and must go out (returned), or it parks on the closed
/// window queue, or the queue bound drops it (`None` with `dropped`).
pub(crate) fn tx_register(
    dtp: &mut Dtp,
    window: bool,
    rtx: bool,
    seqnum: u64,
    bytes: BytesMut,
) -> std::result::Result<Option<BytesMut>, ()> {
    if window && seqnum > dtp.snd_rwe {
        // PDU not in the sender window: closed window queue.
        if dtp.cwq.len() < dtp.max_cwq_len {
            dtp.cwq.push_back((seqnum, bytes));
            return Ok(None);
        }
        // POL: FlowControlOverrun.
        return Err(());
    }
    dtp.snd_lwe = dtp.next_seq_num_to_send;
    dtp.last_seq_num_sent = seqnum;
    if rtx {
        rtxq_push(dtp, seqnum, &bytes);
    }
    Ok(Some(bytes))
}

fn rtxq_push(dtp: &mut Dtp, seqnum: u64, bytes: &BytesMut) {
    if dtp.rtxq.len() >= dtp.max_rtxq_len {
        // Oldest unacked PDU gives way; retransmission policy is an
        // extension point, the queue accounting is not.
        dtp.rtxq.pop_front();
    }
    dtp.rtxq.push_back((seqnum, Instant::now(), bytes.clone()));
}

fn rtt_update(dtp: &mut Dtp, sample: Duration) {
    let sample_us = sample.as_micros() as u64;
    if dtp.rtt_us == 0 {
        dtp.rtt_us = sample_us;
        dtp.rtt_stddev_us = sample_us / 2;
        return;
    }
    let err = if sample_us > dtp.rtt_us {
        sample_us - dtp.rtt_us
    } else {
        dtp.rtt_us - sample_us
    };
    dtp.rtt_us = (dtp.rtt_us * 7 + sample_us) / 8;
    dtp.rtt_stddev_us = (dtp.rtt_stddev_us * 3 + err) / 4;
}

/// Window edges carried by one control PDU.
pub(crate) struct FcFields {
    seq: u64,
    last_ctrl_seq_num_rcvd: u64,
    new_rwe: u64,
    new_lwe: u64,
    my_rwe: u64,
    my_lwe: u64,
}

/// Receiver-side state vector update after a delivery. Returns the window
/// advertisement to emit, when receive flow control runs without
/// retransmission control.
pub(crate) fn sv_update(dtp: &mut Dtp, cfg: &DtcpConfig) -> Option<FcFields> {
    if !cfg.flow_control {
        return None;
    }
    // POL: RcvrFlowControl. Credit should follow buffer occupation; one
    // PDU delivered, one credit granted.
    dtp.rcv_rwe = dtp.rcv_rwe.wrapping_add(1);

    if cfg.rtx_control || cfg.fc_type != FcType::Window {
        return None;
    }
    // POL: ReceivingFlowControl, advertise the new edges.
    let seq = dtp.next_snd_ctl_seq;
    dtp.next_snd_ctl_seq += 1;
    Some(FcFields {
        seq,
        last_ctrl_seq_num_rcvd: dtp.last_ctrl_seq_num_rcvd,
        new_rwe: dtp.rcv_rwe,
        new_lwe: dtp.rcv_lwe,
        my_rwe: dtp.snd_rwe,
        my_lwe: dtp.snd_lwe,
    })
}

/// Applies one received control PDU: ack-prunes the retransmission queue,
/// advances the sender edges and releases closed-window PDUs that now fit
/// the window. Returns the released PDUs, oldest first.
pub(crate) fn ctrl_update(
    dtp: &mut Dtp,
    rtx: bool,
    ctrl_seq: u64,
    new_lwe: u64,
    new_rwe: u64,
) -> Vec<BytesMut> {
    dtp.last_ctrl_seq_num_rcvd = ctrl_seq;

    let now = Instant::now();
    loop {
        let sent = match dtp.rtxq.front() {
            Some((sn, sent, _)) if *sn < new_lwe => *sent,
            _ => break,
        };
        rtt_update(dtp, now.duration_since(sent));
        dtp.rtxq.pop_front();
    }

    if new_lwe > dtp.snd_lwe {
        dtp.snd_lwe = new_lwe;
    }
    if new_rwe > dtp.snd_rwe {
        dtp.snd_rwe = new_rwe;
    }

    let mut out = Vec::new();
    loop {
        match dtp.cwq.front() {
            Some((sn, _)) if *sn <= dtp.snd_rwe => {}
            _ => break,
        }
        let (sn, bytes) = dtp.cwq.pop_front().unwrap();
        dtp.last_seq_num_sent = sn;
        if rtx {
            rtxq_push(dtp, sn, &bytes);
        }
        out.push(bytes);
    }
    out
}

fn build_fc(ipcp: &IpcpEntry, flow: &FlowEntry, f: &FcFields) -> BytesMut {
    let mut fc = Pdu::fc();
    fc.pdu_mut().set_dst_addr(flow.remote_addr());
    fc.pdu_mut().set_src_addr(ipcp.addr.load());
    fc.pdu_mut().set_qos_id(flow.qos_id());
    fc.pdu_mut().set_dst_cep(flow.remote_cep());
    fc.pdu_mut().set_src_cep(flow.local_cep);
    fc.pdu_mut().set_seqnum(f.seq);
    fc.set_last_ctrl_seq_num_rcvd(f.last_ctrl_seq_num_rcvd);
    fc.set_new_rwe(f.new_rwe);
    fc.set_new_lwe(f.new_lwe);
    fc.set_my_rwe(f.my_rwe);
    fc.set_my_lwe(f.my_lwe);
    fc.into_bytes()
}

async fn transmit_lower(
    ipcp: &Arc<IpcpEntry>,
    lower: &Arc<FlowEntry>,
    bytes: BytesMut,
) -> Result<()> {
    let len = bytes.len();
    let lower_ipcp = lower.ipcp();
    let ops = lower_ipcp.ops()?;
    ipcp.stats.tx_pkt.fetch_add(1);
    ipcp.stats.tx_byte.fetch_add(len as u64);
    ops.sdu_write(lower_ipcp, lower, bytes).await?;
    Ok(())
}

/// Hands a PDU destined to ourselves back to the receive path, from a
/// fresh task the way a queued softirq would run it.
fn deliver_self(priv_: &NormalIpcp, ipcp: &Arc<IpcpEntry>, bytes: BytesMut) {
    if let Some(me) = priv_.me.upgrade() {
        let ipcp = ipcp.clone();
        task::spawn(async move {
            sdu_rx(&me, &ipcp, bytes).await.ok();
        });
    }
}

/// Routes a finished PDU: loopback for our own address, PDUFT otherwise.
async fn transmit_pdu(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    dst_addr: u64,
    bytes: BytesMut,
) -> Result<()> {
    if dst_addr == ipcp.addr.load() {
        deliver_self(priv_, ipcp, bytes);
        return Ok(());
    }
    match priv_.pduft_lookup(dst_addr) {
        Some(lower) => transmit_lower(ipcp, &lower, bytes).await,
        None => {
            log::debug!("No route to IPCP {}, dropping packet", dst_addr);
            ipcp.stats.tx_err.fetch_add(1);
            Ok(())
        }
    }
}

fn arm_snd_inact(priv_: &NormalIpcp, ipcp: &Arc<IpcpEntry>, flow: &Arc<FlowEntry>) {
    let me = match priv_.me.upgrade() {
        Some(me) => me,
        None => return,
    };
    let gen = {
        let mut dtp = flow.dtp.lock().unwrap();
        dtp.snd_inact_gen += 1;
        dtp.snd_inact_gen
    };
    let ipcp = ipcp.clone();
    let flow = flow.clone();
    task::spawn(async move {
        Delay::new(snd_inact_delay()).await;
        snd_inact_fire(&me, &ipcp, &flow, gen).await;
    });
}

/// Sender inactivity: reset the run, discard the deferred-transmission
/// queues, tell the peer where the windows stand and signal the upper
/// flow. User-visible flow state stays put.
async fn snd_inact_fire(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    flow: &Arc<FlowEntry>,
    gen: u64,
) {
    let fcf = {
        let mut dtp = flow.dtp.lock().unwrap();
        if dtp.snd_inact_gen != gen {
            return;
        }
        log::debug!("sender inactivity on flow {}", flow.local_port);
        dtp.set_drf = true;
        // InitialSeqNumPolicy.
        dtp.next_seq_num_to_send = 0;
        dtp.cwq.clear();
        dtp.rtxq.clear();

        let seq = dtp.next_snd_ctl_seq;
        dtp.next_snd_ctl_seq += 1;
        FcFields {
            seq,
            last_ctrl_seq_num_rcvd: dtp.last_ctrl_seq_num_rcvd,
            new_rwe: dtp.rcv_rwe,
            new_lwe: dtp.rcv_lwe,
            my_rwe: dtp.snd_rwe,
            my_lwe: dtp.snd_lwe,
        }
    };

    let remote_addr = flow.remote_addr();

    // Control ack PDU.
    let fc = build_fc(ipcp, flow, &fcf);
    transmit_pdu(priv_, ipcp, remote_addr, fc).await.ok();

    // Zero-length transfer PDU carrying the fresh data run flag. Built
    // by hand: going through sdu_write would re-arm the timer.
    let mut pdu = Pdu::dt(b"");
    pdu.set_dst_addr(remote_addr);
    pdu.set_src_addr(ipcp.addr.load());
    pdu.set_qos_id(flow.qos_id());
    pdu.set_dst_cep(flow.remote_cep());
    pdu.set_src_cep(flow.local_cep);
    pdu.set_pdu_flags(PDU_F_DRF);
    {
        let mut dtp = flow.dtp.lock().unwrap();
        pdu.set_seqnum(dtp.next_seq_num_to_send);
        dtp.next_seq_num_to_send += 1;
        dtp.set_drf = false;
    }
    transmit_pdu(priv_, ipcp, remote_addr, pdu.into_bytes()).await.ok();

    flow.mark_inactive();
}

fn arm_rcv_inact(flow: &Arc<FlowEntry>) {
    let gen = {
        let mut dtp = flow.dtp.lock().unwrap();
        dtp.rcv_inact_gen += 1;
        dtp.rcv_inact_gen
    };
    let flow = flow.clone();
    task::spawn(async move {
        Delay::new(rcv_inact_delay()).await;
        let dtp = flow.dtp.lock().unwrap();
        if dtp.rcv_inact_gen == gen {
            log::debug!("receiver inactivity on flow {}", flow.local_port);
        }
    });
}

pub(crate) async fn sdu_write(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    flow: &Arc<FlowEntry>,
    sdu: BytesMut,
) -> Result<usize> {
    let len = sdu.len();
    let remote_addr = flow.remote_addr();
    let self_addr = ipcp.addr.load();

    let lower_flow = priv_.pduft_lookup(remote_addr);
    if lower_flow.is_none() && remote_addr != self_addr {
        log::debug!("No route to IPCP {}, dropping packet", remote_addr);
        ipcp.stats.tx_err.fetch_add(1);
        return Ok(len);
    }

    let cfg = flow.config();
    let window = cfg.dtcp.flow_control && cfg.dtcp.fc_type == FcType::Window;
    let rtx = cfg.dtcp.rtx_control;

    let mut pdu = Pdu::dt(&sdu);
    pdu.set_dst_addr(remote_addr);
    pdu.set_src_addr(self_addr);
    pdu.set_qos_id(flow.qos_id());
    pdu.set_dst_cep(flow.remote_cep());
    pdu.set_src_cep(flow.local_cep);
    pdu.set_pdu_type(PDU_T_DT);

    let to_send = {
        let mut dtp = flow.dtp.lock().unwrap();
        // Stop the sender inactivity timer.
        dtp.snd_inact_gen += 1;

        let seqnum = dtp.next_seq_num_to_send;
        dtp.next_seq_num_to_send = dtp.next_seq_num_to_send.wrapping_add(1);
        pdu.set_seqnum(seqnum);
        if dtp.set_drf {
            pdu.set_pdu_flags(PDU_F_DRF);
            dtp.set_drf = false;
        }

        match tx_register(&mut dtp, window, rtx, seqnum, pdu.into_bytes()) {
            Ok(to_send) => to_send,
            Err(()) => {
                log::debug!("Dropping overrun PDU [{}]", seqnum);
                drop(dtp);
                ipcp.stats.tx_err.fetch_add(1);
                return Ok(len);
            }
        }
    };

    // 3 * (MPL + R + A).
    arm_snd_inact(priv_, ipcp, flow);

    if let Some(bytes) = to_send {
        match lower_flow.as_ref() {
            Some(lower) => transmit_lower(ipcp, lower, bytes).await?,
            // Self flow: the SDU loops back into this very IPCP.
            None => deliver_self(priv_, ipcp, bytes),
        }
    }

    Ok(len)
}

pub(crate) async fn sdu_rx(priv_: &NormalIpcp, ipcp: &Arc<IpcpEntry>, bytes: BytesMut) -> Result<()> {
    let pdu = match Pdu::parse(bytes) {
        Ok(pdu) => pdu,
        Err(_) => {
            ipcp.stats.rx_err.fetch_add(1);
            return Err(Error::InvalidArg);
        }
    };
    ipcp.stats.rx_pkt.fetch_add(1);
    ipcp.stats.rx_byte.fetch_add(pdu.bytes().len() as u64);

    if pdu.pdu_type() == PDU_T_MGMT {
        // Management PDUs are consumed by the user-space IPCP through its
        // own channel; nothing for the data path to do.
        log::debug!("dropping {} byte mgmt PDU, no local consumer", pdu.payload().len());
        return Ok(());
    }

    let dm = ipcp.dm().clone();
    let flow = match dm.flow_get_by_cep(pdu.dst_cep()) {
        Some(flow) => flow,
        None => {
            log::info!("No flow for cep-id {}: dropping PDU", pdu.dst_cep());
            ipcp.stats.rx_err.fetch_add(1);
            return Ok(());
        }
    };

    let ret = match pdu.pdu_type() {
        PDU_T_DT => rx_dt(priv_, ipcp, &flow, pdu).await,
        PDU_T_FC => rx_ctrl(priv_, ipcp, &flow, pdu).await,
        _ => Ok(()),
    };

    flow_put(&flow);
    ret
}

async fn rx_dt(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    flow: &Arc<FlowEntry>,
    pdu: Pdu,
) -> Result<()> {
    let cfg = flow.config();
    let seqnum = pdu.seqnum();

    let (deliver, fc) = {
        let mut dtp = flow.dtp.lock().unwrap();
        // Data arrived: hold the receiver inactivity timer.
        dtp.rcv_inact_gen += 1;

        let class = classify(&mut dtp, pdu.drf(), seqnum);
        match class {
            RxClass::Duplicate => {
                log::debug!("Dropping duplicate PDU [seq={}]", seqnum);
            }
            RxClass::GapFill => {
                log::debug!("Possible gap fill, RLWE jumps to {}", seqnum.wrapping_add(1));
            }
            RxClass::OutOfOrder => {
                log::debug!("Out of order packet, RLWE jumps to {}", seqnum.wrapping_add(1));
            }
            RxClass::NewRun | RxClass::InOrder => {}
        }
        let deliver = class != RxClass::Duplicate;
        let fc = if deliver { sv_update(&mut dtp, &cfg.dtcp) } else { None };
        (deliver, fc)
    };

    if deliver {
        let payload = pdu.into_payload();
        if !payload.is_empty() {
            sdu_rx_flow(flow, payload).await?;
        }
        if let Some(fcf) = fc {
            let bytes = build_fc(ipcp, flow, &fcf);
            transmit_pdu(priv_, ipcp, flow.remote_addr(), bytes).await?;
        }
    }

    // 2/3 * 2 * (MPL + R + A).
    arm_rcv_inact(flow);

    Ok(())
}

async fn rx_ctrl(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    flow: &Arc<FlowEntry>,
    pdu: Pdu,
) -> Result<()> {
    let ctrl = CtrlPdu::from_pdu(pdu).map_err(|_| Error::InvalidArg)?;
    let rtx = flow.config().dtcp.rtx_control;

    let to_send = {
        let mut dtp = flow.dtp.lock().unwrap();
        ctrl_update(
            &mut dtp,
            rtx,
            ctrl.pdu().seqnum(),
            ctrl.new_lwe(),
            ctrl.new_rwe(),
        )
    };

    // The window moved: closed-window PDUs that now fit go out.
    for bytes in to_send {
        transmit_pdu(priv_, ipcp, flow.remote_addr(), bytes).await?;
    }

    Ok(())
}

pub(crate) async fn mgmt_sdu_write(
    priv_: &NormalIpcp,
    ipcp: &Arc<IpcpEntry>,
    route: MgmtRoute,
    sdu: BytesMut,
) -> Result<usize> {
    let len = sdu.len();

    let (lower, dst_addr, owned) = match route {
        MgmtRoute::DstAddr(addr) => match priv_.pduft_lookup(addr) {
            Some(lower) => (lower, addr, false),
            None => {
                log::info!("No route to IPCP {}, dropping packet", addr);
                return Ok(len);
            }
        },
        MgmtRoute::LocalPort(port) => {
            let lower = match ipcp.dm().flow_get(port) {
                Some(lower) => lower,
                None => {
                    log::info!("Invalid mgmt header local port {}, dropping packet", port);
                    return Ok(len);
                }
            };
            let ours = lower
                .upper_ipcp()
                .map(|up| Arc::ptr_eq(&up, ipcp))
                .unwrap_or(false);
            if !ours {
                log::info!("Invalid mgmt header local port {}, dropping packet", port);
                flow_put(&lower);
                return Ok(len);
            }
            (lower, ctlmsg::ADDR_NULL, true)
        }
    };

    let mut pdu = Pdu::mgmt(&sdu);
    pdu.set_dst_addr(dst_addr);
    pdu.set_src_addr(ipcp.addr.load());

    let ret = transmit_lower(ipcp, &lower, pdu.into_bytes()).await;
    if owned {
        flow_put(&lower);
    }
    ret.map(|_| len)
}
