//! Per-flow data transfer state.
//!
//! The state machine itself (sequencing decisions, window checks, PDU
//! classification) lives in the normal IPCP; the core owns the state so
//! that flow teardown can inspect the closed window queue and the
//! retransmission queue when deciding whether removal must be postponed.
use bytes::BytesMut;
use ctlmsg::DtpState;
use std::collections::VecDeque;
use std::time::Instant;

/// Sender and receiver state of one flow.
pub struct Dtp {
    /// Next transfer PDU carries the data run flag.
    pub set_drf: bool,
    /// Next sequence number to consume.
    pub next_seq_num_to_send: u64,
    /// Sender left window edge.
    pub snd_lwe: u64,
    /// Sender right window edge.
    pub snd_rwe: u64,
    /// Sequence number of the last PDU handed to the lower flow.
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
    /// PDUs waiting for the window to open, by sequence number.
    pub cwq: VecDeque<(u64, BytesMut)>,
    /// Closed window queue bound.
    pub max_cwq_len: usize,
    /// Sent PDUs not yet acknowledged: sequence number, transmission
    /// time (for round-trip sampling) and the PDU itself.
    pub rtxq: VecDeque<(u64, Instant, BytesMut)>,
    /// Retransmission queue bound.
    pub max_rtxq_len: usize,
    /// Smoothed round trip estimate, microseconds.
    pub rtt_us: u64,
    /// Round trip deviation estimate, microseconds.
    pub rtt_stddev_us: u64,
    /// Generation of the armed sender inactivity timer; bumping it cancels.
    pub snd_inact_gen: u64,
    /// Generation of the armed receiver inactivity timer.
    pub rcv_inact_gen: u64,
}

impl Default for Dtp {
    fn default() -> Self {
        Self::new()
    }
}

impl Dtp {
    /// Fresh state for a new flow: data run flag set, sequencing at zero,
    /// no window credit, queues empty.
    pub fn new() -> Self {
        Self {
            set_drf: true,
            next_seq_num_to_send: 0,
            snd_lwe: 0,
            snd_rwe: 0,
            last_seq_num_sent: u64::MAX,
            last_ctrl_seq_num_rcvd: 0,
            next_snd_ctl_seq: 0,
            rcv_lwe: 0,
            rcv_rwe: 0,
            max_seq_num_rcvd: u64::MAX,
            cwq: VecDeque::new(),
            max_cwq_len: 0,
            rtxq: VecDeque::new(),
            max_rtxq_len: 0,
            rtt_us: 0,
            rtt_stddev_us: 0,
            snd_inact_gen: 0,
            rcv_inact_gen: 0,
        }
    }

    /// Both deferred-transmission queues are empty.
    pub fn queues_drained(&self) -> bool {
        self.cwq.is_empty() && self.rtxq.is_empty()
    }

    /// Cancels both inactivity timers.
    pub fn cancel_timers(&mut self) {
        self.snd_inact_gen += 1;
        self.rcv_inact_gen += 1;
    }

    /// Snapshot for `FlowStatsResp`.
    pub fn snapshot(&self) -> DtpState {
        DtpState {
            snd_lwe: self.snd_lwe,
            snd_rwe: self.snd_rwe,
            next_seq_num_to_send: self.next_seq_num_to_send,
            last_seq_num_sent: self.last_seq_num_sent,
            last_ctrl_seq_num_rcvd: self.last_ctrl_seq_num_rcvd,
            next_snd_ctl_seq: self.next_snd_ctl_seq,
            rcv_lwe: self.rcv_lwe,
            rcv_rwe: self.rcv_rwe,
            max_seq_num_rcvd: self.max_seq_num_rcvd,
            cwq_len: self.cwq.len() as u32,
            max_cwq_len: self.max_cwq_len as u32,
            rtxq_len: self.rtxq.len() as u32,
            max_rtxq_len: self.max_rtxq_len as u32,
            rtt_us: self.rtt_us,
            rtt_stddev_us: self.rtt_stddev_us,
        }
    }

    pub(crate) fn fini(&mut self) {
        self.cancel_timers();
        if !self.queues_drained() {
            log::debug!(
                "dtp teardown with cwq {} rtxq {}",
                self.cwq.len(),
                self.rtxq.len()
            );
        }
        self.cwq.clear();
        self.rtxq.clear();
    }
}
