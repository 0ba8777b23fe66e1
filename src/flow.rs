//! Flow entries: creation, lookup, the reference-count discipline with
//! postponed removal, the sorted put-queue and the removal worker.
use crate::ctrl::CtrlDevice;
use crate::dm::{DataModel, FlowTables};
use crate::dtp::Dtp;
use crate::err::{Error, Result};
use crate::ipcp::{ipcp_get_ref, ipcp_put, IpcpEntry};
use async_std::task;
use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use ctlmsg::{serialize, Body, FlowConfig, FlowSpec, FlowStats, Msg};
use futures_timer::Delay;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant};

/// Flow allocation in progress.
pub const FLOW_PENDING: u32 = 1 << 0;
/// Flow allocation completed positively.
pub const FLOW_ALLOCATED: u32 = 1 << 1;
/// Flow torn down, EOF for readers.
pub const FLOW_DEALLOCATED: u32 = 1 << 2;
/// This side initiated the allocation.
pub const FLOW_INITIATOR: u32 = 1 << 3;
/// Flow was never bound to an I/O endpoint or an upper IPCP.
pub const FLOW_NEVER_BOUND: u32 = 1 << 4;
/// Removal already postponed once; the second pass is final.
pub const FLOW_DEL_POSTPONED: u32 = 1 << 5;
/// The upper-IPCP binding holds a flow reference, released at shutdown.
pub const FLOW_UPPER_BOUND: u32 = 1 << 6;
/// Sender inactivity was signalled on this flow.
pub const FLOW_INACTIVE: u32 = 1 << 7;

/// Reclaim timeout for flows that were created but never bound.
const UNBOUND_FLOW_TO: Duration = Duration::from_secs(5);
/// Receive queue byte budget per flow.
const RXQ_SIZE_MAX: usize = 1 << 16;

/// What sits on top of a flow: a control device (an application waiting
/// for the allocation outcome) or an upper IPCP. Never both.
pub struct Upper {
    /// Strong device reference, the file-reference analog.
    pub rc: Option<Arc<CtrlDevice>>,
    /// Upper IPCP using this flow as an N-1 flow.
    pub ipcp: Option<Arc<IpcpEntry>>,
}

impl Upper {
    pub(crate) fn rc(rc: Arc<CtrlDevice>) -> Self {
        Self { rc: Some(rc), ipcp: None }
    }
}

pub(crate) struct Txrx {
    pub rx_q: VecDeque<BytesMut>,
    pub rx_qsize: usize,
    pub eof: bool,
    pub wakers: Vec<Waker>,
}

/// Fields guarded by the per-flow rx lock.
pub(crate) struct FlowState {
    pub flags: u32,
    pub remote_port: u16,
    pub remote_cep: u16,
    pub qos_id: u8,
    pub remote_addr: u64,
    pub upper: Upper,
    pub event_id: u32,
    pub cfg: FlowConfig,
    pub txrx: Txrx,
}

/// Per-flow traffic counters.
#[derive(Default)]
pub struct FlowCounters {
    pub tx_pkt: AtomicCell<u64>,
    pub tx_byte: AtomicCell<u64>,
    pub rx_pkt: AtomicCell<u64>,
    pub rx_byte: AtomicCell<u64>,
}

impl FlowCounters {
    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            tx_pkt: self.tx_pkt.load(),
            tx_byte: self.tx_byte.load(),
            rx_pkt: self.rx_pkt.load(),
            rx_byte: self.rx_byte.load(),
        }
    }
}

/// One flow.
pub struct FlowEntry {
    /// Local port id, key in the per-DM flow table.
    pub local_port: u16,
    /// Local connection endpoint id, zero unless the IPCP uses CEP ids.
    pub local_cep: u16,
    /// Monotonic id disambiguating port reuse.
    pub uid: AtomicCell<u32>,
    /// Local application name.
    pub local_appl: String,
    /// Remote application name.
    pub remote_appl: String,
    /// QoS asked at allocation.
    pub spec: FlowSpec,
    /// Data transfer state, its own lock.
    pub dtp: Mutex<Dtp>,
    /// Traffic counters.
    pub stats: FlowCounters,
    pub(crate) ipcp: Arc<IpcpEntry>,
    pub(crate) state: Mutex<FlowState>,
    pub(crate) refcnt: AtomicCell<i32>,
    pub(crate) expires: AtomicCell<Option<Instant>>,
}

impl FlowEntry {
    /// The IPCP supporting this flow.
    pub fn ipcp(&self) -> &Arc<IpcpEntry> {
        &self.ipcp
    }

    /// Remote address, `ADDR_NULL` until the allocation completes.
    pub fn remote_addr(&self) -> u64 {
        self.state.lock().unwrap().remote_addr
    }

    /// Remote port id.
    pub fn remote_port(&self) -> u16 {
        self.state.lock().unwrap().remote_port
    }

    /// Remote CEP id.
    pub fn remote_cep(&self) -> u16 {
        self.state.lock().unwrap().remote_cep
    }

    /// QoS id of the connection.
    pub fn qos_id(&self) -> u8 {
        self.state.lock().unwrap().qos_id
    }

    /// Current flow configuration.
    pub fn config(&self) -> FlowConfig {
        self.state.lock().unwrap().cfg.clone()
    }

    /// The upper IPCP bound to this flow, if any.
    pub fn upper_ipcp(&self) -> Option<Arc<IpcpEntry>> {
        self.state.lock().unwrap().upper.ipcp.clone()
    }

    /// Current flags.
    pub fn flags(&self) -> u32 {
        self.state.lock().unwrap().flags
    }

    pub(crate) fn set_config(&self, cfg: FlowConfig) {
        self.state.lock().unwrap().cfg = cfg;
    }

    /// Marks the flow inactive after a prolonged sender silence and wakes
    /// upper readers so they observe the condition.
    pub fn mark_inactive(&self) {
        let mut st = self.state.lock().unwrap();
        st.flags |= FLOW_INACTIVE;
        for w in st.txrx.wakers.drain(..) {
            w.wake();
        }
    }

    /// Delivers one SDU into the flow receive queue. Overruns are dropped.
    pub(crate) fn rx_push(&self, sdu: BytesMut) {
        let mut st = self.state.lock().unwrap();
        if st.txrx.eof {
            return;
        }
        if st.txrx.rx_qsize + sdu.len() > RXQ_SIZE_MAX {
            log::debug!("flow {} rx queue overrun, dropping", self.local_port);
            return;
        }
        self.stats.rx_pkt.fetch_add(1);
        self.stats.rx_byte.fetch_add(sdu.len() as u64);
        st.txrx.rx_qsize += sdu.len();
        st.txrx.rx_q.push_back(sdu);
        for w in st.txrx.wakers.drain(..) {
            w.wake();
        }
    }
}

impl DataModel {
    /// Looks a flow up by port id, taking a reference.
    pub fn flow_get(&self, port_id: u16) -> Option<Arc<FlowEntry>> {
        let tables = self.flows.read().unwrap();
        let flow = tables.by_port.get(&port_id)?;
        flow.refcnt.fetch_add(1);
        Some(flow.clone())
    }

    /// Looks a flow up by local CEP id, taking a reference.
    pub fn flow_get_by_cep(&self, cep_id: u16) -> Option<Arc<FlowEntry>> {
        let tables = self.flows.read().unwrap();
        let flow = tables.by_cep.get(&cep_id)?;
        flow.refcnt.fetch_add(1);
        Some(flow.clone())
    }

    /// True if any flow is supported by or upper-bound to `ipcp`.
    pub(crate) fn ipcp_has_flows(&self, ipcp: &Arc<IpcpEntry>, report_all: bool) -> bool {
        let tables = self.flows.read().unwrap();
        let mut has_flows = false;
        for flow in tables.by_port.values() {
            if Arc::ptr_eq(&flow.ipcp, ipcp) {
                has_flows = true;
                if report_all {
                    log::error!(
                        "Flow {} has a horizontal dangling reference to ipcp {}",
                        flow.local_port,
                        ipcp.id
                    );
                }
            }
            if flow
                .upper_ipcp()
                .map(|up| Arc::ptr_eq(&up, ipcp))
                .unwrap_or(false)
            {
                has_flows = true;
                if report_all {
                    log::error!(
                        "Flow {} has a vertical dangling reference to ipcp {}",
                        flow.local_port,
                        ipcp.id
                    );
                }
            }
            if !report_all && has_flows {
                break;
            }
        }
        has_flows
    }

    pub(crate) fn flow_rc_probe_references(&self, dev_id: u32) {
        let tables = self.flows.read().unwrap();
        for flow in tables.by_port.values() {
            let st = flow.state.lock().unwrap();
            if st.upper.rc.as_ref().map(|rc| rc.dev_id) == Some(dev_id) {
                log::error!(
                    "Flow {} has a dangling reference to control device {}",
                    flow.local_port,
                    dev_id
                );
            }
        }
    }

    /// Creates a flow on `ipcp` in the pending, never-bound state, with
    /// the unbound reclaim timer armed.
    pub(crate) fn flow_add(
        &self,
        ipcp: &Arc<IpcpEntry>,
        upper: Upper,
        event_id: u32,
        local_appl: &str,
        remote_appl: &str,
        flowcfg: Option<&FlowConfig>,
        flowspec: &FlowSpec,
    ) -> Result<Arc<FlowEntry>> {
        if ipcp.is_zombie() {
            // Zombie ipcps don't accept new flows.
            return Err(Error::NotFound);
        }

        let entry;
        {
            let mut tables = self.flows.write().unwrap();

            let local_port = tables.port_ids.alloc()? as u16;
            let local_cep = if ipcp.use_cep_ids() {
                match tables.cep_ids.alloc() {
                    Ok(cep) => cep as u16,
                    Err(e) => {
                        tables.port_ids.clear(local_port as usize);
                        return Err(e);
                    }
                }
            } else {
                0
            };

            let uid = tables.uid_cnt;
            tables.uid_cnt += 1;

            entry = Arc::new(FlowEntry {
                local_port,
                local_cep,
                uid: AtomicCell::new(uid),
                local_appl: local_appl.to_string(),
                remote_appl: remote_appl.to_string(),
                spec: flowspec.clone(),
                dtp: Mutex::new(Dtp::new()),
                stats: FlowCounters::default(),
                ipcp: ipcp.clone(),
                state: Mutex::new(FlowState {
                    flags: FLOW_PENDING | FLOW_NEVER_BOUND,
                    remote_port: ctlmsg::PORT_ID_NONE,
                    remote_cep: ctlmsg::CEP_ID_NONE,
                    qos_id: 0,
                    remote_addr: ctlmsg::ADDR_NULL,
                    upper,
                    event_id,
                    cfg: flowcfg.cloned().unwrap_or_default(),
                    txrx: Txrx {
                        rx_q: VecDeque::new(),
                        rx_qsize: 0,
                        eof: false,
                        wakers: Vec::new(),
                    },
                }),
                refcnt: AtomicCell::new(1),
                expires: AtomicCell::new(None),
            });

            tables.by_port.insert(local_port, entry.clone());
            if ipcp.use_cep_ids() {
                tables.by_cep.insert(local_cep, entry.clone());
            }

            entry.refcnt.fetch_add(1); // on behalf of the caller

            // Start the unbound timer.
            flows_putq_add(&self.arc(), &mut tables, &entry, UNBOUND_FLOW_TO);
        }

        {
            let _table = self.ipcps.lock().unwrap();
            ipcp_get_ref(ipcp);
        }

        if flowcfg.is_some() {
            if let Ok(ops) = ipcp.ops() {
                // Let the IPCP do some specific initialization.
                ops.flow_init(ipcp, &entry);
            }
        }

        Ok(entry)
    }

    /// Shuts down every flow supported by or upper-bound to `ipcp`.
    pub(crate) fn flows_shutdown_by_ipcp(&self, ipcp: &Arc<IpcpEntry>) {
        let victims: Vec<Arc<FlowEntry>> = {
            let tables = self.flows.read().unwrap();
            tables
                .by_port
                .values()
                .filter(|flow| {
                    Arc::ptr_eq(&flow.ipcp, ipcp)
                        || flow
                            .upper_ipcp()
                            .map(|up| Arc::ptr_eq(&up, ipcp))
                            .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for flow in victims {
            flow_shutdown(&flow);
        }
    }

    pub(crate) fn flows_putq_drain(&self, gen: u64) {
        let dm = self.arc();
        let mut tables = self.flows.write().unwrap();
        if tables.putq_tmr_gen != gen {
            // A later arm superseded this timer.
            return;
        }
        let now = Instant::now();
        loop {
            let flow = match tables.putq.first() {
                Some(flow) => flow.clone(),
                None => break,
            };
            match flow.expires.load() {
                Some(exp) if exp <= now => {
                    tables.putq.remove(0);
                    flow.expires.store(None);
                    flow_put_locked(&dm, &mut tables, &flow); // match flows_putq_add()
                    if flow.flags() & FLOW_NEVER_BOUND != 0 {
                        log::warn!(
                            "Removing flow {} since it was never bound",
                            flow.local_port
                        );
                    }
                    flow_put_locked(&dm, &mut tables, &flow);
                }
                _ => break,
            }
        }
        tables.putq_tmr_deadline = None;
        flows_putq_arm(&dm, &mut tables);
    }
}

/// Takes an extra reference on an already-held flow.
pub fn flow_get_ref(flow: &Arc<FlowEntry>) {
    flow.refcnt.fetch_add(1);
}

/// To be called with the flow table write lock held. Queues the flow on
/// the sorted put-queue and re-arms the timer.
pub(crate) fn flows_putq_add(
    dm: &Arc<DataModel>,
    tables: &mut FlowTables,
    flow: &Arc<FlowEntry>,
    delay: Duration,
) {
    flow.refcnt.fetch_add(1);

    if flow.expires.load().is_none() {
        // Don't insert twice.
        let expires = Instant::now() + delay;
        flow.expires.store(Some(expires));
        let pos = tables
            .putq
            .iter()
            .position(|cur| cur.expires.load().map(|e| e > expires).unwrap_or(true))
            .unwrap_or(tables.putq.len());
        tables.putq.insert(pos, flow.clone());
        flows_putq_arm(dm, tables);
    }
}

/// Re-arms the put-queue timer to the head entry's expiry.
fn flows_putq_arm(dm: &Arc<DataModel>, tables: &mut FlowTables) {
    let head = tables.putq.first().and_then(|f| f.expires.load());
    if head == tables.putq_tmr_deadline {
        return;
    }
    tables.putq_tmr_gen += 1;
    tables.putq_tmr_deadline = head;
    if let Some(deadline) = head {
        let gen = tables.putq_tmr_gen;
        let dm = dm.clone();
        task::spawn(async move {
            let now = Instant::now();
            if deadline > now {
                Delay::new(deadline - now).await;
            }
            dm.flows_putq_drain(gen);
        });
    }
}

/// Removes the flow from the put-queue and drops the queue's reference.
pub(crate) fn flows_putq_del(dm: &Arc<DataModel>, flow: &Arc<FlowEntry>) {
    let queued = {
        let mut tables = dm.flows.write().unwrap();
        if flow.expires.load().is_some() {
            flow.expires.store(None);
            tables.putq.retain(|cur| !Arc::ptr_eq(cur, flow));
            flows_putq_arm(dm, &mut tables);
            true
        } else {
            false
        }
    };
    if queued {
        flow_put(flow);
    }
}

/// Drops one flow reference.
pub fn flow_put(flow: &Arc<FlowEntry>) {
    let dm = flow.ipcp.dm.clone();
    let mut tables = dm.flows.write().unwrap();
    flow_put_locked(&dm, &mut tables, flow);
}

/// The zero transition must happen under the flow table write lock: a
/// concurrent `flow_get` between the decrement and the detach would
/// otherwise resurrect an object already bound for destruction.
pub(crate) fn flow_put_locked(
    dm: &Arc<DataModel>,
    tables: &mut FlowTables,
    flow: &Arc<FlowEntry>,
) {
    let r = flow.refcnt.fetch_sub(1) - 1;
    debug_assert!(r >= 0);
    if r > 0 {
        // Flow is still being used by someone.
        return;
    }

    {
        let mut st = flow.state.lock().unwrap();
        st.flags |= FLOW_DEALLOCATED;

        // Removal is postponed once for allocated flows, at least for the
        // deallocation grace period, to let the closed window queue and
        // the retransmission queue drain.
        if st.flags & FLOW_DEL_POSTPONED == 0
            && st.flags & FLOW_ALLOCATED != 0
            && st.flags & FLOW_NEVER_BOUND == 0
        {
            st.flags |= FLOW_DEL_POSTPONED;
            {
                let mut dtp = flow.dtp.lock().unwrap();
                if !dtp.queues_drained() {
                    log::debug!(
                        "Flow removal postponed, cwq contains {} PDUs and rtxq contains {} PDUs",
                        dtp.cwq.len(),
                        dtp.rtxq.len()
                    );
                    // No one can write or read this flow anymore; the
                    // inactivity timers have nothing left to watch.
                    dtp.cancel_timers();
                }
            }
            drop(st);

            // The counter is zero here; reset it to one and let the
            // delayed removal do its job.
            flow.refcnt.fetch_add(1);
            let wait = Duration::from_millis(flow.ipcp.flow_del_wait_ms.load() as u64);
            flows_putq_add(dm, tables, flow, wait);
            return;
        }
    }

    // Detach from the tables, atomically with the id release.
    tables.by_port.remove(&flow.local_port);
    tables.port_ids.clear(flow.local_port as usize);
    if flow.ipcp.use_cep_ids() {
        tables.by_cep.remove(&flow.local_cep);
        tables.cep_ids.clear(flow.local_cep as usize);
    }

    // Destruction happens in process context, on the removal worker.
    tables.removeq.push(flow.clone());
    task::spawn(flows_removew(dm.clone()));
}

async fn flows_removew(dm: Arc<DataModel>) {
    let removeq: Vec<Arc<FlowEntry>> = {
        let mut tables = dm.flows.write().unwrap();
        tables.removeq.drain(..).collect()
    };
    for flow in removeq {
        flow_del(&dm, flow).await;
    }
}

/// Flow destructor, worker context.
async fn flow_del(dm: &Arc<DataModel>, flow: Arc<FlowEntry>) {
    let ipcp = flow.ipcp.clone();
    let ops = ipcp.ops().ok();
    let handles_dealloc = ops
        .as_ref()
        .map(|ops| ops.handles_flow_dealloc())
        .unwrap_or(false);

    let (upper_ipcp, remote_port, remote_addr) = {
        let mut st = flow.state.lock().unwrap();
        st.txrx.rx_q.clear();
        st.txrx.rx_qsize = 0;
        (st.upper.ipcp.take(), st.remote_port, st.remote_addr)
    };

    if handles_dealloc {
        // Kernel-handled IPCP, flow deallocation ends here.
        if let Some(ops) = ops.as_ref() {
            ops.flow_deallocated(&ipcp, &flow);
        }
    }

    flow.dtp.lock().unwrap().fini();

    if let Some(upper) = upper_ipcp.as_ref() {
        if let Ok(upper_ops) = upper.ops() {
            upper_ops.pduft_flush_by_flow(upper, &flow);
        }
    }

    // Probe references before the entry goes away.
    if flow.expires.load().is_some() {
        log::error!("putq has a dangling reference to flow {}", flow.local_port);
    }
    {
        let tables = dm.flows.read().unwrap();
        if tables.removeq.iter().any(|f| Arc::ptr_eq(f, &flow)) {
            log::error!("removeq has a dangling reference to flow {}", flow.local_port);
        }
    }

    // Drop the strong device reference, if the flow still holds one.
    {
        let mut st = flow.state.lock().unwrap();
        st.upper.rc = None;
    }

    log::debug!("flow entry {} removed", flow.local_port);

    if !handles_dealloc {
        // Notify the uipcp about flow deallocation, if it makes sense.
        if let Some(uipcp) = ipcp.uipcp() {
            if flow.local_port != ctlmsg::PORT_ID_NONE
                && remote_port != ctlmsg::PORT_ID_NONE
                && remote_addr != ctlmsg::ADDR_NULL
            {
                let ntfy = Msg::event(Body::FlowDeallocated {
                    ipcp_id: ipcp.id,
                    local_port_id: flow.local_port,
                    remote_port_id: remote_port,
                    remote_addr,
                });
                uipcp.upqueue.append(serialize(&ntfy)).await.ok();
            }
        } else {
            log::warn!("No uipcp to notify");
        }
    }

    // Process context: safe to release both the IPCP supporting the flow
    // and the IPCP that was using it.
    if let Some(upper) = upper_ipcp {
        {
            let mut mtx = ipcp.mtx.lock().unwrap();
            mtx.shortcut_flows -= 1;
            if mtx.shortcut_flows == 0 {
                mtx.shortcut = None;
            }
        }
        ipcp_put(&upper);
    }
    ipcp_put(&ipcp);
}

/// Clears the never-bound state once the flow gets an I/O endpoint or an
/// upper IPCP, dropping the creation reference and the unbound timer.
pub fn flow_make_mortal(flow: &Arc<FlowEntry>) {
    let dm = flow.ipcp.dm.clone();
    let mut never_bound = false;
    {
        let _tables = dm.flows.write().unwrap();
        let mut st = flow.state.lock().unwrap();
        if st.flags & FLOW_NEVER_BOUND != 0 {
            never_bound = true;
            st.flags &= !FLOW_NEVER_BOUND;
            // The creation reference dies with the never-bound state,
            // otherwise the flow would live forever at refcount one.
            flow.refcnt.fetch_sub(1);
        }
    }
    if never_bound {
        flows_putq_del(&dm, flow);
    }
}

/// Sets the EOF condition on an allocated flow and wakes its readers.
/// Releases the upper binding's flow reference, exactly once.
pub fn flow_shutdown(flow: &Arc<FlowEntry>) {
    let mut deallocated = false;
    let mut drop_upper_ref = false;
    {
        let mut st = flow.state.lock().unwrap();
        if st.flags & FLOW_ALLOCATED != 0 {
            st.txrx.eof = true;
            st.flags |= FLOW_DEALLOCATED;
            deallocated = true;
        }
        if st.flags & FLOW_UPPER_BOUND != 0 {
            st.flags &= !FLOW_UPPER_BOUND;
            drop_upper_ref = true;
        }
        if deallocated {
            for w in st.txrx.wakers.drain(..) {
                w.wake();
            }
        }
    }
    if drop_upper_ref {
        flow_put(flow);
    }
}

/// Delivers a received SDU up the stack: into the upper IPCP when one is
/// bound, into the flow receive queue otherwise.
pub async fn sdu_rx_flow(flow: &Arc<FlowEntry>, sdu: BytesMut) -> Result<()> {
    if let Some(upper) = flow.upper_ipcp() {
        let ops = upper.ops()?;
        return ops.sdu_rx(&upper, sdu).await;
    }
    flow.rx_push(sdu);
    Ok(())
}
