//! IPC process entries, the DIF list and the IPCP side of the data model.
use crate::appl::RegisteredAppl;
use crate::ctrl::{CtrlDevice, F_IPCPS};
use crate::dm::{dm_getref, dm_put, DataModel};
use crate::err::{Error, Result};
use crate::factory::{factories_find, IpcpFactory, IpcpOps};
use crossbeam::atomic::AtomicCell;
use ctlmsg::{serialize, Body, IpcpStats, Msg, UpdateKind};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

/// IPCP is being destroyed: no new flows, no PDUFT changes.
pub const IPCP_ZOMBIE: u32 = 1 << 0;
/// Flows of this IPCP carry connection endpoint ids.
pub const IPCP_USE_CEP_IDS: u32 = 1 << 1;

const MAX_PDU_SIZE_DFLT: u32 = 8000;
const MPL_MSECS_DFLT: u32 = 1000;
pub(crate) const FLOW_DEL_WAIT_MS_DFLT: u32 = 4000;

/// A distributed IPC facility: a name shared by cooperating IPCPs.
pub struct Dif {
    /// DIF name.
    pub name: String,
    /// DIF type string, e.g. "normal".
    pub ty: String,
    /// Maximum PDU size in the DIF.
    pub max_pdu_size: u32,
    /// Maximum PDU lifetime, milliseconds.
    pub max_pdu_life_ms: u32,
    refcnt: AtomicCell<u32>,
}

/// Lock-free traffic counters of one IPCP. Writers on the data path only
/// ever add; readers aggregate by loading each counter.
#[derive(Default)]
pub struct IpcpCounters {
    pub tx_pkt: AtomicCell<u64>,
    pub tx_byte: AtomicCell<u64>,
    pub tx_err: AtomicCell<u64>,
    pub rx_pkt: AtomicCell<u64>,
    pub rx_byte: AtomicCell<u64>,
    pub rx_err: AtomicCell<u64>,
}

impl IpcpCounters {
    pub fn snapshot(&self) -> IpcpStats {
        IpcpStats {
            tx_pkt: self.tx_pkt.load(),
            tx_byte: self.tx_byte.load(),
            tx_err: self.tx_err.load(),
            rx_pkt: self.rx_pkt.load(),
            rx_byte: self.rx_byte.load(),
            rx_err: self.rx_err.load(),
        }
    }
}

/// Reference to the user-space IPCP attached through a control device.
pub(crate) struct UipcpRef {
    pub dev_id: u32,
    pub dev: Weak<CtrlDevice>,
}

/// Fields guarded by the per-IPCP mutex.
pub(crate) struct IpcpMut {
    pub uipcp: Option<UipcpRef>,
    /// Upper IPCP shortcut, valid only while exactly one distinct upper
    /// IPCP is bound to flows of this IPCP. Weak: not an ownership edge.
    pub shortcut: Option<Weak<IpcpEntry>>,
    pub shortcut_flows: u32,
}

/// One IPC process.
pub struct IpcpEntry {
    /// Id, unique within the data model.
    pub id: u16,
    /// Name, unique within the data model.
    pub name: String,
    /// The DIF this IPCP belongs to.
    pub dif: Arc<Dif>,
    pub(crate) dm: Arc<DataModel>,
    pub(crate) flags: AtomicCell<u32>,
    /// Address of this IPCP inside its DIF.
    pub addr: AtomicCell<u64>,
    /// Grace period granted to deallocated flows with queued PDUs.
    pub flow_del_wait_ms: AtomicCell<u32>,
    /// Transmit header room hint.
    pub txhdroom: AtomicCell<u16>,
    /// Receive header room hint.
    pub rxhdroom: AtomicCell<u16>,
    /// Tail room hint.
    pub tailroom: AtomicCell<u16>,
    /// Maximum SDU size accepted on flows of this IPCP.
    pub max_sdu_size: AtomicCell<u32>,
    /// Traffic counters.
    pub stats: IpcpCounters,
    pub(crate) refcnt: AtomicCell<i32>,
    pub(crate) regapps: Mutex<Vec<Arc<RegisteredAppl>>>,
    pub(crate) mtx: Mutex<IpcpMut>,
    pub(crate) uipcp_wakers: Mutex<Vec<Waker>>,
    factory: Mutex<Option<Arc<dyn IpcpFactory>>>,
    ops: Mutex<Option<Arc<dyn IpcpOps>>>,
}

impl IpcpEntry {
    pub fn is_zombie(&self) -> bool {
        self.flags.load() & IPCP_ZOMBIE != 0
    }

    pub fn use_cep_ids(&self) -> bool {
        self.flags.load() & IPCP_USE_CEP_IDS != 0
    }

    /// The operations vtable; `NotFound` before construction completes or
    /// after destruction.
    pub fn ops(&self) -> Result<Arc<dyn IpcpOps>> {
        self.ops.lock().unwrap().clone().ok_or(Error::NotFound)
    }

    /// The attached user-space IPCP, if any.
    pub fn uipcp(&self) -> Option<Arc<CtrlDevice>> {
        let mtx = self.mtx.lock().unwrap();
        mtx.uipcp.as_ref().and_then(|u| u.dev.upgrade())
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        let mut cur = self.flags.load();
        loop {
            match self.flags.compare_exchange(cur, cur | flag) {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }

    /// The data model this IPCP lives in.
    pub fn dm(&self) -> &Arc<DataModel> {
        &self.dm
    }
}

impl DataModel {
    pub(crate) fn dif_get(&self, dif_name: &str, dif_type: &str) -> Result<Arc<Dif>> {
        let mut difs = self.difs.lock().unwrap();
        if let Some(cur) = difs.iter().find(|d| d.name == dif_name) {
            if cur.ty != dif_type {
                return Err(Error::InvalidArg);
            }
            cur.refcnt.fetch_add(1);
            return Ok(cur.clone());
        }
        let dif = Arc::new(Dif {
            name: dif_name.to_string(),
            ty: dif_type.to_string(),
            max_pdu_size: MAX_PDU_SIZE_DFLT,
            max_pdu_life_ms: MPL_MSECS_DFLT,
            refcnt: AtomicCell::new(1),
        });
        log::debug!("DIF {} [type '{}'] created", dif.name, dif.ty);
        difs.push(dif.clone());
        Ok(dif)
    }

    pub(crate) fn dif_put(&self, dif: &Arc<Dif>) {
        let mut difs = self.difs.lock().unwrap();
        if dif.refcnt.fetch_sub(1) > 1 {
            return;
        }
        log::debug!("DIF {} [type '{}'] destroyed", dif.name, dif.ty);
        difs.retain(|d| !Arc::ptr_eq(d, dif));
    }

    /// Looks an IPCP up by id, taking a reference.
    pub fn ipcp_get(&self, ipcp_id: u16) -> Option<Arc<IpcpEntry>> {
        let table = self.ipcps.lock().unwrap();
        let entry = table.by_id.get(&ipcp_id)?;
        entry.refcnt.fetch_add(1);
        Some(entry.clone())
    }

    /// Selects an IPCP by DIF name, taking a reference.
    ///
    /// An empty name selects any DIF, preferring normal DIFs and, among
    /// those, the one with the larger transmit header room (an indication
    /// of how many levels sit below it).
    pub fn ipcp_select_by_dif(&self, dif_name: &str) -> Option<Arc<IpcpEntry>> {
        let table = self.ipcps.lock().unwrap();
        let mut selected: Option<&Arc<IpcpEntry>> = None;
        for entry in table.by_id.values() {
            if entry.is_zombie() {
                continue;
            }
            if dif_name.is_empty() {
                let better = match selected {
                    None => true,
                    Some(cur) => {
                        entry.dif.ty == "normal"
                            && (cur.dif.ty != "normal"
                                || entry.txhdroom.load() > cur.txhdroom.load())
                    }
                };
                if better {
                    selected = Some(entry);
                }
            } else if entry.dif.name == dif_name {
                selected = Some(entry);
                break;
            }
        }
        let entry = selected?;
        entry.refcnt.fetch_add(1);
        Some(entry.clone())
    }

    fn ipcp_add_entry(
        &self,
        name: &str,
        dif_type: &str,
        dif_name: &str,
    ) -> Result<Arc<IpcpEntry>> {
        let dm_ref = dm_getref(&self.arc());
        let mut table = self.ipcps.lock().unwrap();

        // The same check is performed by userspace; races end here.
        if table.by_id.values().any(|cur| cur.name == name) {
            drop(table);
            dm_put(&dm_ref);
            return Err(Error::InvalidArg);
        }

        let dif = match self.dif_get(dif_name, dif_type) {
            Ok(dif) => dif,
            Err(e) => {
                drop(table);
                dm_put(&dm_ref);
                return Err(e);
            }
        };

        let id = match table.ids.alloc() {
            Ok(id) => id as u16,
            Err(e) => {
                self.dif_put(&dif);
                drop(table);
                dm_put(&dm_ref);
                return Err(e);
            }
        };

        let entry = Arc::new(IpcpEntry {
            id,
            name: name.to_string(),
            dif,
            dm: dm_ref,
            flags: AtomicCell::new(0),
            addr: AtomicCell::new(ctlmsg::ADDR_NULL),
            flow_del_wait_ms: AtomicCell::new(FLOW_DEL_WAIT_MS_DFLT),
            txhdroom: AtomicCell::new(0),
            rxhdroom: AtomicCell::new(0),
            tailroom: AtomicCell::new(0),
            max_sdu_size: AtomicCell::new((1 << 16) - 1),
            stats: IpcpCounters::default(),
            refcnt: AtomicCell::new(1),
            regapps: Mutex::new(Vec::new()),
            mtx: Mutex::new(IpcpMut {
                uipcp: None,
                shortcut: None,
                shortcut_flows: 0,
            }),
            uipcp_wakers: Mutex::new(Vec::new()),
            factory: Mutex::new(None),
            ops: Mutex::new(None),
        });
        table.by_id.insert(id, entry.clone());
        Ok(entry)
    }

    /// Creates an IPCP: entry first, then the factory-built private state.
    pub(crate) fn ipcp_add(
        &self,
        name: &str,
        dif_type: &str,
        dif_name: &str,
    ) -> Result<u16> {
        let entry = self.ipcp_add_entry(name, dif_type, dif_name)?;

        let factory = match factories_find(dif_type) {
            Some(f) => f,
            None => {
                ipcp_put(&entry);
                return Err(Error::NotFound);
            }
        };

        // The factory reference **must** be held before the constructor
        // runs and released only after the destructor.
        *entry.factory.lock().unwrap() = Some(factory.clone());
        if factory.use_cep_ids() {
            entry.set_flag(IPCP_USE_CEP_IDS);
        }

        match factory.create(&entry) {
            Ok(ops) => {
                *entry.ops.lock().unwrap() = Some(ops);
                Ok(entry.id)
            }
            Err(e) => {
                ipcp_put(&entry);
                Err(e)
            }
        }
    }

    /// Destroys an IPCP: zombie first, then teardown of everything bound
    /// to it, then the final reference drop.
    pub(crate) fn ipcp_del(&self, ipcp_id: u16) -> Result<()> {
        let entry = self.ipcp_get(ipcp_id).ok_or(Error::NotFound)?;
        ipcp_put(&entry); // match the get; caller references keep it alive

        if entry.is_zombie() {
            // Someone already asked for destruction; the IPCP goes away
            // when the last reference drops.
            return Err(Error::NotFound);
        }
        entry.set_flag(IPCP_ZOMBIE);

        // Flush the PDUFT now. Nobody will do it afterwards, and new
        // entries are refused from here on.
        ipcp_pduft_flush(&entry).ok();

        // Unregister all the applications associated to this IPCP.
        let stolen = crate::appl::applications_steal_all(&entry);
        for app in stolen {
            log::debug!("Application {} will be automatically unregistered", app.name);
            crate::appl::ipcp_application_put(&app);
        }

        // Shut down the flows supported by or upper-bound to this IPCP.
        self.flows_shutdown_by_ipcp(&entry);

        ipcp_put(&entry);
        Ok(())
    }

    /// Appends `msg` to every control device subscribed to IPCP updates.
    pub(crate) fn broadcast_ipcp_update(&self, msg: &Msg) {
        let devs = self.general.lock().unwrap();
        for dev in devs.iter() {
            if let Some(dev) = dev.upgrade() {
                if dev.flags.load() & F_IPCPS != 0 {
                    dev.upqueue.append_nowait(serialize(msg)).ok();
                }
            }
        }
    }

    pub(crate) fn ipcp_update_all(&self, ipcp_id: u16, kind: UpdateKind) -> Result<()> {
        let ipcp = self.ipcp_get(ipcp_id).ok_or(Error::NotFound)?;
        let upd = ipcp_update_fill(&ipcp, kind);
        self.broadcast_ipcp_update(&upd);
        ipcp_put(&ipcp);
        Ok(())
    }
}

/// Builds an `IpcpUpdate` broadcast describing `entry`.
pub(crate) fn ipcp_update_fill(entry: &IpcpEntry, kind: UpdateKind) -> Msg {
    Msg::event(Body::IpcpUpdate {
        kind,
        ipcp_id: entry.id,
        ipcp_addr: entry.addr.load(),
        txhdroom: entry.txhdroom.load(),
        rxhdroom: entry.rxhdroom.load(),
        tailroom: entry.tailroom.load(),
        max_sdu_size: entry.max_sdu_size.load(),
        ipcp_name: entry.name.clone(),
        dif_name: entry.dif.name.clone(),
        dif_type: entry.dif.ty.clone(),
    })
}

pub(crate) fn ipcp_pduft_flush(ipcp: &Arc<IpcpEntry>) -> Result<()> {
    let ops = ipcp.ops()?;
    if !ops.has_pduft() {
        return Ok(());
    }
    let _mtx = ipcp.mtx.lock().unwrap();
    ops.pduft_flush(ipcp)
}

fn ipcp_probe_references(entry: &Arc<IpcpEntry>) {
    entry.dm.ipcp_has_flows(entry, /* report_all= */ true);

    let regapps = entry.regapps.lock().unwrap();
    for appl in regapps.iter() {
        log::error!(
            "Registered application {} has a dangling reference to ipcp {}",
            appl.name,
            entry.id
        );
    }
}

/// Drops one reference; the zero transition detaches the entry, runs the
/// destructor and notifies subscribers.
pub fn ipcp_put(entry: &Arc<IpcpEntry>) {
    let dm = entry.dm.clone();
    {
        let mut table = dm.ipcps.lock().unwrap();
        let r = entry.refcnt.fetch_sub(1) - 1;
        debug_assert!(r >= 0);
        if r > 0 {
            return;
        }
        table.by_id.remove(&entry.id);
        table.ids.clear(entry.id as usize);
    }

    // Destructor: drop the operations object exactly once. No lock is
    // needed, the last reference is gone and nobody can look us up.
    let ops = entry.ops.lock().unwrap().take();
    drop(ops);

    // The factory outlives its ops object; release it only now.
    let factory = entry.factory.lock().unwrap().take();
    drop(factory);

    dm.dif_put(&entry.dif);

    ipcp_probe_references(entry);

    // Tell every subscribed control device that the IPCP is gone. Only
    // the id is meaningful to userspace at this point.
    dm.broadcast_ipcp_update(&Msg::event(Body::IpcpUpdate {
        kind: UpdateKind::Del,
        ipcp_id: entry.id,
        ipcp_addr: ctlmsg::ADDR_NULL,
        txhdroom: 0,
        rxhdroom: 0,
        tailroom: 0,
        max_sdu_size: 0,
        ipcp_name: String::new(),
        dif_name: String::new(),
        dif_type: String::new(),
    }));

    log::info!("IPC process {} destroyed", entry.id);
    dm_put(&dm);
}

/// Takes an extra reference on an already-held entry.
pub(crate) fn ipcp_get_ref(entry: &Arc<IpcpEntry>) {
    entry.refcnt.fetch_add(1);
}

/// Resolves when a uipcp attaches to `entry`. Dropping the future gives
/// up the wait.
pub(crate) struct UipcpWait {
    pub entry: Arc<IpcpEntry>,
}

impl Future for UipcpWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let mtx = self.entry.mtx.lock().unwrap();
        let attached = mtx
            .uipcp
            .as_ref()
            .map(|u| u.dev.upgrade().is_some())
            .unwrap_or(false);
        drop(mtx);
        if attached {
            return Poll::Ready(());
        }
        self.entry
            .uipcp_wakers
            .lock()
            .unwrap()
            .push(cx.waker().clone());
        Poll::Pending
    }
}
