//! The per-namespace data model and the process-wide registry.
use crate::appl::RegisteredAppl;
use crate::ctrl::CtrlDevice;
use crate::factory::IpcpFactory;
use crate::flow::FlowEntry;
use crate::ids::{Bitmap, CEP_ID_BITMAP_SIZE, IPCP_ID_BITMAP_SIZE, PORT_ID_BITMAP_SIZE};
use crate::ipcp::{Dif, IpcpEntry};
use crossbeam::atomic::AtomicCell;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

/// Flow tables and everything that must stay consistent with them: the
/// port/CEP bitmaps, the uid counter, the sorted put-queue and the
/// removal queue.
pub(crate) struct FlowTables {
    pub by_port: HashMap<u16, Arc<FlowEntry>>,
    pub by_cep: HashMap<u16, Arc<FlowEntry>>,
    pub port_ids: Bitmap,
    pub cep_ids: Bitmap,
    pub uid_cnt: u32,
    /// Sorted by expiry, ascending.
    pub putq: Vec<Arc<FlowEntry>>,
    pub removeq: Vec<Arc<FlowEntry>>,
    pub putq_tmr_gen: u64,
    pub putq_tmr_deadline: Option<Instant>,
}

pub(crate) struct IpcpTable {
    pub by_id: HashMap<u16, Arc<IpcpEntry>>,
    pub ids: Bitmap,
}

/// All the stack objects of one namespace: IPCPs, DIFs, flows, registered
/// applications, control devices, id bitmaps and deferred-work queues.
pub struct DataModel {
    pub(crate) me: Weak<DataModel>,
    pub(crate) ns: String,
    pub(crate) flows: RwLock<FlowTables>,
    pub(crate) ipcps: Mutex<IpcpTable>,
    pub(crate) difs: Mutex<Vec<Arc<Dif>>>,
    pub(crate) general: Mutex<Vec<Weak<CtrlDevice>>>,
    pub(crate) next_dev_id: AtomicCell<u32>,
    pub(crate) appl_removeq: Mutex<Vec<Arc<RegisteredAppl>>>,
    refcnt: AtomicCell<i32>,
}

impl DataModel {
    /// The namespace key this data model belongs to.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub(crate) fn arc(&self) -> Arc<DataModel> {
        self.me.upgrade().expect("data model is always arc-backed")
    }

    pub(crate) fn register_ctrl(&self, dev: &Arc<CtrlDevice>) {
        let mut devs = self.general.lock().unwrap();
        devs.push(Arc::downgrade(dev));
    }

    pub(crate) fn unregister_ctrl(&self, dev_id: u32) {
        let mut devs = self.general.lock().unwrap();
        devs.retain(|w| match w.upgrade() {
            Some(dev) => dev.dev_id != dev_id,
            None => false,
        });
    }

    /// Resolves a per-DM control device id, for `ApplMove`.
    pub(crate) fn ctrl_by_dev_id(&self, dev_id: u32) -> Option<Arc<CtrlDevice>> {
        let devs = self.general.lock().unwrap();
        devs.iter()
            .filter_map(|w| w.upgrade())
            .find(|dev| dev.dev_id == dev_id)
    }

    /// Quiescence check before teardown.
    fn empty(&self) -> bool {
        let ipcps = self.ipcps.lock().unwrap();
        let flows = self.flows.read().unwrap();
        ipcps.by_id.is_empty()
            && ipcps.ids.is_empty()
            && flows.by_port.is_empty()
            && flows.by_cep.is_empty()
            && flows.port_ids.is_empty()
            && flows.cep_ids.is_empty()
            && flows.putq.is_empty()
            && flows.removeq.is_empty()
            && self.difs.lock().unwrap().is_empty()
            && self
                .general
                .lock()
                .unwrap()
                .iter()
                .all(|w| w.upgrade().is_none())
            && self.appl_removeq.lock().unwrap().is_empty()
    }
}

/// Process-wide state: the factory list and the namespace map.
pub(crate) struct Global {
    pub factories: Mutex<Vec<Arc<dyn IpcpFactory>>>,
    pub netns: Mutex<HashMap<String, Arc<DataModel>>>,
}

lazy_static! {
    static ref GLOBAL: Global = Global {
        factories: Mutex::new(Vec::new()),
        netns: Mutex::new(HashMap::new()),
    };
}

pub(crate) fn global() -> &'static Global {
    &GLOBAL
}

/// Returns the data model of `ns`, creating it on first use. The caller
/// owns one reference.
pub(crate) fn dm_get(ns: &str) -> Arc<DataModel> {
    let mut netns = global().netns.lock().unwrap();
    if let Some(dm) = netns.get(ns) {
        dm.refcnt.fetch_add(1);
        return dm.clone();
    }

    let dm = Arc::new_cyclic(|me| DataModel {
        me: me.clone(),
        ns: ns.to_string(),
        flows: RwLock::new(FlowTables {
            by_port: HashMap::new(),
            by_cep: HashMap::new(),
            port_ids: Bitmap::new(PORT_ID_BITMAP_SIZE),
            cep_ids: Bitmap::new(CEP_ID_BITMAP_SIZE),
            uid_cnt: 0,
            putq: Vec::new(),
            removeq: Vec::new(),
            putq_tmr_gen: 0,
            putq_tmr_deadline: None,
        }),
        ipcps: Mutex::new(IpcpTable {
            by_id: HashMap::new(),
            ids: Bitmap::new(IPCP_ID_BITMAP_SIZE),
        }),
        difs: Mutex::new(Vec::new()),
        general: Mutex::new(Vec::new()),
        next_dev_id: AtomicCell::new(1),
        appl_removeq: Mutex::new(Vec::new()),
        refcnt: AtomicCell::new(1),
    });
    netns.insert(ns.to_string(), dm.clone());
    log::debug!("Data model created for namespace {}", ns);
    dm
}

/// Takes an extra reference on an already-held data model.
pub(crate) fn dm_getref(dm: &Arc<DataModel>) -> Arc<DataModel> {
    dm.refcnt.fetch_add(1);
    dm.clone()
}

/// Drops one reference; the zero transition unpublishes the namespace and
/// verifies quiescence.
pub(crate) fn dm_put(dm: &Arc<DataModel>) {
    {
        let mut netns = global().netns.lock().unwrap();
        let r = dm.refcnt.fetch_sub(1) - 1;
        debug_assert!(r >= 0);
        if r > 0 {
            return;
        }
        netns.remove(&dm.ns);
    }

    // Cancel the put-queue timer.
    {
        let mut tables = dm.flows.write().unwrap();
        tables.putq_tmr_gen += 1;
        tables.putq_tmr_deadline = None;
    }

    if !dm.empty() {
        // Internal inconsistency: some table kept an object past the last
        // reference. Report, don't crash.
        log::error!("Data model for namespace {} is not empty at teardown", dm.ns);
    }
    log::debug!("Data model for namespace {} destroyed", dm.ns);
}
