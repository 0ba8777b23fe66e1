//! Registered application names and their deferred removal.
use crate::ctrl::CtrlDevice;
use crate::dm::DataModel;
use crate::err::{Error, Result};
use crate::ipcp::{ipcp_get_ref, ipcp_put, IpcpEntry};
use async_std::task;
use crossbeam::atomic::AtomicCell;
use ctlmsg::{serialize, Body, Msg};
use std::sync::{Arc, Mutex, Weak};

/// Registration waiting for uipcp confirmation.
pub const APPL_REG_PENDING: u8 = 0x1;
/// Registration completed.
pub const APPL_REG_COMPLETE: u8 = 0x2;

/// The control device an application registered through.
pub(crate) struct DevRef {
    pub dev_id: u32,
    pub dev: Weak<CtrlDevice>,
}

/// One application name registered within an IPCP.
pub struct RegisteredAppl {
    /// Name of the registered application.
    pub name: String,
    /// Event id of the registration request, needed when the IPCP is
    /// partially implemented in user space.
    pub event_id: u32,
    pub(crate) rc: Mutex<DevRef>,
    pub(crate) ipcp: Arc<IpcpEntry>,
    pub(crate) state: AtomicCell<u8>,
    pub(crate) refcnt: AtomicCell<i32>,
}

impl RegisteredAppl {
    /// Registration is complete, or still pending on the uipcp.
    pub fn pending(&self) -> bool {
        self.state.load() != APPL_REG_COMPLETE
    }

    pub(crate) fn device(&self) -> Option<Arc<CtrlDevice>> {
        self.rc.lock().unwrap().dev.upgrade()
    }
}

/// To be called with the registered-applications lock held.
fn __application_get(
    regapps: &[Arc<RegisteredAppl>],
    appl_name: &str,
) -> Option<Arc<RegisteredAppl>> {
    let app = regapps.iter().find(|a| a.name == appl_name)?;
    app.refcnt.fetch_add(1);
    Some(app.clone())
}

/// Looks a registration up by name, taking a reference.
pub(crate) fn ipcp_application_get(
    ipcp: &Arc<IpcpEntry>,
    appl_name: &str,
) -> Option<Arc<RegisteredAppl>> {
    let regapps = ipcp.regapps.lock().unwrap();
    __application_get(&regapps, appl_name)
}

/// Final teardown. Takes the per-IPCP mutex, so it must run outside any
/// receive-path context; the deferred worker provides that.
fn appl_del(app: &Arc<RegisteredAppl>) {
    let ipcp = &app.ipcp;

    if let Ok(ops) = ipcp.ops() {
        if ops.handles_appl_register() {
            let _mtx = ipcp.mtx.lock().unwrap();
            ops.appl_register(ipcp, &app.name, false).ok();
        }
    }

    ipcp_put(ipcp);
}

async fn appl_removew(dm: Arc<DataModel>) {
    let removeq: Vec<Arc<RegisteredAppl>> = {
        let mut q = dm.appl_removeq.lock().unwrap();
        q.drain(..).collect()
    };
    for app in removeq {
        appl_del(&app);
    }
}

/// Drops one reference; the zero transition detaches the registration and
/// defers the teardown if it needs the per-IPCP mutex.
pub(crate) fn ipcp_application_put(app: &Arc<RegisteredAppl>) {
    let ipcp = &app.ipcp;

    {
        let mut regapps = ipcp.regapps.lock().unwrap();
        let r = app.refcnt.fetch_sub(1) - 1;
        debug_assert!(r >= 0);
        if r > 0 {
            return;
        }
        regapps.retain(|a| !Arc::ptr_eq(a, app));
    }

    let handles = ipcp
        .ops()
        .map(|ops| ops.handles_appl_register())
        .unwrap_or(false);
    if handles {
        // Cleanup takes the per-IPCP mutex: defer to process context.
        let dm = ipcp.dm.clone();
        dm.appl_removeq.lock().unwrap().push(app.clone());
        task::spawn(appl_removew(dm));
    } else {
        appl_del(app);
    }
}

/// Registers `appl_name` on `ipcp` for the control device `rc`.
///
/// `Ok(true)` means the name was already registered by the same device,
/// a harmless no-op. A name held by another device reports `Busy`.
pub(crate) fn ipcp_application_add(
    ipcp: &Arc<IpcpEntry>,
    appl_name: &str,
    rc: &Arc<CtrlDevice>,
    event_id: u32,
    uipcp: bool,
) -> Result<bool> {
    let newapp = {
        let mut regapps = ipcp.regapps.lock().unwrap();
        if let Some(app) = __application_get(&regapps, appl_name) {
            let same = app.rc.lock().unwrap().dev_id == rc.dev_id;
            drop(regapps);
            ipcp_application_put(&app);
            if same {
                // Registration was already asked on this control device.
                return Ok(true);
            }
            // Already registered on a different control device.
            return Err(Error::Busy);
        }

        let newapp = Arc::new(RegisteredAppl {
            name: appl_name.to_string(),
            event_id,
            rc: Mutex::new(DevRef {
                dev_id: rc.dev_id,
                dev: Arc::downgrade(rc),
            }),
            ipcp: ipcp.clone(),
            state: AtomicCell::new(if uipcp { APPL_REG_PENDING } else { APPL_REG_COMPLETE }),
            refcnt: AtomicCell::new(1),
        });
        regapps.push(newapp.clone());
        newapp
    };

    {
        let _table = ipcp.dm.ipcps.lock().unwrap();
        ipcp_get_ref(ipcp);
    }

    if let Ok(ops) = ipcp.ops() {
        if ops.handles_appl_register() {
            let ret = {
                let _mtx = ipcp.mtx.lock().unwrap();
                ops.appl_register(ipcp, appl_name, true)
            };
            if let Err(e) = ret {
                ipcp_application_put(&newapp);
                return Err(e);
            }
        }
    }

    Ok(false)
}

/// Unregisters `appl_name` from `ipcp`.
pub(crate) fn ipcp_application_del(ipcp: &Arc<IpcpEntry>, appl_name: &str) -> Result<()> {
    let app = ipcp_application_get(ipcp, appl_name).ok_or(Error::InvalidArg)?;
    ipcp_application_put(&app); // match ipcp_application_get()
    ipcp_application_put(&app); // remove the application
    Ok(())
}

/// To be called with the registered-applications lock held. Moves the
/// registration reference to `out` when this is the last one, otherwise
/// just drops the caller's claim.
fn application_steal(
    regapps: &mut Vec<Arc<RegisteredAppl>>,
    app: &Arc<RegisteredAppl>,
    out: &mut Vec<Arc<RegisteredAppl>>,
) {
    if app.refcnt.load() == 1 {
        regapps.retain(|a| !Arc::ptr_eq(a, app));
        out.push(app.clone());
    } else {
        app.refcnt.fetch_sub(1);
    }
}

/// Steals every registration of `ipcp`, for zombie teardown.
pub(crate) fn applications_steal_all(ipcp: &Arc<IpcpEntry>) -> Vec<Arc<RegisteredAppl>> {
    let mut out = Vec::new();
    let mut regapps = ipcp.regapps.lock().unwrap();
    for app in regapps.clone() {
        application_steal(&mut regapps, &app, &mut out);
    }
    out
}

/// Invalidates every registration made through the control device
/// `dev_id`, and detaches that device from any IPCP it served as uipcp.
/// Runs at device release.
pub(crate) fn application_del_by_rc(dm: &Arc<DataModel>, dev_id: u32) {
    let mut remove_apps = Vec::new();

    {
        let table = dm.ipcps.lock().unwrap();
        for ipcp in table.by_id.values() {
            {
                let mut regapps = ipcp.regapps.lock().unwrap();
                for app in regapps.clone() {
                    if app.rc.lock().unwrap().dev_id == dev_id {
                        application_steal(&mut regapps, &app, &mut remove_apps);
                    }
                }
            }

            let mut mtx = ipcp.mtx.lock().unwrap();
            if mtx.uipcp.as_ref().map(|u| u.dev_id) == Some(dev_id) {
                mtx.uipcp = None;
                log::info!("IPC process {} detached from uipcp {}", ipcp.name, dev_id);
            }
        }
    }

    for app in remove_apps {
        log::debug!("Application {} will be automatically unregistered", app.name);

        // Let the userspace IPCP know, unless registration never
        // completed or is handled in the kernel.
        let handles = app
            .ipcp
            .ops()
            .map(|ops| ops.handles_appl_register())
            .unwrap_or(false);
        if app.state.load() == APPL_REG_COMPLETE && !handles {
            if let Some(uipcp) = app.ipcp.uipcp() {
                let ntfy = Msg::event(Body::ApplRegister {
                    dif_name: app.ipcp.dif.name.clone(),
                    reg: false,
                    appl_name: app.name.clone(),
                });
                task::spawn(async move {
                    uipcp.upqueue.append(serialize(&ntfy)).await.ok();
                });
            }
        }

        ipcp_application_put(&app);
    }
}
