//! The control device: the serialized request/response channel between
//! user space and the stack core.
//!
//! Each `write` carries exactly one message, deserialized into a bounded
//! staging area and dispatched to the handler for its type. Responses and
//! asynchronous events come back through the per-device upqueue, one
//! message per `read`.
use crate::appl::{application_del_by_rc, ipcp_application_add, ipcp_application_del,
                  ipcp_application_get, ipcp_application_put, APPL_REG_COMPLETE};
use crate::dm::{dm_get, dm_put, DataModel};
use crate::err::{Error, Result};
use crate::fa;
use crate::flow::{flow_put, flow_shutdown};
use crate::ipcp::{ipcp_pduft_flush, ipcp_put, ipcp_update_fill, UipcpRef, UipcpWait};
use crate::upqueue::Upqueue;
use crossbeam::atomic::AtomicCell;
use ctlmsg::{serialize, Body, Msg, UpdateKind, RESP_ERR, RESP_SUCC};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

/// Subscribe this device to IPCP update broadcasts.
pub const F_IPCPS: u32 = 1 << 0;
const F_ALL: u32 = F_IPCPS;

/// Staging bound for one serialized request.
const MSGBUF_SIZE: usize = 1024;

/// An open control device.
pub struct CtrlDevice {
    pub(crate) me: Weak<CtrlDevice>,
    pub(crate) dm: Arc<DataModel>,
    /// Per-DM device id; the userspace-visible handle for `ApplMove`.
    pub(crate) dev_id: u32,
    admin: bool,
    pub(crate) flags: AtomicCell<u32>,
    pub(crate) upqueue: Upqueue,
    flows_fetch_q: Mutex<VecDeque<Msg>>,
    regs_fetch_q: Mutex<VecDeque<Msg>>,
}

/// Opens a control device in the given namespace. The first open of a
/// namespace creates its data model.
///
/// `admin` grants the administrative capability required by privileged
/// message types.
pub fn ctrl_open(ns: &str, admin: bool) -> Arc<CtrlDevice> {
    let dm = dm_get(ns);
    let dev = Arc::new_cyclic(|me| CtrlDevice {
        me: me.clone(),
        dev_id: dm.next_dev_id.fetch_add(1),
        dm,
        admin,
        flags: AtomicCell::new(0),
        upqueue: Upqueue::new(),
        flows_fetch_q: Mutex::new(VecDeque::new()),
        regs_fetch_q: Mutex::new(VecDeque::new()),
    });
    dev.dm.register_ctrl(&dev);
    dev
}

impl Drop for CtrlDevice {
    fn drop(&mut self) {
        // Last handle gone: the release path. Flows keep the device alive
        // through their strong upper reference, so by now none points
        // here anymore.
        let dm = self.dm.clone();
        dm.unregister_ctrl(self.dev_id);

        // Unregister every application name registered through this
        // device, and detach from any IPCP served as uipcp.
        application_del_by_rc(&dm, self.dev_id);
        dm.flow_rc_probe_references(self.dev_id);

        self.upqueue.drain();
        self.flows_fetch_q.lock().unwrap().clear();
        self.regs_fetch_q.lock().unwrap().clear();

        dm_put(&dm);
    }
}

fn requires_admin(msg_type: u16) -> bool {
    matches!(
        msg_type,
        1 /* IpcpCreate */
        | 3 /* IpcpDestroy */
        | 6 /* IpcpConfig */
        | 7 /* IpcpPduftSet */
        | 9 /* IpcpPduftFlush */
        | 11 /* ApplRegisterResp */
        | 16 /* IpcpUipcpSet */
        | 18 /* UipcpFaReqArrived */
        | 19 /* UipcpFaRespArrived */
        | 20 /* FlowDealloc */
    )
}

impl CtrlDevice {
    /// The data model this device belongs to.
    pub fn dm(&self) -> &Arc<DataModel> {
        &self.dm
    }

    /// The per-DM device id.
    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    pub(crate) fn arc(&self) -> Arc<CtrlDevice> {
        self.me.upgrade().expect("control device is always arc-backed")
    }

    /// Writes one serialized request and runs its handler.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() > MSGBUF_SIZE {
            return Err(Error::InvalidArg);
        }
        let msg = ctlmsg::parse(buf).map_err(|_| Error::InvalidArg)?;

        if requires_admin(msg.body.msg_type()) && !self.admin {
            return Err(Error::Permission);
        }

        self.dispatch(msg).await?;
        Ok(buf.len())
    }

    /// Reads one pending message, waiting for one to arrive.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.upqueue.read(buf).await
    }

    /// Reads one pending message without waiting; `Ok(None)` when idle.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.upqueue.try_read(buf)
    }

    /// Readable when a message is pending. The device is always writable.
    pub fn poll_readable(&self, cx: &mut Context) -> Poll<()> {
        self.upqueue.poll_readable(cx)
    }

    /// The only ioctl: replace the device flags. Turning on the IPCP
    /// subscription replays an `Add` update for every existing IPCP.
    pub fn change_flags(&self, flags: u32) -> Result<()> {
        if flags & !F_ALL != 0 {
            return Err(Error::InvalidArg);
        }
        let changed = flags ^ self.flags.load();
        if changed & flags & F_IPCPS != 0 {
            let table = self.dm.ipcps.lock().unwrap();
            for entry in table.by_id.values() {
                let upd = ipcp_update_fill(entry, UpdateKind::Add);
                self.upqueue.append_nowait(serialize(&upd)).ok();
            }
        }
        self.flags.store(flags);
        Ok(())
    }

    async fn dispatch(&self, msg: Msg) -> Result<()> {
        let event_id = msg.event_id;
        match msg.body {
            Body::IpcpCreate { name, dif_type, dif_name } => {
                self.h_ipcp_create(event_id, &name, &dif_type, &dif_name).await
            }
            Body::IpcpDestroy { ipcp_id } => self.h_ipcp_destroy(ipcp_id),
            Body::IpcpConfig { ipcp_id, name, value } => {
                self.h_ipcp_config(ipcp_id, &name, &value)
            }
            Body::IpcpConfigGetReq { ipcp_id, param_name } => {
                self.h_ipcp_config_get(event_id, ipcp_id, &param_name).await
            }
            Body::IpcpUipcpSet { ipcp_id } => self.h_uipcp_set(ipcp_id),
            Body::IpcpUipcpWait { ipcp_id } => self.h_uipcp_wait(ipcp_id).await,
            Body::IpcpStatsReq { ipcp_id } => self.h_ipcp_stats(event_id, ipcp_id),
            Body::ApplRegister { dif_name, reg, appl_name } => {
                self.h_appl_register(event_id, &dif_name, reg, &appl_name).await
            }
            Body::ApplRegisterResp { ipcp_id, reg, response, appl_name } => {
                self.h_appl_register_resp(ipcp_id, reg, response, &appl_name).await
            }
            Body::ApplMove { ipcp_id, fd } => self.h_appl_move(ipcp_id, fd),
            Body::FaReq {
                dif_name,
                upper_ipcp_id,
                local_appl,
                remote_appl,
                flowspec,
                ..
            } => {
                fa::fa_req(
                    &self.arc(),
                    event_id,
                    &dif_name,
                    upper_ipcp_id,
                    &local_appl,
                    &remote_appl,
                    &flowspec,
                )
                .await
            }
            Body::FaResp { kevent_id, upper_ipcp_id, port_id, response, .. } => {
                fa::fa_resp(&self.arc(), kevent_id, upper_ipcp_id, port_id, response).await
            }
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
                let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
                let ret = fa::fa_req_arrived(
                    &ipcp,
                    kevent_id,
                    remote_port,
                    remote_cep,
                    qos_id,
                    remote_addr,
                    &local_appl,
                    &remote_appl,
                    Some(&flowcfg),
                    Some(&flowspec),
                    true,
                )
                .await;
                ipcp_put(&ipcp);
                ret
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
                let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
                let ret = fa::fa_resp_arrived(
                    &ipcp,
                    local_port,
                    remote_port,
                    remote_cep,
                    qos_id,
                    remote_addr,
                    response,
                    Some(&flowcfg),
                    true,
                )
                .await;
                ipcp_put(&ipcp);
                ret
            }
            Body::FlowDealloc { port_id, uid, .. } => self.h_flow_dealloc(port_id, uid),
            Body::FlowStatsReq { port_id } => self.h_flow_stats(event_id, port_id),
            Body::FlowCfgUpdate { port_id, flowcfg } => self.h_flow_cfg_update(port_id, &flowcfg),
            Body::FlowFetch { ipcp_id } => self.h_flow_fetch(event_id, ipcp_id),
            Body::RegFetch { ipcp_id } => self.h_reg_fetch(event_id, ipcp_id),
            Body::IpcpPduftSet { ipcp_id, dst_addr, local_port } => {
                self.h_pduft_set(ipcp_id, dst_addr, local_port)
            }
            Body::IpcpPduftDel { ipcp_id, dst_addr } => self.h_pduft_del(ipcp_id, dst_addr),
            Body::IpcpPduftFlush { ipcp_id } => self.h_pduft_flush(ipcp_id),
            Body::IpcpQosSupported { ipcp_id, flowspec } => {
                self.h_qos_supported(ipcp_id, &flowspec)
            }
            body @ Body::IpcpSchedWrr { .. } | body @ Body::IpcpSchedPfifo { .. } => {
                self.h_sched_config(&body)
            }
            // Everything else flows kernel to user, not the reverse.
            _ => Err(Error::InvalidArg),
        }
    }

    async fn h_ipcp_create(
        &self,
        event_id: u32,
        name: &str,
        dif_type: &str,
        dif_name: &str,
    ) -> Result<()> {
        let ipcp_id = self.dm.ipcp_add(name, dif_type, dif_name)?;

        let resp = Msg::new(event_id, Body::IpcpCreateResp { ipcp_id });
        if let Err(e) = self.upqueue.append(serialize(&resp)).await {
            self.dm.ipcp_del(ipcp_id).ok();
            return Err(e);
        }

        log::info!("IPC process {} created", ipcp_id);

        self.dm.ipcp_update_all(ipcp_id, UpdateKind::Add).ok();
        Ok(())
    }

    fn h_ipcp_destroy(&self, ipcp_id: u16) -> Result<()> {
        self.dm.ipcp_del(ipcp_id).map_err(|e| {
            log::error!("Failed to remove IPC process {}", ipcp_id);
            e
        })?;

        log::info!("IPC process {} is going to be removed", ipcp_id);

        // Uipcps learn early that they should detach; the final `Del`
        // follows when the last reference drops.
        self.dm.broadcast_ipcp_update(&Msg::event(Body::IpcpUpdate {
            kind: UpdateKind::UipcpDel,
            ipcp_id,
            ipcp_addr: ctlmsg::ADDR_NULL,
            txhdroom: 0,
            rxhdroom: 0,
            tailroom: 0,
            max_sdu_size: 0,
            ipcp_name: String::new(),
            dif_name: String::new(),
            dif_type: String::new(),
        }));
        Ok(())
    }

    fn h_ipcp_config(&self, ipcp_id: u16, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || value.is_empty() {
            return Err(Error::InvalidArg);
        }
        let entry = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let ops = entry.ops();

        let ret = match ops {
            Ok(ops) => {
                let _mtx = entry.mtx.lock().unwrap();
                ops.config(&entry, name, value)
            }
            Err(e) => Err(e),
        };

        let ret = match ret {
            Err(Error::NotImpl) | Err(Error::NotFound) => {
                // Not an IPCP-specific parameter, try the core ones.
                match name {
                    "txhdroom" => parse_cfg::<u16>(value).map(|v| {
                        entry.txhdroom.store(v);
                        false
                    }),
                    "rxhdroom" => parse_cfg::<u16>(value).map(|v| {
                        entry.rxhdroom.store(v);
                        false
                    }),
                    "mss" => parse_cfg::<u32>(value).map(|v| {
                        let changed = entry.max_sdu_size.load() != v;
                        entry.max_sdu_size.store(v);
                        changed
                    }),
                    "flow-del-wait-ms" => parse_cfg::<u32>(value).map(|v| {
                        entry.flow_del_wait_ms.store(v);
                        false
                    }),
                    _ => Err(Error::InvalidArg),
                }
            }
            other => other,
        };

        let ret = ret.map(|notify| {
            log::debug!("Configured IPC process {}: {} <= {}", entry.name, name, value);
            if notify {
                self.dm.ipcp_update_all(ipcp_id, UpdateKind::Upd).ok();
            }
        });

        ipcp_put(&entry);
        ret
    }

    async fn h_ipcp_config_get(
        &self,
        event_id: u32,
        ipcp_id: u16,
        param_name: &str,
    ) -> Result<()> {
        if param_name.is_empty() {
            return Err(Error::InvalidArg);
        }
        let entry = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;

        let ret = match entry.ops() {
            Ok(ops) => {
                let _mtx = entry.mtx.lock().unwrap();
                ops.config_get(&entry, param_name)
            }
            Err(e) => Err(e),
        };

        let ret = match ret {
            Err(Error::NotImpl) | Err(Error::NotFound) => match param_name {
                "txhdroom" => Ok(entry.txhdroom.load().to_string()),
                "rxhdroom" => Ok(entry.rxhdroom.load().to_string()),
                "mss" => Ok(entry.max_sdu_size.load().to_string()),
                "flow-del-wait-ms" => Ok(entry.flow_del_wait_ms.load().to_string()),
                _ => Err(Error::InvalidArg),
            },
            other => other,
        };

        let ret = match ret {
            Ok(param_value) => {
                let resp = Msg::new(event_id, Body::IpcpConfigGetResp { param_value });
                self.upqueue.append(serialize(&resp)).await
            }
            Err(e) => Err(e),
        };

        ipcp_put(&entry);
        ret
    }

    fn h_uipcp_set(&self, ipcp_id: u16) -> Result<()> {
        let entry = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;

        let ret = {
            let mut mtx = entry.mtx.lock().unwrap();
            let attached = mtx
                .uipcp
                .as_ref()
                .map(|u| u.dev.upgrade().is_some())
                .unwrap_or(false);
            if attached {
                Err(Error::Busy)
            } else {
                mtx.uipcp = Some(UipcpRef {
                    dev_id: self.dev_id,
                    dev: self.me.clone(),
                });
                Ok(())
            }
        };

        if ret.is_ok() {
            log::info!("IPC process {} attached to uipcp {}", entry.name, self.dev_id);
            for w in entry.uipcp_wakers.lock().unwrap().drain(..) {
                w.wake();
            }
        }
        ipcp_put(&entry);
        ret
    }

    async fn h_uipcp_wait(&self, ipcp_id: u16) -> Result<()> {
        let entry = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        UipcpWait { entry: entry.clone() }.await;
        ipcp_put(&entry);
        Ok(())
    }

    fn h_ipcp_stats(&self, event_id: u32, ipcp_id: u16) -> Result<()> {
        let entry = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let resp = Msg::new(event_id, Body::IpcpStatsResp {
            stats: entry.stats.snapshot(),
        });
        let ret = self.upqueue.append_nowait(serialize(&resp));
        ipcp_put(&entry);
        ret
    }

    async fn h_appl_register(
        &self,
        event_id: u32,
        dif_name: &str,
        reg: bool,
        appl_name: &str,
    ) -> Result<()> {
        let ipcp = self.dm.ipcp_select_by_dif(dif_name).ok_or(Error::NotFound)?;
        let ops = match ipcp.ops() {
            Ok(ops) => ops,
            Err(e) => {
                ipcp_put(&ipcp);
                return Err(e);
            }
        };

        // When the IPCP can register in the kernel, that path wins;
        // otherwise a uipcp must be attached.
        let mut uipcp = None;
        if !ops.handles_appl_register() {
            uipcp = ipcp.uipcp();
            if uipcp.is_none() {
                ipcp_put(&ipcp);
                return Err(Error::NotFound);
            }
        }

        let ret = if reg {
            ipcp_application_add(&ipcp, appl_name, &self.arc(), event_id, uipcp.is_some())
        } else {
            ipcp_application_del(&ipcp, appl_name).map(|_| false)
        };

        if ret.is_ok() {
            if let Some(uipcp) = uipcp.as_ref() {
                // Reflect the (un)registration so that the userspace IPCP
                // can take appropriate actions.
                let refl = Msg::event(Body::ApplRegister {
                    dif_name: dif_name.to_string(),
                    reg,
                    appl_name: appl_name.to_string(),
                });
                uipcp.upqueue.append(serialize(&refl)).await.ok();
            }
        }

        if ret.is_err() || uipcp.is_none() || !reg {
            // Complete the (un)registration right away.
            let resp = Msg::new(event_id, Body::ApplRegisterResp {
                ipcp_id: ipcp.id,
                reg,
                response: if ret.is_err() { RESP_ERR } else { RESP_SUCC },
                appl_name: appl_name.to_string(),
            });
            self.upqueue.append_nowait(serialize(&resp)).ok();

            if ret.is_ok() {
                log::info!(
                    "Application process {} {}registered to IPC process {}",
                    appl_name,
                    if reg { "" } else { "un" },
                    ipcp.name
                );
            }
        }

        ipcp_put(&ipcp);
        // A negative response was already queued; the write itself is
        // considered carried out.
        Ok(())
    }

    async fn h_appl_register_resp(
        &self,
        ipcp_id: u16,
        reg: bool,
        response: u8,
        appl_name: &str,
    ) -> Result<()> {
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;

        let handles = ipcp
            .ops()
            .map(|ops| ops.handles_appl_register())
            .unwrap_or(false);
        let ret = if (!handles && ipcp.uipcp().is_none()) || !reg {
            log::error!(
                "Spurious application register response to IPCP {}",
                ipcp_id
            );
            Err(Error::InvalidArg)
        } else {
            match ipcp_application_get(&ipcp, appl_name) {
                None => {
                    log::error!(
                        "Application register response does not match registration for '{}'",
                        appl_name
                    );
                    Err(Error::InvalidArg)
                }
                Some(app) => {
                    let fwd = Msg::new(app.event_id, Body::ApplRegisterResp {
                        ipcp_id,
                        reg,
                        response,
                        appl_name: appl_name.to_string(),
                    });

                    if response != RESP_SUCC {
                        // Userspace IPCP denied the registration.
                        ipcp_application_put(&app);
                    } else {
                        app.state.store(APPL_REG_COMPLETE);
                        log::info!(
                            "Application process {} registered to IPC process {}",
                            appl_name,
                            ipcp.name
                        );
                    }

                    if let Some(dev) = app.device() {
                        dev.upqueue.append(serialize(&fwd)).await.ok();
                    }
                    ipcp_application_put(&app);
                    Ok(())
                }
            }
        };

        ipcp_put(&ipcp);
        ret
    }

    fn h_appl_move(&self, ipcp_id: u16, fd: u32) -> Result<()> {
        let dst = self.dm.ctrl_by_dev_id(fd).ok_or(Error::BadFd)?;
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::NotFound)?;

        {
            let regapps = ipcp.regapps.lock().unwrap();
            for app in regapps.iter() {
                let mut rc = app.rc.lock().unwrap();
                if rc.dev_id == self.dev_id {
                    // Move the reference.
                    rc.dev_id = dst.dev_id;
                    rc.dev = Arc::downgrade(&dst);
                }
            }
        }

        ipcp_put(&ipcp);
        Ok(())
    }

    fn h_flow_dealloc(&self, port_id: u16, uid: u32) -> Result<()> {
        // Match on the uid as well: the flow may have died and another
        // one may already occupy the same port id.
        let flow = self.dm.flow_get(port_id).ok_or(Error::NotFound)?;
        let ret = if flow.uid.load() != uid
            || flow.flags() & crate::flow::FLOW_DEALLOCATED != 0
        {
            Err(Error::NotFound)
        } else {
            flow_shutdown(&flow);
            Ok(())
        };
        flow_put(&flow);
        ret
    }

    fn h_flow_stats(&self, event_id: u32, port_id: u16) -> Result<()> {
        let flow = self.dm.flow_get(port_id).ok_or(Error::InvalidArg)?;
        let dtp = flow.dtp.lock().unwrap().snapshot();
        let resp = Msg::new(event_id, Body::FlowStatsResp {
            stats: flow.stats.snapshot(),
            dtp,
        });
        flow_put(&flow);
        self.upqueue.append_nowait(serialize(&resp))
    }

    fn h_flow_cfg_update(&self, port_id: u16, flowcfg: &ctlmsg::FlowConfig) -> Result<()> {
        let flow = self.dm.flow_get(port_id).ok_or(Error::InvalidArg)?;
        let ret = match flow.ipcp().ops() {
            Ok(ops) => ops.flow_cfg_update(&flow, flowcfg),
            Err(e) => Err(e),
        };
        flow_put(&flow);
        ret
    }

    fn h_flow_fetch(&self, event_id: u32, ipcp_id: u16) -> Result<()> {
        if ipcp_id != ctlmsg::IPCP_ID_NONE {
            let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
            ipcp_put(&ipcp);
        }

        let mut q = self.flows_fetch_q.lock().unwrap();
        if q.is_empty() {
            let tables = self.dm.flows.read().unwrap();
            for flow in tables.by_port.values() {
                if ipcp_id != ctlmsg::IPCP_ID_NONE && flow.ipcp().id != ipcp_id {
                    // The user asked only for flows of a specific IPCP.
                    continue;
                }
                let st = flow.state.lock().unwrap();
                q.push_back(Msg::event(Body::FlowFetchResp {
                    end: false,
                    ipcp_id: flow.ipcp().id,
                    local_port: flow.local_port,
                    remote_port: st.remote_port,
                    local_addr: flow.ipcp().addr.load(),
                    remote_addr: st.remote_addr,
                    spec: flow.spec.clone(),
                    flow_control: st.cfg.dtcp.flow_control,
                }));
            }
            q.push_back(Msg::event(Body::FlowFetchResp {
                end: true,
                ipcp_id: 0,
                local_port: 0,
                remote_port: 0,
                local_addr: 0,
                remote_addr: 0,
                spec: Default::default(),
                flow_control: false,
            }));
        }

        let mut resp = q.pop_front().unwrap();
        resp.event_id = event_id;
        self.upqueue.append_nowait(serialize(&resp))
    }

    fn h_reg_fetch(&self, event_id: u32, ipcp_id: u16) -> Result<()> {
        if ipcp_id != ctlmsg::IPCP_ID_NONE {
            let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
            ipcp_put(&ipcp);
        }

        let mut q = self.regs_fetch_q.lock().unwrap();
        if q.is_empty() {
            let table = self.dm.ipcps.lock().unwrap();
            for ipcp in table.by_id.values() {
                if ipcp_id != ctlmsg::IPCP_ID_NONE && ipcp.id != ipcp_id {
                    continue;
                }
                let regapps = ipcp.regapps.lock().unwrap();
                for appl in regapps.iter() {
                    q.push_back(Msg::event(Body::RegFetchResp {
                        end: false,
                        ipcp_id: ipcp.id,
                        pending: appl.pending(),
                        appl_name: appl.name.clone(),
                    }));
                }
            }
            q.push_back(Msg::event(Body::RegFetchResp {
                end: true,
                ipcp_id: 0,
                pending: false,
                appl_name: String::new(),
            }));
        }

        let mut resp = q.pop_front().unwrap();
        resp.event_id = event_id;
        self.upqueue.append_nowait(serialize(&resp))
    }

    fn h_pduft_set(&self, ipcp_id: u16, dst_addr: u64, local_port: u16) -> Result<()> {
        let flow = self.dm.flow_get(local_port);
        let ipcp = self.dm.ipcp_get(ipcp_id);

        // Only the IPCP actually using the flow may point the forwarding
        // table at it: then the IPCP outlives the flow and the internal
        // table lock is enough. Zombies are refused, their table is never
        // flushed again and the entries would pin flows forever.
        let ret = match (&ipcp, &flow) {
            (Some(ipcp), Some(flow)) => {
                let bound = flow
                    .upper_ipcp()
                    .map(|up| Arc::ptr_eq(&up, ipcp))
                    .unwrap_or(false);
                match ipcp.ops() {
                    Ok(ops) if bound && ops.has_pduft() && !ipcp.is_zombie() => {
                        let _mtx = ipcp.mtx.lock().unwrap();
                        ops.pduft_set(ipcp, dst_addr, flow)
                    }
                    _ => Err(Error::InvalidArg),
                }
            }
            _ => Err(Error::InvalidArg),
        };

        if ret.is_ok() {
            log::debug!(
                "Set IPC process {} PDUFT entry: {} --> {}",
                ipcp_id,
                dst_addr,
                local_port
            );
        }

        if let Some(flow) = flow {
            flow_put(&flow);
        }
        if let Some(ipcp) = ipcp {
            ipcp_put(&ipcp);
        }
        ret
    }

    fn h_pduft_del(&self, ipcp_id: u16, dst_addr: u64) -> Result<()> {
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let ret = match ipcp.ops() {
            Ok(ops) if ops.has_pduft() && !ipcp.is_zombie() => {
                let _mtx = ipcp.mtx.lock().unwrap();
                ops.pduft_del_addr(&ipcp, dst_addr)
            }
            Ok(_) => Err(Error::InvalidArg),
            Err(e) => Err(e),
        };
        ipcp_put(&ipcp);
        ret
    }

    fn h_pduft_flush(&self, ipcp_id: u16) -> Result<()> {
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let ret = ipcp_pduft_flush(&ipcp);
        if ret.is_ok() {
            log::debug!("Flushed PDUFT for IPC process {}", ipcp.name);
        }
        ipcp_put(&ipcp);
        ret
    }

    fn h_qos_supported(&self, ipcp_id: u16, flowspec: &ctlmsg::FlowSpec) -> Result<()> {
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let ret = match ipcp.ops() {
            Ok(ops) => match ops.qos_supported(&ipcp, flowspec) {
                Err(Error::NotImpl) => {
                    // The IPCP cannot validate QoS: only best effort.
                    if flowspec.is_best_effort() {
                        Ok(())
                    } else {
                        Err(Error::NotImpl)
                    }
                }
                other => other,
            },
            Err(e) => Err(e),
        };
        ipcp_put(&ipcp);
        ret
    }

    fn h_sched_config(&self, body: &Body) -> Result<()> {
        let ipcp_id = match body {
            Body::IpcpSchedWrr { ipcp_id, .. } => *ipcp_id,
            Body::IpcpSchedPfifo { ipcp_id, .. } => *ipcp_id,
            _ => return Err(Error::InvalidArg),
        };
        let ipcp = self.dm.ipcp_get(ipcp_id).ok_or(Error::InvalidArg)?;
        let ret = match ipcp.ops() {
            Ok(ops) => {
                let _mtx = ipcp.mtx.lock().unwrap();
                ops.sched_config(&ipcp, body)
            }
            Err(e) => Err(e),
        };
        ipcp_put(&ipcp);
        ret
    }
}

fn parse_cfg<T: std::str::FromStr>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| Error::InvalidArg)
}
