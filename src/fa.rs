//! The four-step flow allocation handshake.
//!
//! Kernel-handled IPCPs (shims) run both ends of the handshake here;
//! normal IPCPs reflect the messages to their attached user-space IPCP,
//! which later injects the results back through the control device.
use crate::ctrl::CtrlDevice;
use crate::err::{Error, Result};
use crate::flow::{
    flow_get_ref, flow_make_mortal, flow_put, flow_shutdown, flows_putq_del, FlowEntry, Upper,
    FLOW_ALLOCATED, FLOW_INITIATOR, FLOW_PENDING, FLOW_UPPER_BOUND,
};
use crate::ipcp::{ipcp_put, IpcpEntry};
use ctlmsg::{serialize, Body, FlowConfig, FlowSpec, Msg};
use std::sync::Arc;

pub(crate) async fn append_fa_resp_arrived(
    rc: &CtrlDevice,
    event_id: u32,
    port_id: u16,
    response: u8,
    maysleep: bool,
) -> Result<()> {
    let resp = Msg::new(event_id, Body::FaRespArrived { port_id, response });
    if maysleep {
        rc.upqueue.append(serialize(&resp)).await
    } else {
        rc.upqueue.append_nowait(serialize(&resp))
    }
}

/// Connects the upper IPCP which is using this flow, so that received
/// SDUs can be delivered straight into it. The binding holds one flow
/// reference, released at shutdown.
pub(crate) fn upper_ipcp_flow_bind(
    rc: &CtrlDevice,
    upper_ipcp_id: u16,
    flow: &Arc<FlowEntry>,
) -> Result<()> {
    let upper_ipcp = rc.dm().ipcp_get(upper_ipcp_id).ok_or_else(|| {
        log::error!("No such upper ipcp {}", upper_ipcp_id);
        Error::NotFound
    })?;

    {
        let mut st = flow.state.lock().unwrap();
        st.upper.ipcp = Some(upper_ipcp.clone());
        st.flags |= FLOW_UPPER_BOUND;
    }
    flow_get_ref(flow);

    let ipcp = flow.ipcp();
    let mut mtx = ipcp.mtx.lock().unwrap();
    // The shortcut is valid only while one and only one upper IPCP is
    // bound to flows of this IPCP.
    if mtx.shortcut_flows == 0 {
        mtx.shortcut = Some(Arc::downgrade(&upper_ipcp));
    } else {
        let same = mtx
            .shortcut
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|cur| Arc::ptr_eq(&cur, &upper_ipcp))
            .unwrap_or(false);
        if !same {
            mtx.shortcut = None;
        }
    }
    mtx.shortcut_flows += 1;

    Ok(())
}

/// (1): client application --> kernel IPCP.
pub(crate) async fn fa_req(
    rc: &Arc<CtrlDevice>,
    event_id: u32,
    dif_name: &str,
    upper_ipcp_id: u16,
    local_appl: &str,
    remote_appl: &str,
    flowspec: &FlowSpec,
) -> Result<()> {
    let dm = rc.dm();

    let ret = async {
        let ipcp = dm.ipcp_select_by_dif(dif_name).ok_or(Error::NotFound)?;

        let flow = match dm.flow_add(
            &ipcp,
            Upper::rc(rc.clone()),
            event_id,
            local_appl,
            remote_appl,
            None,
            flowspec,
        ) {
            Ok(flow) => flow,
            Err(e) => {
                ipcp_put(&ipcp);
                return Err(e);
            }
        };

        // We are the initiator for this flow.
        flow.state.lock().unwrap().flags |= FLOW_INITIATOR;
        let local_port = flow.local_port;
        let local_cep = flow.local_cep;
        let uid = flow.uid.load();

        let mut ret = if upper_ipcp_id != ctlmsg::IPCP_ID_NONE {
            upper_ipcp_flow_bind(rc, upper_ipcp_id, &flow)
        } else {
            Ok(())
        };

        if ret.is_ok() {
            ret = match ipcp.ops() {
                Ok(ops) if ops.handles_flow_alloc() => {
                    // Kernel-handled allocation, currently true for shims.
                    ops.flow_allocate_req(&ipcp, &flow).await
                }
                Ok(_) => {
                    if let Some(uipcp) = ipcp.uipcp() {
                        // Reflect the request to the user-space IPCP,
                        // telling it the allocated endpoint and the flow
                        // uid.
                        let req = Msg::event(Body::FaReq {
                            dif_name: dif_name.to_string(),
                            upper_ipcp_id,
                            local_appl: local_appl.to_string(),
                            remote_appl: remote_appl.to_string(),
                            flowspec: flowspec.clone(),
                            local_port,
                            local_cep,
                            uid,
                        });
                        uipcp.upqueue.append(serialize(&req)).await
                    } else {
                        // No userspace IPCP to use.
                        Err(Error::NotFound)
                    }
                }
                Err(e) => Err(e),
            };
        }

        // The flow cannot be touched after this put: a concurrent
        // negative response may kill it.
        flow_put(&flow);

        if ret.is_ok() {
            log::debug!(
                "Flow allocation requested to IPC process {}, port-id {}",
                ipcp.name,
                local_port
            );
        }
        ipcp_put(&ipcp);
        ret
    }
    .await;

    if ret.is_ok() {
        return Ok(());
    }

    // Report the failure asynchronously, like a peer reject would be.
    append_fa_resp_arrived(rc, event_id, 0, 1, true).await
}

/// (3): server application --> kernel IPCP.
pub(crate) async fn fa_resp(
    rc: &Arc<CtrlDevice>,
    kevent_id: u32,
    upper_ipcp_id: u16,
    port_id: u16,
    response: u8,
) -> Result<()> {
    let dm = rc.dm();
    let flow = dm.flow_get(port_id).ok_or_else(|| {
        log::error!("no pending flow corresponding to port-id {}", port_id);
        Error::InvalidArg
    })?;

    let ret = async {
        if kevent_id != flow.state.lock().unwrap().event_id {
            log::error!("kevent_id mismatch for port-id {}", port_id);
            return Err(Error::InvalidArg);
        }

        // Check that the flow is pending and was created through this
        // very control device, then move it to the allocated state.
        {
            let mut st = flow.state.lock().unwrap();
            if st.flags & FLOW_PENDING == 0 {
                log::error!("flow {} is in invalid state {:#x}", port_id, st.flags);
                return Err(Error::InvalidArg);
            }
            let same_dev = st.upper.rc.as_ref().map(|up| up.dev_id) == Some(rc.dev_id);
            if !same_dev {
                return Err(Error::InvalidArg);
            }
            st.flags &= !FLOW_PENDING;
            if response == 0 {
                st.flags |= FLOW_ALLOCATED;
                st.upper.rc = None; // release the device reference
            }
        }

        if response == 0 && upper_ipcp_id != ctlmsg::IPCP_ID_NONE {
            upper_ipcp_flow_bind(rc, upper_ipcp_id, &flow)?;
            flow_make_mortal(&flow);
        }

        log::debug!(
            "Flow allocation response [{}] issued to IPC process {}, port-id {}",
            response,
            flow.ipcp().name,
            port_id
        );

        // Notify the involved IPC process about the response.
        let ipcp = flow.ipcp().clone();
        let ops = ipcp.ops()?;
        if ops.handles_flow_alloc() {
            ops.flow_allocate_resp(&ipcp, &flow, response).await
        } else if let Some(uipcp) = ipcp.uipcp() {
            let refl = Msg::event(Body::FaResp {
                kevent_id,
                ipcp_id: ipcp.id,
                upper_ipcp_id,
                port_id,
                response,
                cep_id: flow.local_cep,
            });
            uipcp.upqueue.append(serialize(&refl)).await
        } else {
            Err(Error::NotFound)
        }
    }
    .await;

    if ret.is_err() || response != 0 {
        if flow.flags() & FLOW_UPPER_BOUND != 0 {
            flow_shutdown(&flow);
        }
        flows_putq_del(dm, &flow);
        flow_put(&flow);
    }

    flow_put(&flow); // match flow_get()

    ret
}

/// (2): server application <-- kernel IPCP. May run in receive context,
/// in which case `maysleep` must be false.
pub async fn fa_req_arrived(
    ipcp: &Arc<IpcpEntry>,
    kevent_id: u32,
    remote_port: u16,
    remote_cep: u16,
    qos_id: u8,
    remote_addr: u64,
    local_appl: &str,
    remote_appl: &str,
    flowcfg: Option<&FlowConfig>,
    flowspec: Option<&FlowSpec>,
    maysleep: bool,
) -> Result<()> {
    let dm = ipcp.dm().clone();

    // See whether the local application is registered to this IPCP.
    let app = crate::appl::ipcp_application_get(ipcp, local_appl).ok_or(Error::InvalidArg)?;

    let ret = async {
        let app_dev = app.device().ok_or(Error::InvalidArg)?;
        let spec = flowspec.cloned().unwrap_or_default();

        let flow = dm.flow_add(
            ipcp,
            Upper::rc(app_dev.clone()),
            kevent_id,
            local_appl,
            remote_appl,
            flowcfg,
            &spec,
        )?;

        {
            let mut st = flow.state.lock().unwrap();
            st.remote_port = remote_port;
            st.remote_cep = remote_cep;
            st.qos_id = qos_id;
            st.remote_addr = remote_addr;
        }
        // The uid the uipcp generated wins over the kernel one.
        flow.uid.store(kevent_id);

        log::debug!(
            "Flow allocation request arrived to IPC process {}, port-id {}",
            ipcp.name,
            flow.local_port
        );

        let req = Msg::event(Body::FaReqArrived {
            kevent_id,
            ipcp_id: ipcp.id,
            port_id: flow.local_port,
            local_appl: local_appl.to_string(),
            remote_appl: remote_appl.to_string(),
            dif_name: ipcp.dif.name.clone(),
            flowspec: spec,
        });

        flow_put(&flow); // match flow_add()

        let ret = if maysleep {
            app_dev.upqueue.append(serialize(&req)).await
        } else {
            app_dev.upqueue.append_nowait(serialize(&req))
        };
        if ret.is_err() {
            flows_putq_del(&dm, &flow);
            flow_put(&flow);
        }
        ret
    }
    .await;

    crate::appl::ipcp_application_put(&app);

    ret
}

/// (4): client application <-- kernel IPCP.
pub async fn fa_resp_arrived(
    ipcp: &Arc<IpcpEntry>,
    local_port: u16,
    remote_port: u16,
    remote_cep: u16,
    qos_id: u8,
    remote_addr: u64,
    response: u8,
    flowcfg: Option<&FlowConfig>,
    maysleep: bool,
) -> Result<()> {
    let dm = ipcp.dm().clone();
    let flow = dm.flow_get(local_port).ok_or(Error::InvalidArg)?;

    let rc;
    let event_id;
    {
        let mut st = flow.state.lock().unwrap();
        if st.flags & FLOW_PENDING == 0 {
            drop(st);
            flow_put(&flow);
            return Err(Error::InvalidArg);
        }
        rc = st.upper.rc.clone();
        event_id = st.event_id;
        st.flags &= !FLOW_PENDING;
        if response == 0 {
            st.flags |= FLOW_ALLOCATED;
            st.upper.rc = None;
        }
        st.remote_port = remote_port;
        st.remote_cep = remote_cep;
        st.qos_id = qos_id;
        st.remote_addr = remote_addr;
    }

    if let Some(cfg) = flowcfg {
        flow.set_config(cfg.clone());
        if let Ok(ops) = ipcp.ops() {
            // Let the IPCP do some specific initialization.
            ops.flow_init(ipcp, &flow);
        }
    }

    if response == 0 && flow.flags() & FLOW_UPPER_BOUND != 0 {
        // The initiator bound an upper IPCP at request time; the flow is
        // in service now.
        flow_make_mortal(&flow);
    }

    log::debug!(
        "Flow allocation response arrived to IPC process {}, port-id {}, remote addr {}",
        ipcp.name,
        local_port,
        remote_addr
    );

    let ret = match rc {
        Some(rc) => append_fa_resp_arrived(&rc, event_id, local_port, response, maysleep).await,
        None => Err(Error::InvalidArg),
    };

    if response != 0 || ret.is_err() {
        // Negative response: delete the flow.
        if flow.flags() & FLOW_UPPER_BOUND != 0 {
            flow_shutdown(&flow);
        }
        flows_putq_del(&dm, &flow);
        flow_put(&flow);
    }

    flow_put(&flow); // match flow_get()

    ret
}
