//! The plug-in seam: one factory per DIF type, one operations object per
//! IPCP instance.
//!
//! The operations trait is the vtable an IPCP implementation provides.
//! Optional capabilities default to `NotImpl`; the capability predicates
//! drive the split of responsibilities between kernel-handled shims and
//! normal IPCPs that reflect work to their uipcp.
use crate::err::{Error, Result};
use crate::flow::FlowEntry;
use crate::ipcp::IpcpEntry;
use async_trait::async_trait;
use bytes::BytesMut;
use ctlmsg::{Body, FlowConfig, FlowSpec};
use std::sync::Arc;

/// Routing selector for a management SDU.
#[derive(Clone, Copy, Debug)]
pub enum MgmtRoute {
    /// Route by destination address through the PDUFT.
    DstAddr(u64),
    /// Send on an explicit local lower flow, no routing.
    LocalPort(u16),
}

/// Per-instance operations of an IPCP.
///
/// The object also carries the DIF-type private state; dropping it is the
/// destructor and happens exactly once, when the owning IPCP's reference
/// count reaches zero.
#[async_trait]
pub trait IpcpOps: Send + Sync {
    /// Transmit one SDU on a flow supported by this IPCP.
    async fn sdu_write(
        &self,
        ipcp: &Arc<IpcpEntry>,
        flow: &Arc<FlowEntry>,
        sdu: BytesMut,
    ) -> Result<usize>;

    /// Receive one PDU addressed to this IPCP from a lower flow.
    async fn sdu_rx(&self, _ipcp: &Arc<IpcpEntry>, _pdu: BytesMut) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Transmit one management SDU.
    async fn mgmt_sdu_write(
        &self,
        _ipcp: &Arc<IpcpEntry>,
        _route: MgmtRoute,
        _sdu: BytesMut,
    ) -> Result<usize> {
        Err(Error::NotImpl)
    }

    /// Flow-specific initialization once a configuration is known.
    fn flow_init(&self, _ipcp: &Arc<IpcpEntry>, _flow: &Arc<FlowEntry>) {}

    /// Kernel-handled side of the flow allocation request.
    async fn flow_allocate_req(
        &self,
        _ipcp: &Arc<IpcpEntry>,
        _flow: &Arc<FlowEntry>,
    ) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Kernel-handled side of the flow allocation response.
    async fn flow_allocate_resp(
        &self,
        _ipcp: &Arc<IpcpEntry>,
        _flow: &Arc<FlowEntry>,
        _response: u8,
    ) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Flow teardown notification for kernel-handled IPCPs.
    fn flow_deallocated(&self, _ipcp: &Arc<IpcpEntry>, _flow: &FlowEntry) {}

    /// Apply a configuration update to a live flow.
    fn flow_cfg_update(&self, _flow: &Arc<FlowEntry>, _cfg: &FlowConfig) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// In-kernel application (un)registration. Called under the per-IPCP
    /// mutex.
    fn appl_register(&self, _ipcp: &Arc<IpcpEntry>, _appl_name: &str, _reg: bool) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Set an IPCP-specific parameter. Returns whether subscribers must be
    /// notified. `NotImpl` falls back to the core parameters.
    fn config(&self, _ipcp: &Arc<IpcpEntry>, _name: &str, _value: &str) -> Result<bool> {
        Err(Error::NotImpl)
    }

    /// Read an IPCP-specific parameter. `NotImpl` falls back to the core
    /// parameters.
    fn config_get(&self, _ipcp: &Arc<IpcpEntry>, _name: &str) -> Result<String> {
        Err(Error::NotImpl)
    }

    /// Validate a flow specification. `NotImpl` means only best effort.
    fn qos_supported(&self, _ipcp: &Arc<IpcpEntry>, _spec: &FlowSpec) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Install a forwarding entry.
    fn pduft_set(&self, _ipcp: &Arc<IpcpEntry>, _dst_addr: u64, _flow: &Arc<FlowEntry>) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Remove the forwarding entry for an address.
    fn pduft_del_addr(&self, _ipcp: &Arc<IpcpEntry>, _dst_addr: u64) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Clear the forwarding table.
    fn pduft_flush(&self, _ipcp: &Arc<IpcpEntry>) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// Remove every forwarding entry pointing at `flow`.
    fn pduft_flush_by_flow(&self, _ipcp: &Arc<IpcpEntry>, _flow: &FlowEntry) {}

    /// Configure the transmit scheduler.
    fn sched_config(&self, _ipcp: &Arc<IpcpEntry>, _msg: &Body) -> Result<()> {
        Err(Error::NotImpl)
    }

    /// The flow allocation handshake is handled here, not by a uipcp.
    fn handles_flow_alloc(&self) -> bool {
        false
    }

    /// Application registration is handled here, not by a uipcp.
    fn handles_appl_register(&self) -> bool {
        false
    }

    /// Flow deallocation is consumed here; otherwise the uipcp is notified.
    fn handles_flow_dealloc(&self) -> bool {
        false
    }

    /// This IPCP forwards through a PDUFT.
    fn has_pduft(&self) -> bool {
        false
    }
}

/// Constructor of IPCPs of one DIF type.
pub trait IpcpFactory: Send + Sync {
    /// The DIF type this factory implements.
    fn dif_type(&self) -> &str;

    /// Flows of this DIF type carry connection endpoint ids.
    fn use_cep_ids(&self) -> bool {
        false
    }

    /// Builds the private state and operations of a new IPCP.
    fn create(&self, ipcp: &Arc<IpcpEntry>) -> Result<Arc<dyn IpcpOps>>;
}

/// Registers a factory process-wide. `Busy` if the DIF type is taken.
pub fn ipcp_factory_register(factory: Arc<dyn IpcpFactory>) -> Result<()> {
    let global = crate::dm::global();
    let mut factories = global.factories.lock().unwrap();
    if factories.iter().any(|f| f.dif_type() == factory.dif_type()) {
        return Err(Error::Busy);
    }
    log::info!("IPC processes factory '{}' registered", factory.dif_type());
    factories.push(factory);
    Ok(())
}

/// Unregisters the factory for a DIF type.
pub fn ipcp_factory_unregister(dif_type: &str) -> Result<()> {
    let global = crate::dm::global();
    let mut factories = global.factories.lock().unwrap();
    let prev = factories.len();
    factories.retain(|f| f.dif_type() != dif_type);
    if factories.len() == prev {
        return Err(Error::InvalidArg);
    }
    log::info!("IPC processes factory '{}' unregistered", dif_type);
    Ok(())
}

pub(crate) fn factories_find(dif_type: &str) -> Option<Arc<dyn IpcpFactory>> {
    let global = crate::dm::global();
    let factories = global.factories.lock().unwrap();
    factories.iter().find(|f| f.dif_type() == dif_type).cloned()
}
