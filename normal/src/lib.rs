//! # The normal IPC process
//! The DIF-type plug-in that gives the stack its recursion: flows of a
//! normal IPCP are transported over N-1 flows provided by lower IPCPs,
//! selected through a per-IPCP PDU forwarding table. Policy (routing,
//! enrollment, flow allocation) is delegated to an attached user-space
//! IPCP; this crate implements the data transfer machinery.
mod dtp;

use async_trait::async_trait;
use bytes::BytesMut;
use ctlmsg::FlowSpec;
use ripc::{
    ipcp_factory_register, Error, FlowEntry, IpcpEntry, IpcpFactory, IpcpOps, MgmtRoute, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The DIF type implemented by this crate.
pub const DIF_TYPE: &str = "normal";

pub(crate) struct NormalIpcp {
    pub(crate) me: Weak<NormalIpcp>,
    /// PDU forwarding table: destination address to N-1 flow. Entries do
    /// not own the flows; every flush path runs before flow teardown.
    pduft: Mutex<HashMap<u64, Arc<FlowEntry>>>,
}

impl NormalIpcp {
    pub(crate) fn pduft_lookup(&self, dst_addr: u64) -> Option<Arc<FlowEntry>> {
        self.pduft.lock().unwrap().get(&dst_addr).cloned()
    }
}

#[async_trait]
impl IpcpOps for NormalIpcp {
    async fn sdu_write(
        &self,
        ipcp: &Arc<IpcpEntry>,
        flow: &Arc<FlowEntry>,
        sdu: BytesMut,
    ) -> Result<usize> {
        dtp::sdu_write(self, ipcp, flow, sdu).await
    }

    async fn sdu_rx(&self, ipcp: &Arc<IpcpEntry>, pdu: BytesMut) -> Result<()> {
        dtp::sdu_rx(self, ipcp, pdu).await
    }

    async fn mgmt_sdu_write(
        &self,
        ipcp: &Arc<IpcpEntry>,
        route: MgmtRoute,
        sdu: BytesMut,
    ) -> Result<usize> {
        dtp::mgmt_sdu_write(self, ipcp, route, sdu).await
    }

    fn flow_init(&self, _ipcp: &Arc<IpcpEntry>, flow: &Arc<FlowEntry>) {
        let cfg = flow.config();
        let mut dtp = flow.dtp.lock().unwrap();
        dtp::flow_init(&mut dtp, &cfg.dtcp);
    }

    fn config(&self, ipcp: &Arc<IpcpEntry>, name: &str, value: &str) -> Result<bool> {
        match name {
            "address" => {
                let address: u64 = value.parse().map_err(|_| Error::InvalidArg)?;
                log::info!("IPCP {} address set to {}", ipcp.id, address);
                ipcp.addr.store(address);
                Ok(true)
            }
            _ => Err(Error::NotImpl),
        }
    }

    fn config_get(&self, ipcp: &Arc<IpcpEntry>, name: &str) -> Result<String> {
        match name {
            "address" => Ok(ipcp.addr.load().to_string()),
            _ => Err(Error::NotImpl),
        }
    }

    fn qos_supported(&self, _ipcp: &Arc<IpcpEntry>, spec: &FlowSpec) -> Result<()> {
        // Best effort plus in-order delivery over a window; no delay or
        // loss guarantees to offer.
        if spec.avg_bandwidth == 0 && spec.max_delay == 0 && spec.max_loss == 0 {
            Ok(())
        } else {
            Err(Error::NotImpl)
        }
    }

    fn pduft_set(&self, _ipcp: &Arc<IpcpEntry>, dst_addr: u64, flow: &Arc<FlowEntry>) -> Result<()> {
        let mut pduft = self.pduft.lock().unwrap();
        pduft.insert(dst_addr, flow.clone());
        Ok(())
    }

    fn pduft_del_addr(&self, _ipcp: &Arc<IpcpEntry>, dst_addr: u64) -> Result<()> {
        let mut pduft = self.pduft.lock().unwrap();
        pduft.remove(&dst_addr).map(|_| ()).ok_or(Error::NotFound)
    }

    fn pduft_flush(&self, _ipcp: &Arc<IpcpEntry>) -> Result<()> {
        self.pduft.lock().unwrap().clear();
        Ok(())
    }

    fn pduft_flush_by_flow(&self, _ipcp: &Arc<IpcpEntry>, flow: &FlowEntry) {
        let mut pduft = self.pduft.lock().unwrap();
        pduft.retain(|_, cur| cur.local_port != flow.local_port);
    }

    fn has_pduft(&self) -> bool {
        true
    }
}

struct NormalFactory;

impl IpcpFactory for NormalFactory {
    fn dif_type(&self) -> &str {
        DIF_TYPE
    }

    fn use_cep_ids(&self) -> bool {
        true
    }

    fn create(&self, ipcp: &Arc<IpcpEntry>) -> Result<Arc<dyn IpcpOps>> {
        let priv_ = Arc::new_cyclic(|me| NormalIpcp {
            me: me.clone(),
            pduft: Mutex::new(HashMap::new()),
        });
        log::debug!("New normal IPC process created [{}]", ipcp.id);
        Ok(priv_)
    }
}

/// Registers the normal IPCP factory process-wide. `Busy` when already
/// registered.
pub fn register() -> Result<()> {
    ipcp_factory_register(Arc::new(NormalFactory))
}
