//! # Loopback shim IPCP
//! A DIF type whose flows connect applications of the same host: every
//! SDU written on a flow pops out of the peer flow of the same IPCP.
//! Flow allocation and application registration are handled entirely in
//! the kernel path, which makes this shim the natural exerciser for the
//! core handshake machinery, the way real shims over UDP or Ethernet
//! would drive it.
use async_std::task;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_timer::Delay;
use ripc::{
    fa_req_arrived, fa_resp_arrived, flow_put, ipcp_factory_register, sdu_rx_flow, Error,
    FlowEntry, IpcpEntry, IpcpFactory, IpcpOps, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The DIF type implemented by this crate.
pub const DIF_TYPE: &str = "shim-loopback";

struct ShimState {
    /// Kernel event id generator for the in-kernel handshake.
    kevent_cnt: u32,
    /// Pending handshakes: kernel event id to initiator port.
    reqs: HashMap<u32, u16>,
}

struct ShimLoopback {
    /// Defer deliveries through a task instead of completing them inline,
    /// to mimic a driver handing SDUs to a receive context.
    queued: bool,
    state: Mutex<ShimState>,
}

#[async_trait]
impl IpcpOps for ShimLoopback {
    async fn sdu_write(
        &self,
        ipcp: &Arc<IpcpEntry>,
        flow: &Arc<FlowEntry>,
        sdu: BytesMut,
    ) -> Result<usize> {
        let len = sdu.len();
        let peer_port = flow.remote_port();
        let peer = match ipcp.dm().flow_get(peer_port) {
            Some(peer) => peer,
            None => {
                log::debug!("no peer flow for port {}, dropping", peer_port);
                ipcp.stats.tx_err.fetch_add(1);
                return Ok(len);
            }
        };

        ipcp.stats.tx_pkt.fetch_add(1);
        ipcp.stats.tx_byte.fetch_add(len as u64);

        if self.queued {
            let peer_clone = peer.clone();
            let ipcp = ipcp.clone();
            task::spawn(async move {
                Delay::new(Duration::from_micros(50)).await;
                ipcp.stats.rx_pkt.fetch_add(1);
                ipcp.stats.rx_byte.fetch_add(sdu.len() as u64);
                if sdu_rx_flow(&peer_clone, sdu).await.is_err() {
                    ipcp.stats.rx_err.fetch_add(1);
                }
                flow_put(&peer_clone);
            });
            return Ok(len);
        }

        ipcp.stats.rx_pkt.fetch_add(1);
        ipcp.stats.rx_byte.fetch_add(len as u64);
        let ret = sdu_rx_flow(&peer, sdu).await;
        flow_put(&peer);
        ret.map(|()| len)
    }

    async fn flow_allocate_req(&self, ipcp: &Arc<IpcpEntry>, flow: &Arc<FlowEntry>) -> Result<()> {
        let kevent_id = {
            let mut st = self.state.lock().unwrap();
            st.kevent_cnt += 1;
            let id = st.kevent_cnt;
            st.reqs.insert(id, flow.local_port);
            id
        };

        // The handshake stays on this host: the "arrived" request shows
        // up immediately, application names swapped, the initiator port
        // standing in for the remote endpoint. Addresses stay null, a
        // loopback has none.
        let ret = fa_req_arrived(
            ipcp,
            kevent_id,
            flow.local_port,
            flow.local_cep,
            0,
            0,
            &flow.remote_appl,
            &flow.local_appl,
            None,
            Some(&flow.spec),
            true,
        )
        .await;

        if ret.is_err() {
            self.state.lock().unwrap().reqs.remove(&kevent_id);
        }
        ret
    }

    async fn flow_allocate_resp(
        &self,
        ipcp: &Arc<IpcpEntry>,
        flow: &Arc<FlowEntry>,
        response: u8,
    ) -> Result<()> {
        // The slave flow carries the kernel event id as its uid.
        let kevent_id = flow.uid.load();
        let initiator_port = {
            let mut st = self.state.lock().unwrap();
            st.reqs.remove(&kevent_id).ok_or(Error::NotFound)?
        };

        fa_resp_arrived(
            ipcp,
            initiator_port,
            flow.local_port,
            flow.local_cep,
            0,
            0,
            response,
            None,
            true,
        )
        .await
    }

    fn flow_deallocated(&self, _ipcp: &Arc<IpcpEntry>, flow: &FlowEntry) {
        log::debug!("shim flow {} deallocated", flow.local_port);
    }

    fn appl_register(&self, _ipcp: &Arc<IpcpEntry>, appl_name: &str, reg: bool) -> Result<()> {
        // The core tracks the names; a loopback has nowhere to publish
        // them.
        log::debug!(
            "application {} {}registered",
            appl_name,
            if reg { "" } else { "un" }
        );
        Ok(())
    }

    fn handles_flow_alloc(&self) -> bool {
        true
    }

    fn handles_appl_register(&self) -> bool {
        true
    }

    fn handles_flow_dealloc(&self) -> bool {
        true
    }
}

struct ShimLoopbackFactory {
    queued: bool,
}

impl IpcpFactory for ShimLoopbackFactory {
    fn dif_type(&self) -> &str {
        DIF_TYPE
    }

    fn create(&self, ipcp: &Arc<IpcpEntry>) -> Result<Arc<dyn IpcpOps>> {
        log::debug!("New shim-loopback IPC process created [{}]", ipcp.id);
        Ok(Arc::new(ShimLoopback {
            queued: self.queued,
            state: Mutex::new(ShimState {
                kevent_cnt: 0,
                reqs: HashMap::new(),
            }),
        }))
    }
}

/// Registers the loopback shim factory process-wide, delivering inline.
pub fn register() -> Result<()> {
    ipcp_factory_register(Arc::new(ShimLoopbackFactory { queued: false }))
}

/// Registers the loopback shim factory with deferred deliveries.
pub fn register_queued() -> Result<()> {
    ipcp_factory_register(Arc::new(ShimLoopbackFactory { queued: true }))
}
