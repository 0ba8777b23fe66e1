//! A minimal per-flow I/O endpoint.
//!
//! Binding a port takes a flow reference and makes the flow mortal;
//! writes feed the supporting IPCP, reads pop the flow receive queue.
//! Dropping the endpoint shuts the flow down and releases the reference.
use crate::ctrl::CtrlDevice;
use crate::err::{Error, Result};
use crate::flow::{flow_make_mortal, flow_put, flow_shutdown, FlowEntry, FLOW_ALLOCATED,
                  FLOW_DEALLOCATED};
use bytes::BytesMut;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// An application endpoint bound to one allocated flow.
pub struct FlowIo {
    flow: Arc<FlowEntry>,
}

impl FlowIo {
    /// Binds the allocated flow with the given port id.
    pub fn open(rc: &CtrlDevice, port_id: u16) -> Result<FlowIo> {
        let flow = rc.dm().flow_get(port_id).ok_or(Error::NotFound)?;
        if flow.flags() & FLOW_ALLOCATED == 0 {
            flow_put(&flow);
            return Err(Error::InvalidArg);
        }
        flow_make_mortal(&flow);
        Ok(FlowIo { flow })
    }

    /// The bound flow.
    pub fn flow(&self) -> &Arc<FlowEntry> {
        &self.flow
    }

    /// Writes one SDU to the flow.
    pub async fn write_sdu(&self, sdu: &[u8]) -> Result<usize> {
        if self.flow.flags() & FLOW_DEALLOCATED != 0 {
            return Err(Error::BadFd);
        }
        let ipcp = self.flow.ipcp();
        if sdu.len() > ipcp.max_sdu_size.load() as usize {
            return Err(Error::InvalidArg);
        }
        let ops = ipcp.ops()?;
        self.flow.stats.tx_pkt.fetch_add(1);
        self.flow.stats.tx_byte.fetch_add(sdu.len() as u64);
        ops.sdu_write(ipcp, &self.flow, BytesMut::from(sdu)).await
    }

    /// Reads one SDU, waiting for one; `None` signals EOF after the flow
    /// was deallocated.
    pub async fn read_sdu(&self) -> Result<Option<BytesMut>> {
        RxFuture { flow: &self.flow }.await
    }

    /// Pops one SDU without waiting.
    pub fn try_read_sdu(&self) -> Option<BytesMut> {
        let mut st = self.flow.state.lock().unwrap();
        let sdu = st.txrx.rx_q.pop_front()?;
        st.txrx.rx_qsize -= sdu.len();
        Some(sdu)
    }
}

impl Drop for FlowIo {
    fn drop(&mut self) {
        flow_shutdown(&self.flow);
        flow_put(&self.flow);
    }
}

struct RxFuture<'a> {
    flow: &'a Arc<FlowEntry>,
}

impl<'a> Future for RxFuture<'a> {
    type Output = Result<Option<BytesMut>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut st = self.flow.state.lock().unwrap();
        if let Some(sdu) = st.txrx.rx_q.pop_front() {
            st.txrx.rx_qsize -= sdu.len();
            return Poll::Ready(Ok(Some(sdu)));
        }
        if st.txrx.eof {
            return Poll::Ready(Ok(None));
        }
        st.txrx.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}
