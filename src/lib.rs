//! # Recursive IPC stack core
//! The data and control model of a recursive IPC stack: network
//! functionality organized as a recursion of IPC processes (IPCPs)
//! grouped in DIFs, rather than a fixed pile of protocol layers.
//! Applications ask for flows to peer applications; each flow is
//! supported by an IPCP, which may in turn use flows provided by IPCPs
//! of lower DIFs.
//!
//! This crate owns the hard, DIF-type-independent part:
//!
//! - the lifecycle of IPCPs, registered applications and flows, with
//!   reference counting, deferred removal workers and the post-
//!   deallocation grace period that lets per-flow transmit queues drain;
//! - the control device, a serialized request/response channel with a
//!   bounded per-device upqueue, paginated enumerations and IPCP update
//!   broadcasts;
//! - the four-step flow allocation handshake, bridging kernel-handled
//!   shim IPCPs and normal IPCPs that delegate policy to an attached
//!   user-space IPCP;
//! - the per-flow data transfer state consulted on every send and
//!   receive.
//!
//! DIF-type implementations plug in through [`IpcpFactory`] and
//! [`IpcpOps`]; the message schema lives in the `ctlmsg` crate and the
//! on-wire PCI in the `pci` crate.
mod appl;
mod ctrl;
mod dm;
mod dtp;
mod err;
mod fa;
mod factory;
mod flow;
mod ids;
mod io;
mod ipcp;
mod upqueue;

pub use crate::appl::RegisteredAppl;
pub use crate::ctrl::{ctrl_open, CtrlDevice, F_IPCPS};
pub use crate::dm::DataModel;
pub use crate::dtp::Dtp;
pub use crate::err::{Error, Result};
pub use crate::fa::{fa_req_arrived, fa_resp_arrived};
pub use crate::factory::{ipcp_factory_register, ipcp_factory_unregister, IpcpFactory, IpcpOps,
                         MgmtRoute};
pub use crate::flow::{flow_get_ref, flow_make_mortal, flow_put, flow_shutdown, sdu_rx_flow,
                      FlowCounters, FlowEntry, Upper, FLOW_ALLOCATED, FLOW_DEALLOCATED,
                      FLOW_DEL_POSTPONED, FLOW_INACTIVE, FLOW_INITIATOR, FLOW_NEVER_BOUND,
                      FLOW_PENDING, FLOW_UPPER_BOUND};
pub use crate::io::FlowIo;
pub use crate::ipcp::{ipcp_put, Dif, IpcpCounters, IpcpEntry};
pub use crate::upqueue::{Upqueue, UPQUEUE_SIZE_MAX};
