//! End to end exercises of the normal IPCP: uipcp reflection, recursion
//! over an N-1 shim DIF with PDUFT forwarding, windowed flow control and
//! the postponed removal of flows with queued PDUs.
use async_std::task;
use bytes::BytesMut;
use ctlmsg::{parse, serialize, Body, DtcpConfig, FlowConfig, FlowSpec, Msg, IPCP_ID_NONE,
             RESP_SUCC};
use futures_timer::Delay;
use ripc::{ctrl_open, flow_put, ipcp_put, CtrlDevice, FlowIo, MgmtRoute};
use std::sync::Arc;
use std::time::Duration;

fn setup() {
    normal::register().ok();
    shim_loopback::register().ok();
}

async fn send(dev: &Arc<CtrlDevice>, event_id: u32, body: Body) -> ripc::Result<usize> {
    dev.write(&serialize(&Msg::new(event_id, body))).await
}

async fn recv(dev: &Arc<CtrlDevice>) -> Msg {
    let mut buf = vec![0u8; 4096];
    let n = dev.read(&mut buf).await.unwrap();
    parse(&buf[..n]).unwrap()
}

async fn create_ipcp(dev: &Arc<CtrlDevice>, name: &str, dif_type: &str, dif_name: &str) -> u16 {
    send(dev, 1, Body::IpcpCreate {
        name: name.into(),
        dif_type: dif_type.into(),
        dif_name: dif_name.into(),
    })
    .await
    .unwrap();
    match recv(dev).await.body {
        Body::IpcpCreateResp { ipcp_id } => ipcp_id,
        other => panic!("unexpected response {:?}", other),
    }
}

async fn config(dev: &Arc<CtrlDevice>, ipcp_id: u16, name: &str, value: &str) {
    send(dev, 2, Body::IpcpConfig {
        ipcp_id,
        name: name.into(),
        value: value.into(),
    })
    .await
    .unwrap();
}

#[test]
fn test_uipcp_reflection() {
    task::block_on(async {
        setup();
        let u = ctrl_open("t-reflect", true);
        let a = ctrl_open("t-reflect", false);
        let id = create_ipcp(&u, "nx", "normal", "d1").await;

        // Waiting for a uipcp blocks until one attaches.
        let waiter = {
            let w = ctrl_open("t-reflect", true);
            task::spawn(async move {
                send(&w, 9, Body::IpcpUipcpWait { ipcp_id: 0 }).await.unwrap();
            })
        };

        // Without a uipcp the request fails asynchronously.
        send(&a, 10, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "bob".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        match recv(&a).await {
            Msg { event_id, body: Body::FaRespArrived { response, .. } } => {
                assert_eq!(event_id, 10);
                assert_eq!(response, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }

        // Attach the uipcp; the waiter resolves and waiting again
        // returns immediately.
        send(&u, 11, Body::IpcpUipcpSet { ipcp_id: id }).await.unwrap();
        waiter.await;
        send(&u, 12, Body::IpcpUipcpWait { ipcp_id: id }).await.unwrap();

        // The request is now reflected, with the kernel-filled fields.
        send(&a, 13, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "bob".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        let local_port = match recv(&u).await {
            Msg { event_id, body: Body::FaReq { local_appl, remote_appl, local_port, .. } } => {
                assert_eq!(event_id, 0);
                assert_eq!(local_appl, "alice");
                assert_eq!(remote_appl, "bob");
                local_port
            }
            other => panic!("unexpected reflection {:?}", other),
        };

        // The uipcp completed the handshake with the remote peer.
        send(&u, 14, Body::UipcpFaRespArrived {
            ipcp_id: id,
            local_port,
            remote_port: 77,
            remote_cep: 77,
            qos_id: 0,
            remote_addr: 42,
            response: 0,
            flowcfg: FlowConfig::default(),
        })
        .await
        .unwrap();
        match recv(&a).await {
            Msg { event_id, body: Body::FaRespArrived { port_id, response } } => {
                assert_eq!(event_id, 13);
                assert_eq!(port_id, local_port);
                assert_eq!(response, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }

        // The flow is visible with the remote endpoint filled in.
        send(&a, 15, Body::FlowFetch { ipcp_id: id }).await.unwrap();
        match recv(&a).await.body {
            Body::FlowFetchResp { end, local_port: lp, remote_port, remote_addr, .. } => {
                assert!(!end);
                assert_eq!(lp, local_port);
                assert_eq!(remote_port, 77);
                assert_eq!(remote_addr, 42);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        send(&a, 16, Body::FlowFetch { ipcp_id: id }).await.unwrap();
        match recv(&a).await.body {
            Body::FlowFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected entry {:?}", other),
        }

        // A second uipcp cannot attach.
        let u2 = ctrl_open("t-reflect", true);
        assert!(send(&u2, 17, Body::IpcpUipcpSet { ipcp_id: id }).await.is_err());
    });
}

/// Two normal IPCPs talking through a loopback shim DIF: the N-1 flows
/// are allocated with upper bindings, the PDUFTs are pointed at them and
/// application SDUs cross the whole recursion in both directions.
#[test]
fn test_recursion_over_shim() {
    task::block_on(async {
        setup();
        let ns = "t-recursion";
        let u0 = ctrl_open(ns, true); // uipcp of n0
        let u1 = ctrl_open(ns, true); // uipcp of n1
        let a = ctrl_open(ns, false); // alice
        let b = ctrl_open(ns, false); // bob

        let shim_id = create_ipcp(&u0, "lo0", "shim-loopback", "lodif").await;

        // n1 first, so that bob's registration lands on it.
        let n1_id = create_ipcp(&u1, "n1", "normal", "ndif").await;
        send(&u1, 3, Body::IpcpUipcpSet { ipcp_id: n1_id }).await.unwrap();
        config(&u1, n1_id, "address", "2").await;
        config(&u1, n1_id, "flow-del-wait-ms", "50").await;

        // bob registers; the uipcp confirms the pending registration.
        send(&b, 4, Body::ApplRegister {
            dif_name: "ndif".into(),
            reg: true,
            appl_name: "bob".into(),
        })
        .await
        .unwrap();
        match recv(&u1).await.body {
            Body::ApplRegister { reg, appl_name, .. } => {
                assert!(reg);
                assert_eq!(appl_name, "bob");
            }
            other => panic!("unexpected reflection {:?}", other),
        }
        send(&u1, 5, Body::ApplRegisterResp {
            ipcp_id: n1_id,
            reg: true,
            response: RESP_SUCC,
            appl_name: "bob".into(),
        })
        .await
        .unwrap();
        match recv(&b).await.body {
            Body::ApplRegisterResp { response, .. } => assert_eq!(response, RESP_SUCC),
            other => panic!("unexpected response {:?}", other),
        }

        // n0, with a transmit headroom that marks it as the higher
        // ranked entry point of the DIF.
        let n0_id = create_ipcp(&u0, "n0", "normal", "ndif").await;
        send(&u0, 6, Body::IpcpUipcpSet { ipcp_id: n0_id }).await.unwrap();
        config(&u0, n0_id, "address", "1").await;
        config(&u0, n0_id, "txhdroom", "64").await;
        config(&u0, n0_id, "flow-del-wait-ms", "50").await;

        // The N-1 flow over the shim, upper-bound to the normals.
        send(&u1, 7, Body::ApplRegister {
            dif_name: "lodif".into(),
            reg: true,
            appl_name: "n1.mgmt".into(),
        })
        .await
        .unwrap();
        match recv(&u1).await.body {
            Body::ApplRegisterResp { response, .. } => assert_eq!(response, RESP_SUCC),
            other => panic!("unexpected response {:?}", other),
        }

        send(&u0, 8, Body::FaReq {
            dif_name: "lodif".into(),
            upper_ipcp_id: n0_id,
            local_appl: "n0.mgmt".into(),
            remote_appl: "n1.mgmt".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        let (kevent_id, q_port) = match recv(&u1).await.body {
            Body::FaReqArrived { kevent_id, port_id, .. } => (kevent_id, port_id),
            other => panic!("unexpected request {:?}", other),
        };
        send(&u1, 9, Body::FaResp {
            kevent_id,
            ipcp_id: shim_id,
            upper_ipcp_id: n1_id,
            port_id: q_port,
            response: 0,
            cep_id: 0,
        })
        .await
        .unwrap();
        let p_port = match recv(&u0).await.body {
            Body::FaRespArrived { port_id, response } => {
                assert_eq!(response, 0);
                port_id
            }
            other => panic!("unexpected response {:?}", other),
        };

        // Point the forwarding tables at the N-1 flows.
        send(&u0, 20, Body::IpcpPduftSet {
            ipcp_id: n0_id,
            dst_addr: 2,
            local_port: p_port,
        })
        .await
        .unwrap();
        send(&u1, 21, Body::IpcpPduftSet {
            ipcp_id: n1_id,
            dst_addr: 1,
            local_port: q_port,
        })
        .await
        .unwrap();

        // The PDUFT obeys set/del algebra.
        send(&u0, 22, Body::IpcpPduftSet {
            ipcp_id: n0_id,
            dst_addr: 99,
            local_port: p_port,
        })
        .await
        .unwrap();
        send(&u0, 23, Body::IpcpPduftDel { ipcp_id: n0_id, dst_addr: 99 }).await.unwrap();
        assert!(send(&u0, 24, Body::IpcpPduftDel { ipcp_id: n0_id, dst_addr: 99 })
            .await
            .is_err());

        // alice asks for a flow to bob without naming a DIF: the higher
        // ranked normal (n0) takes it, and its uipcp sees the request.
        send(&a, 30, Body::FaReq {
            dif_name: String::new(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "bob".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        let (alice_port, alice_cep) = match recv(&u0).await.body {
            Body::FaReq { local_port, local_cep, local_appl, .. } => {
                assert_eq!(local_appl, "alice");
                (local_port, local_cep)
            }
            other => panic!("unexpected reflection {:?}", other),
        };

        // The "remote" side: u1 injects the arrived request into n1.
        send(&u1, 31, Body::UipcpFaReqArrived {
            kevent_id: 900,
            ipcp_id: n1_id,
            remote_port: alice_port,
            remote_cep: alice_cep,
            qos_id: 0,
            remote_addr: 1,
            local_appl: "bob".into(),
            remote_appl: "alice".into(),
            flowcfg: FlowConfig::default(),
            flowspec: FlowSpec::best_effort(),
        })
        .await
        .unwrap();
        let bob_port = match recv(&b).await.body {
            Body::FaReqArrived { kevent_id, ipcp_id, port_id, .. } => {
                assert_eq!(kevent_id, 900);
                assert_eq!(ipcp_id, n1_id);
                port_id
            }
            other => panic!("unexpected request {:?}", other),
        };
        send(&b, 32, Body::FaResp {
            kevent_id: 900,
            ipcp_id: n1_id,
            upper_ipcp_id: IPCP_ID_NONE,
            port_id: bob_port,
            response: 0,
            cep_id: 0,
        })
        .await
        .unwrap();
        // n1 reflects the response to its uipcp, telling it the local
        // connection endpoint of bob's flow.
        let bob_cep = match recv(&u1).await.body {
            Body::FaResp { port_id, cep_id, .. } => {
                assert_eq!(port_id, bob_port);
                cep_id
            }
            other => panic!("unexpected reflection {:?}", other),
        };

        // Back on the initiator side.
        send(&u0, 33, Body::UipcpFaRespArrived {
            ipcp_id: n0_id,
            local_port: alice_port,
            remote_port: bob_port,
            remote_cep: bob_cep,
            qos_id: 0,
            remote_addr: 2,
            response: 0,
            flowcfg: FlowConfig::default(),
        })
        .await
        .unwrap();
        match recv(&a).await.body {
            Body::FaRespArrived { port_id, response } => {
                assert_eq!(port_id, alice_port);
                assert_eq!(response, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }

        // Data crosses the whole recursion, both ways.
        let a_io = FlowIo::open(&a, alice_port).unwrap();
        let b_io = FlowIo::open(&b, bob_port).unwrap();

        a_io.write_sdu(b"ping").await.unwrap();
        let sdu = b_io.read_sdu().await.unwrap().expect("no eof yet");
        assert_eq!(&sdu[..], b"ping");

        b_io.write_sdu(b"pong").await.unwrap();
        let sdu = a_io.read_sdu().await.unwrap().expect("no eof yet");
        assert_eq!(&sdu[..], b"pong");

        // The normal IPCPs moved traffic.
        send(&u0, 34, Body::IpcpStatsReq { ipcp_id: n0_id }).await.unwrap();
        match recv(&u0).await.body {
            Body::IpcpStatsResp { stats } => {
                assert!(stats.tx_pkt >= 1);
                assert!(stats.rx_pkt >= 1);
            }
            other => panic!("unexpected response {:?}", other),
        }

        // Management SDUs ride the same N-1 flows, routed either by
        // destination address or by an explicit local port.
        let n0 = u0.dm().ipcp_get(n0_id).unwrap();
        let ops = n0.ops().unwrap();
        assert_eq!(
            ops.mgmt_sdu_write(&n0, MgmtRoute::DstAddr(2), BytesMut::from(&b"rib"[..]))
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            ops.mgmt_sdu_write(&n0, MgmtRoute::LocalPort(p_port), BytesMut::from(&b"rib"[..]))
                .await
                .unwrap(),
            3
        );
        // No route: the management PDU is dropped, not an error.
        assert_eq!(
            ops.mgmt_sdu_write(&n0, MgmtRoute::DstAddr(77), BytesMut::from(&b"rib"[..]))
                .await
                .unwrap(),
            3
        );
        drop(ops);
        ipcp_put(&n0);
    });
}

/// A windowed self flow whose closed window queue still holds PDUs when
/// the endpoint closes: removal is postponed for the deallocation grace
/// period, then the removal worker frees the port.
#[test]
fn test_postponed_flow_delete() {
    task::block_on(async {
        setup();
        let ns = "t-postpone";
        let u = ctrl_open(ns, true);
        let a = ctrl_open(ns, false);
        let id = create_ipcp(&u, "nx", "normal", "d1").await;
        send(&u, 1, Body::IpcpUipcpSet { ipcp_id: id }).await.unwrap();
        config(&u, id, "address", "1").await;
        config(&u, id, "flow-del-wait-ms", "80").await;

        send(&a, 2, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "alice".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        let (port, cep) = match recv(&u).await.body {
            Body::FaReq { local_port, local_cep, .. } => (local_port, local_cep),
            other => panic!("unexpected reflection {:?}", other),
        };

        // A self flow: remote address is our own, remote endpoint is our
        // own endpoint. Window credit of two, retransmission on, so the
        // window never reopens by itself.
        let flowcfg = FlowConfig {
            dtcp: DtcpConfig {
                flow_control: true,
                rtx_control: true,
                fc_type: ctlmsg::FcType::Window,
                max_cwq_len: 8,
                initial_credit: 2,
                max_rtxq_len: 8,
            },
        };
        send(&u, 3, Body::UipcpFaRespArrived {
            ipcp_id: id,
            local_port: port,
            remote_port: port,
            remote_cep: cep,
            qos_id: 0,
            remote_addr: 1,
            response: 0,
            flowcfg,
        })
        .await
        .unwrap();
        match recv(&a).await.body {
            Body::FaRespArrived { response, .. } => assert_eq!(response, 0),
            other => panic!("unexpected response {:?}", other),
        }

        let io = FlowIo::open(&a, port).unwrap();
        // Sequence numbers 0..=2 fit the window, 3 and 4 park on the
        // closed window queue.
        for msg in &[&b"m0"[..], b"m1", b"m2", b"m3", b"m4"] {
            io.write_sdu(msg).await.unwrap();
        }

        let mut delivered = Vec::new();
        for _ in 0..3 {
            let sdu = io.read_sdu().await.unwrap().expect("no eof yet");
            delivered.push(sdu.to_vec());
        }
        delivered.sort();
        assert_eq!(delivered, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec()]);

        send(&a, 4, Body::FlowStatsReq { port_id: port }).await.unwrap();
        match recv(&a).await.body {
            Body::FlowStatsResp { dtp, .. } => {
                assert_eq!(dtp.cwq_len, 2);
                assert!(dtp.rtxq_len >= 1);
            }
            other => panic!("unexpected response {:?}", other),
        }

        // Close the endpoint: the flow must linger for the grace period
        // because its queues are not drained.
        drop(io);
        Delay::new(Duration::from_millis(20)).await;
        let lingering = a.dm().flow_get(port).expect("still in the put queue");
        flow_put(&lingering);

        // After the grace period the removal worker frees the port, and
        // the uipcp hears about the deallocation.
        Delay::new(Duration::from_millis(400)).await;
        assert!(a.dm().flow_get(port).is_none());
        match recv(&u).await.body {
            Body::FlowDeallocated { ipcp_id, local_port_id, remote_addr, .. } => {
                assert_eq!(ipcp_id, id);
                assert_eq!(local_port_id, port);
                assert_eq!(remote_addr, 1);
            }
            other => panic!("unexpected notification {:?}", other),
        }

        // The port id is free again: the next allocation takes it.
        send(&a, 5, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "alice".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();
        match recv(&u).await.body {
            Body::FaReq { local_port, .. } => assert_eq!(local_port, port),
            other => panic!("unexpected reflection {:?}", other),
        }
    });
}
