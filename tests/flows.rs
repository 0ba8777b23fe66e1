//! Flow allocation over a kernel-handled shim: the four-step handshake,
//! data transfer through the I/O endpoint, deallocation and the port-id
//! reuse race.
use async_std::task;
use ctlmsg::{parse, serialize, Body, FlowSpec, Msg, IPCP_ID_NONE, RESP_SUCC};
use futures_timer::Delay;
use ripc::{ctrl_open, flow_put, CtrlDevice, Error, FlowIo, FLOW_ALLOCATED};
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

struct ShimSetup {
    a: Arc<CtrlDevice>,
    b: Arc<CtrlDevice>,
    ipcp_id: u16,
}

/// One shim IPCP, bob registered on device `b`, short deallocation wait.
async fn shim_setup(ns: &str) -> ShimSetup {
    setup();
    let a = ctrl_open(ns, true);
    let b = ctrl_open(ns, true);

    send(&a, 1, Body::IpcpCreate {
        name: "lo".into(),
        dif_type: "shim-loopback".into(),
        dif_name: "d1".into(),
    })
    .await
    .unwrap();
    let ipcp_id = match recv(&a).await.body {
        Body::IpcpCreateResp { ipcp_id } => ipcp_id,
        other => panic!("unexpected response {:?}", other),
    };

    send(&a, 2, Body::IpcpConfig {
        ipcp_id,
        name: "flow-del-wait-ms".into(),
        value: "50".into(),
    })
    .await
    .unwrap();

    send(&b, 3, Body::ApplRegister {
        dif_name: "d1".into(),
        reg: true,
        appl_name: "bob".into(),
    })
    .await
    .unwrap();
    match recv(&b).await.body {
        Body::ApplRegisterResp { response, .. } => assert_eq!(response, RESP_SUCC),
        other => panic!("unexpected response {:?}", other),
    }

    ShimSetup { a, b, ipcp_id }
}

/// Runs the four-step handshake, returning (initiator port, slave port).
async fn allocate(s: &ShimSetup) -> (u16, u16) {
    send(&s.a, 42, Body::FaReq {
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

    let (kevent_id, slave_port) = match recv(&s.b).await.body {
        Body::FaReqArrived { kevent_id, ipcp_id, port_id, local_appl, remote_appl, .. } => {
            assert_eq!(ipcp_id, s.ipcp_id);
            assert_eq!(local_appl, "bob");
            assert_eq!(remote_appl, "alice");
            (kevent_id, port_id)
        }
        other => panic!("unexpected request {:?}", other),
    };

    send(&s.b, 43, Body::FaResp {
        kevent_id,
        ipcp_id: s.ipcp_id,
        upper_ipcp_id: IPCP_ID_NONE,
        port_id: slave_port,
        response: 0,
        cep_id: 0,
    })
    .await
    .unwrap();

    let initiator_port = match recv(&s.a).await {
        Msg { event_id, body: Body::FaRespArrived { port_id, response } } => {
            assert_eq!(event_id, 42);
            assert_eq!(response, 0);
            port_id
        }
        other => panic!("unexpected response {:?}", other),
    };

    (initiator_port, slave_port)
}

#[test]
fn test_shim_flow_allocation_and_data() {
    task::block_on(async {
        let s = shim_setup("t-shim-data").await;
        let (p, q) = allocate(&s).await;

        // Both ends of the flow pair show up in the enumeration.
        send(&s.a, 50, Body::FlowFetch { ipcp_id: s.ipcp_id }).await.unwrap();
        let mut seen = Vec::new();
        loop {
            match recv(&s.a).await.body {
                Body::FlowFetchResp { end: true, .. } => break,
                Body::FlowFetchResp { end: false, local_port, remote_port, .. } => {
                    seen.push((local_port, remote_port));
                    send(&s.a, 51, Body::FlowFetch { ipcp_id: s.ipcp_id }).await.unwrap();
                }
                other => panic!("unexpected entry {:?}", other),
            }
        }
        assert!(seen.contains(&(p, q)));
        assert!(seen.contains(&(q, p)));

        let a_io = FlowIo::open(&s.a, p).unwrap();
        let b_io = FlowIo::open(&s.b, q).unwrap();

        a_io.write_sdu(b"ping").await.unwrap();
        let sdu = b_io.read_sdu().await.unwrap().expect("no eof yet");
        assert_eq!(&sdu[..], b"ping");

        b_io.write_sdu(b"pong").await.unwrap();
        let sdu = a_io.read_sdu().await.unwrap().expect("no eof yet");
        assert_eq!(&sdu[..], b"pong");

        // Counters moved.
        send(&s.a, 52, Body::FlowStatsReq { port_id: p }).await.unwrap();
        match recv(&s.a).await.body {
            Body::FlowStatsResp { stats, .. } => {
                assert_eq!(stats.tx_pkt, 1);
                assert_eq!(stats.rx_pkt, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
    });
}

#[test]
fn test_dealloc_uid_guard_and_port_reuse() {
    task::block_on(async {
        let s = shim_setup("t-shim-reuse").await;
        let (p, q) = allocate(&s).await;

        let a_io = FlowIo::open(&s.a, p).unwrap();
        let b_io = FlowIo::open(&s.b, q).unwrap();

        let uid = {
            let flow = s.a.dm().flow_get(p).unwrap();
            let uid = flow.uid.load();
            flow_put(&flow);
            uid
        };

        // A wrong uid does not touch the flow.
        assert_eq!(
            send(&s.a, 60, Body::FlowDealloc {
                ipcp_id: s.ipcp_id,
                port_id: p,
                uid: uid.wrapping_add(1000),
            })
            .await,
            Err(Error::NotFound)
        );

        // The right uid shuts it down; readers observe EOF.
        send(&s.a, 61, Body::FlowDealloc { ipcp_id: s.ipcp_id, port_id: p, uid })
            .await
            .unwrap();
        assert!(a_io.read_sdu().await.unwrap().is_none());

        // Deallocating twice is idempotent.
        assert_eq!(
            send(&s.a, 62, Body::FlowDealloc { ipcp_id: s.ipcp_id, port_id: p, uid }).await,
            Err(Error::NotFound)
        );

        // Close both ends and let the grace period and the removal
        // worker run.
        drop(a_io);
        drop(b_io);
        Delay::new(Duration::from_millis(400)).await;
        assert!(s.a.dm().flow_get(p).is_none());
        assert!(s.a.dm().flow_get(q).is_none());

        // A new allocation reuses the lowest port ids.
        let (p2, _q2) = allocate(&s).await;
        assert_eq!(p2, p);
        let new_uid = {
            let flow = s.a.dm().flow_get(p2).unwrap();
            let uid = flow.uid.load();
            flow_put(&flow);
            uid
        };
        assert_ne!(new_uid, uid);

        // A deallocation raced by the reuse: the stale uid must not kill
        // the young flow.
        assert_eq!(
            send(&s.a, 63, Body::FlowDealloc { ipcp_id: s.ipcp_id, port_id: p, uid }).await,
            Err(Error::NotFound)
        );
        let flow = s.a.dm().flow_get(p2).unwrap();
        assert!(flow.flags() & FLOW_ALLOCATED != 0);
        flow_put(&flow);
    });
}

#[test]
fn test_flow_allocation_reject() {
    task::block_on(async {
        let s = shim_setup("t-shim-reject").await;

        send(&s.a, 70, Body::FaReq {
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

        let (kevent_id, slave_port) = match recv(&s.b).await.body {
            Body::FaReqArrived { kevent_id, port_id, .. } => (kevent_id, port_id),
            other => panic!("unexpected request {:?}", other),
        };

        send(&s.b, 71, Body::FaResp {
            kevent_id,
            ipcp_id: s.ipcp_id,
            upper_ipcp_id: IPCP_ID_NONE,
            port_id: slave_port,
            response: 1,
            cep_id: 0,
        })
        .await
        .unwrap();

        match recv(&s.a).await.body {
            Body::FaRespArrived { response, .. } => assert_eq!(response, 1),
            other => panic!("unexpected response {:?}", other),
        }

        // Both pending flows die without a grace period.
        Delay::new(Duration::from_millis(100)).await;
        send(&s.a, 72, Body::FlowFetch { ipcp_id: s.ipcp_id }).await.unwrap();
        match recv(&s.a).await.body {
            Body::FlowFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected entry {:?}", other),
        }
    });
}

#[test]
fn test_appl_move_rehomes_requests() {
    task::block_on(async {
        let s = shim_setup("t-shim-move").await;

        // bob's registration moves from device b to device a; incoming
        // flow requests follow it.
        send(&s.b, 90, Body::ApplMove { ipcp_id: s.ipcp_id, fd: s.a.dev_id() })
            .await
            .unwrap();

        send(&s.a, 91, Body::FaReq {
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

        match recv(&s.a).await.body {
            Body::FaReqArrived { local_appl, .. } => assert_eq!(local_appl, "bob"),
            other => panic!("unexpected request {:?}", other),
        }
    });
}

#[test]
fn test_fa_req_without_peer() {
    task::block_on(async {
        let s = shim_setup("t-shim-nopeer").await;

        // Nobody registered "carol": the shim handshake fails and the
        // failure comes back as an asynchronous negative response.
        send(&s.a, 80, Body::FaReq {
            dif_name: "d1".into(),
            upper_ipcp_id: IPCP_ID_NONE,
            local_appl: "alice".into(),
            remote_appl: "carol".into(),
            flowspec: FlowSpec::best_effort(),
            local_port: 0,
            local_cep: 0,
            uid: 0,
        })
        .await
        .unwrap();

        match recv(&s.a).await {
            Msg { event_id, body: Body::FaRespArrived { response, .. } } => {
                assert_eq!(event_id, 80);
                assert_eq!(response, 1);
            }
            other => panic!("unexpected response {:?}", other),
        }
    });
}
