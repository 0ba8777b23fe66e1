//! Control device exercises: IPCP lifecycle with update broadcasts,
//! registrations, configuration, enumerations and permission checks.
use async_std::task;
use ctlmsg::{parse, serialize, Body, FlowSpec, Msg, UpdateKind, IPCP_ID_NONE, RESP_ERR,
             RESP_SUCC};
use ripc::{ctrl_open, CtrlDevice, Error, F_IPCPS};
use std::sync::Arc;

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

#[test]
fn test_create_destroy_with_broadcasts() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-create-destroy", true);
        let sub = ctrl_open("t-create-destroy", false);
        sub.change_flags(F_IPCPS).unwrap();

        let id = create_ipcp(&adm, "nx", "normal", "d1").await;
        assert_eq!(id, 0);

        match recv(&sub).await.body {
            Body::IpcpUpdate { kind, ipcp_id, ipcp_name, dif_name, dif_type, .. } => {
                assert_eq!(kind, UpdateKind::Add);
                assert_eq!(ipcp_id, 0);
                assert_eq!(ipcp_name, "nx");
                assert_eq!(dif_name, "d1");
                assert_eq!(dif_type, "normal");
            }
            other => panic!("unexpected broadcast {:?}", other),
        }

        // A late subscriber gets the existing IPCPs replayed.
        let late = ctrl_open("t-create-destroy", false);
        late.change_flags(F_IPCPS).unwrap();
        match recv(&late).await.body {
            Body::IpcpUpdate { kind, ipcp_id, .. } => {
                assert_eq!(kind, UpdateKind::Add);
                assert_eq!(ipcp_id, 0);
            }
            other => panic!("unexpected replay {:?}", other),
        }

        // With nothing keeping the IPCP alive, the destruction is
        // immediate: subscribers hear both the detach advice and the
        // final removal.
        send(&adm, 2, Body::IpcpDestroy { ipcp_id: 0 }).await.unwrap();
        let mut kinds = Vec::new();
        for _ in 0..2 {
            match recv(&sub).await.body {
                Body::IpcpUpdate { kind, ipcp_id, .. } => {
                    assert_eq!(ipcp_id, 0);
                    kinds.push(kind);
                }
                other => panic!("unexpected broadcast {:?}", other),
            }
        }
        assert!(kinds.contains(&UpdateKind::Del));
        assert!(kinds.contains(&UpdateKind::UipcpDel));

        // Destroying it again reports the miss.
        assert_eq!(
            send(&adm, 3, Body::IpcpDestroy { ipcp_id: 0 }).await,
            Err(Error::NotFound)
        );
    });
}

#[test]
fn test_register_without_uipcp() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-register", true);
        let id = create_ipcp(&adm, "lo", "shim-loopback", "d1").await;

        // In-kernel registration completes immediately.
        send(&adm, 5, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: true,
            appl_name: "alice".into(),
        })
        .await
        .unwrap();
        match recv(&adm).await {
            Msg { event_id, body: Body::ApplRegisterResp { ipcp_id, reg, response, appl_name } } => {
                assert_eq!(event_id, 5);
                assert_eq!(ipcp_id, id);
                assert!(reg);
                assert_eq!(response, RESP_SUCC);
                assert_eq!(appl_name, "alice");
            }
            other => panic!("unexpected response {:?}", other),
        }

        // The registration shows up in the enumeration, not pending.
        send(&adm, 6, Body::RegFetch { ipcp_id: id }).await.unwrap();
        match recv(&adm).await.body {
            Body::RegFetchResp { end, ipcp_id, pending, appl_name } => {
                assert!(!end);
                assert_eq!(ipcp_id, id);
                assert!(!pending);
                assert_eq!(appl_name, "alice");
            }
            other => panic!("unexpected entry {:?}", other),
        }
        send(&adm, 7, Body::RegFetch { ipcp_id: id }).await.unwrap();
        match recv(&adm).await.body {
            Body::RegFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected entry {:?}", other),
        }

        // Asking again on the same device is a harmless no-op.
        send(&adm, 8, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: true,
            appl_name: "alice".into(),
        })
        .await
        .unwrap();
        match recv(&adm).await.body {
            Body::ApplRegisterResp { response, .. } => assert_eq!(response, RESP_SUCC),
            other => panic!("unexpected response {:?}", other),
        }

        // The name is taken for any other control device.
        let other = ctrl_open("t-register", false);
        send(&other, 9, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: true,
            appl_name: "alice".into(),
        })
        .await
        .unwrap();
        match recv(&other).await.body {
            Body::ApplRegisterResp { response, .. } => assert_eq!(response, RESP_ERR),
            other => panic!("unexpected response {:?}", other),
        }

        // Unregister and check the enumeration drained.
        send(&adm, 10, Body::ApplRegister {
            dif_name: "d1".into(),
            reg: false,
            appl_name: "alice".into(),
        })
        .await
        .unwrap();
        match recv(&adm).await.body {
            Body::ApplRegisterResp { reg, response, .. } => {
                assert!(!reg);
                assert_eq!(response, RESP_SUCC);
            }
            other => panic!("unexpected response {:?}", other),
        }
        send(&adm, 11, Body::RegFetch { ipcp_id: id }).await.unwrap();
        match recv(&adm).await.body {
            Body::RegFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected entry {:?}", other),
        }
    });
}

#[test]
fn test_privileged_operations_need_admin() {
    task::block_on(async {
        setup();
        let plain = ctrl_open("t-perm", false);
        assert_eq!(
            send(&plain, 1, Body::IpcpCreate {
                name: "nx".into(),
                dif_type: "normal".into(),
                dif_name: "d1".into(),
            })
            .await,
            Err(Error::Permission)
        );
        assert_eq!(
            send(&plain, 2, Body::FlowDealloc { ipcp_id: 0, port_id: 0, uid: 0 }).await,
            Err(Error::Permission)
        );

        // Enumerations are open to everyone.
        send(&plain, 3, Body::FlowFetch { ipcp_id: IPCP_ID_NONE }).await.unwrap();
        match recv(&plain).await.body {
            Body::FlowFetchResp { end, .. } => assert!(end),
            other => panic!("unexpected entry {:?}", other),
        }
    });
}

#[test]
fn test_validation_errors() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-validate", true);

        // Not even a header.
        assert_eq!(adm.write(b"xx").await, Err(Error::InvalidArg));
        // Bigger than the staging area.
        let huge = vec![0u8; 2000];
        assert_eq!(adm.write(&huge).await, Err(Error::InvalidArg));
        // Kernel-to-user message types have no handler.
        assert_eq!(
            send(&adm, 1, Body::IpcpCreateResp { ipcp_id: 0 }).await,
            Err(Error::InvalidArg)
        );

        // Unknown DIF type: no factory.
        assert_eq!(
            send(&adm, 2, Body::IpcpCreate {
                name: "nx".into(),
                dif_type: "shim-udp4".into(),
                dif_name: "d1".into(),
            })
            .await,
            Err(Error::NotFound)
        );

        let id = create_ipcp(&adm, "nx", "normal", "d1").await;

        // Duplicate IPCP name.
        assert_eq!(
            send(&adm, 3, Body::IpcpCreate {
                name: "nx".into(),
                dif_type: "normal".into(),
                dif_name: "d2".into(),
            })
            .await,
            Err(Error::InvalidArg)
        );
        // DIF type conflict.
        assert_eq!(
            send(&adm, 4, Body::IpcpCreate {
                name: "ny".into(),
                dif_type: "shim-loopback".into(),
                dif_name: "d1".into(),
            })
            .await,
            Err(Error::InvalidArg)
        );

        // Re-homing registrations to an unknown device.
        assert_eq!(
            send(&adm, 5, Body::ApplMove { ipcp_id: id, fd: 9999 }).await,
            Err(Error::BadFd)
        );
    });
}

#[test]
fn test_config_get_set() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-config", true);
        let sub = ctrl_open("t-config", false);
        let id = create_ipcp(&adm, "nx", "normal", "d1").await;
        sub.change_flags(F_IPCPS).unwrap();
        match recv(&sub).await.body {
            Body::IpcpUpdate { kind, .. } => assert_eq!(kind, UpdateKind::Add),
            other => panic!("unexpected broadcast {:?}", other),
        }

        // IPCP-specific parameter, served by the normal IPCP itself.
        send(&adm, 1, Body::IpcpConfig {
            ipcp_id: id,
            name: "address".into(),
            value: "42".into(),
        })
        .await
        .unwrap();
        match recv(&sub).await.body {
            Body::IpcpUpdate { kind, ipcp_addr, .. } => {
                assert_eq!(kind, UpdateKind::Upd);
                assert_eq!(ipcp_addr, 42);
            }
            other => panic!("unexpected broadcast {:?}", other),
        }
        send(&adm, 2, Body::IpcpConfigGetReq {
            ipcp_id: id,
            param_name: "address".into(),
        })
        .await
        .unwrap();
        match recv(&adm).await.body {
            Body::IpcpConfigGetResp { param_value } => assert_eq!(param_value, "42"),
            other => panic!("unexpected response {:?}", other),
        }

        // Core parameter fallback.
        send(&adm, 3, Body::IpcpConfig {
            ipcp_id: id,
            name: "flow-del-wait-ms".into(),
            value: "50".into(),
        })
        .await
        .unwrap();
        send(&adm, 4, Body::IpcpConfigGetReq {
            ipcp_id: id,
            param_name: "flow-del-wait-ms".into(),
        })
        .await
        .unwrap();
        match recv(&adm).await.body {
            Body::IpcpConfigGetResp { param_value } => assert_eq!(param_value, "50"),
            other => panic!("unexpected response {:?}", other),
        }

        // Unknown parameter.
        assert_eq!(
            send(&adm, 5, Body::IpcpConfig {
                ipcp_id: id,
                name: "no-such-param".into(),
                value: "1".into(),
            })
            .await,
            Err(Error::InvalidArg)
        );
    });
}

#[test]
fn test_stats_qos_sched() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-misc", true);
        let id = create_ipcp(&adm, "nx", "normal", "d1").await;

        send(&adm, 1, Body::IpcpStatsReq { ipcp_id: id }).await.unwrap();
        match recv(&adm).await.body {
            Body::IpcpStatsResp { stats } => {
                assert_eq!(stats.tx_pkt, 0);
                assert_eq!(stats.rx_pkt, 0);
            }
            other => panic!("unexpected response {:?}", other),
        }

        send(&adm, 2, Body::IpcpQosSupported {
            ipcp_id: id,
            flowspec: FlowSpec::best_effort(),
        })
        .await
        .unwrap();

        let demanding = FlowSpec {
            avg_bandwidth: 1_000_000,
            ..FlowSpec::best_effort()
        };
        assert_eq!(
            send(&adm, 3, Body::IpcpQosSupported { ipcp_id: id, flowspec: demanding }).await,
            Err(Error::NotImpl)
        );

        // No scheduler in the normal IPCP.
        assert_eq!(
            send(&adm, 4, Body::IpcpSchedWrr {
                ipcp_id: id,
                weights: vec![1, 2],
                quantum: 1500,
                max_queue_size: 64,
            })
            .await,
            Err(Error::NotImpl)
        );
    });
}

#[test]
fn test_ipcp_id_space_exhaustion() {
    task::block_on(async {
        setup();
        let adm = ctrl_open("t-exhaust", true);
        for i in 0..256 {
            let id = create_ipcp(&adm, &format!("lo{}", i), "shim-loopback", "d1").await;
            assert_eq!(id, i as u16);
        }
        // The 257th cannot get an id.
        assert_eq!(
            send(&adm, 1, Body::IpcpCreate {
                name: "lo256".into(),
                dif_type: "shim-loopback".into(),
                dif_name: "d1".into(),
            })
            .await,
            Err(Error::NoSpace)
        );
    });
}
