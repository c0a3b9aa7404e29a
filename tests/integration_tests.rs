// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integration tests for the wag gateway core
//!
//! These drive the public [`Gateway`] API end to end against the in-memory
//! store and network layer, and exercise the control plane over a real Unix
//! socket in a temporary directory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wag::control::OK_BODY;
use wag::{
    AuditLogger, AuthorizationState, Config, ControlClient, ControlError, ControlServer, Device,
    DeviceAddress, DeviceStore, ErrorKind, Gateway, GatewayError, JsonFileStore, MemoryNetwork,
    MemoryStore, NetworkLayer, Request, Response,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn addr(s: &str) -> DeviceAddress {
    s.parse().expect("valid test address")
}

struct Harness {
    gateway: Arc<Gateway>,
    store: Arc<MemoryStore>,
    network: Arc<MemoryNetwork>,
}

fn harness(lockout: u32, devices: Vec<Device>) -> Harness {
    let config = Config {
        lockout,
        session_timeout_secs: 60,
        enforcement_retries: 1,
        ..Config::default()
    };
    let peers: Vec<DeviceAddress> = devices.iter().map(|d| d.address).collect();
    let store = Arc::new(MemoryStore::with_devices(devices));
    let network = Arc::new(MemoryNetwork::with_peers(peers));
    let gateway = Gateway::new(
        &config,
        Arc::clone(&store) as Arc<dyn DeviceStore>,
        Arc::clone(&network) as Arc<dyn NetworkLayer>,
        Arc::new(AuditLogger::in_memory()),
    )
    .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(2));
    Harness {
        gateway: Arc::new(gateway),
        store,
        network,
    }
}

fn d1() -> Device {
    Device::new(addr("10.2.0.1"), "alice", "cHVibGljLWtleS1kMQ==")
}

/// Enforcement must equal the set of devices whose derived state allows forwarding.
fn assert_enforcement_matches(h: &Harness) {
    let devices = h.gateway.list_devices().expect("store readable");
    for device in devices {
        let state = h.gateway.state(device.address).expect("device exists");
        assert_eq!(
            h.network.is_reachable(device.address),
            state.allows_forwarding(),
            "enforcement drift for {} in state {}",
            device.address,
            state
        );
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_scenario_a_three_failures_lock() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");

    assert_eq!(h.gateway.record_failure(d).await?, AuthorizationState::Unauthenticated);
    assert_eq!(h.gateway.record_failure(d).await?, AuthorizationState::Unauthenticated);
    assert_eq!(h.gateway.record_failure(d).await?, AuthorizationState::Locked);

    assert_eq!(h.gateway.state(d)?, AuthorizationState::Locked);
    assert_eq!(h.gateway.device(d)?.attempts, 3);
    assert!(!h.gateway.session_tracker().contains(d));
    assert!(!h.network.is_reachable(d));
    Ok(())
}

#[tokio::test]
async fn test_scenario_b_success_on_locked_rejected() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");

    h.gateway.admin_lock(d).await?;
    let err = h.gateway.record_success(d, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(h.gateway.state(d)?, AuthorizationState::Locked);
    assert!(!h.network.is_reachable(d));
    Ok(())
}

#[tokio::test]
async fn test_scenario_c_reset_then_success() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");
    for _ in 0..3 {
        h.gateway.record_failure(d).await?;
    }

    assert_eq!(h.gateway.admin_reset(d).await?, AuthorizationState::Unauthenticated);
    assert_eq!(h.gateway.device(d)?.attempts, 0);
    assert_eq!(h.gateway.state(d)?, AuthorizationState::Unauthenticated);

    let endpoint = "198.51.100.20:51820".parse()?;
    assert_eq!(
        h.gateway.record_success(d, Some(endpoint)).await?,
        AuthorizationState::Authenticated
    );
    assert_eq!(h.gateway.state(d)?, AuthorizationState::Authenticated);
    assert!(h.gateway.session_tracker().contains(d));
    assert!(h.network.is_reachable(d));
    Ok(())
}

#[tokio::test]
async fn test_scenario_d_delete_with_active_session() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");
    h.gateway.record_success(d, None).await?;
    assert!(h.network.is_reachable(d));

    h.gateway.admin_delete(d).await?;

    assert!(h.store.get(d)?.is_none());
    assert!(matches!(h.gateway.device(d), Err(GatewayError::NotFound(_))));
    assert!(!h.gateway.session_tracker().contains(d));
    assert!(!h.network.has_peer(d));
    assert!(!h.network.is_reachable(d));

    let again = h.gateway.admin_delete(d).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_scenario_e_sessions_lists_authenticated_unexpired() -> TestResult {
    let h = harness(
        3,
        vec![
            d1(),
            Device::new(addr("10.2.0.2"), "alice", "k2"),
            Device::new(addr("10.2.0.3"), "bob", "k3"),
        ],
    );
    let endpoint = "203.0.113.4:40000".parse()?;

    h.gateway.record_success(addr("10.2.0.1"), None).await?;
    h.gateway.record_success(addr("10.2.0.2"), None).await?;
    h.gateway.touch(addr("10.2.0.1"), endpoint).await?;
    // Unauthenticated MFA device: touch does not create a session.
    assert!(!h.gateway.touch(addr("10.2.0.3"), endpoint).await?);
    // Locked device leaves the listing.
    h.gateway.admin_lock(addr("10.2.0.2")).await?;

    let listed: Vec<DeviceAddress> = h.gateway.sessions().addresses().collect();
    assert_eq!(listed, vec![addr("10.2.0.1")]);
    assert_eq!(
        h.gateway.sessions().render(),
        "vpn_address,actual_endpoint\n10.2.0.1,203.0.113.4:40000"
    );

    let later = Instant::now() + Duration::from_secs(3600);
    h.gateway.expire_sessions(later).await?;
    assert!(h.gateway.sessions().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_sessions_listing_omits_idle_sessions_before_sweep() -> TestResult {
    let config = Config {
        session_timeout_secs: 1,
        ..Config::default()
    };
    let gateway = Gateway::new(
        &config,
        Arc::new(MemoryStore::with_devices([d1()])) as Arc<dyn DeviceStore>,
        Arc::new(MemoryNetwork::new()) as Arc<dyn NetworkLayer>,
        Arc::new(AuditLogger::in_memory()),
    );
    let d = addr("10.2.0.1");

    gateway.record_success(d, "203.0.113.4:40000".parse().ok()).await?;
    assert_eq!(gateway.sessions().len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // No sweep has run: the entry is still tracked but is not live.
    assert!(gateway.session_tracker().contains(d));
    assert!(gateway.sessions().is_empty());
    assert_eq!(gateway.sessions().render(), "vpn_address,actual_endpoint");
    Ok(())
}

// =============================================================================
// Invariants
// =============================================================================

#[tokio::test]
async fn test_revoke_always_clears_session() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");

    h.gateway.record_success(d, None).await?;
    h.gateway.admin_lock(d).await?;
    assert!(!h.gateway.session_tracker().contains(d));

    h.gateway.admin_reset(d).await?;
    h.gateway.record_success(d, None).await?;
    h.gateway.admin_reset(d).await?;
    assert!(!h.gateway.session_tracker().contains(d));
    assert!(!h.network.is_reachable(d));
    Ok(())
}

#[tokio::test]
async fn test_lock_is_idempotent_on_the_network() -> TestResult {
    let h = harness(3, vec![d1()]);
    let d = addr("10.2.0.1");
    h.gateway.record_success(d, None).await?;

    h.gateway.admin_lock(d).await?;
    let after_first = h.network.mutation_count();
    h.gateway.admin_lock(d).await?;
    assert_eq!(h.network.mutation_count(), after_first);
    assert_eq!(h.gateway.device(d)?.attempts, 4);
    Ok(())
}

#[tokio::test]
async fn test_reconcile_converges_after_tampering() -> TestResult {
    let open = Device::new(addr("10.2.0.9"), "svc", "k9").with_enforcing_mfa(false);
    let h = harness(3, vec![d1(), Device::new(addr("10.2.0.2"), "alice", "k2"), open]);

    h.gateway.record_success(addr("10.2.0.2"), None).await?;
    h.network.tamper_reachable(addr("10.2.0.1"), true);
    h.network.tamper_reachable(addr("10.2.0.2"), false);

    let report = h.gateway.reconcile().await?;
    assert!(report.failures.is_empty());
    assert_eq!(report.checked, 3);
    assert_enforcement_matches(&h);

    let second = h.gateway.reconcile().await?;
    assert!(second.is_clean(), "second pass should find nothing: {}", second);
    Ok(())
}

#[tokio::test]
async fn test_enforcement_matches_after_mixed_sequence() -> TestResult {
    let open = Device::new(addr("10.2.0.9"), "svc", "k9").with_enforcing_mfa(false);
    let h = harness(3, vec![d1(), open]);
    h.gateway.reconcile().await?;
    let d = addr("10.2.0.1");

    h.gateway.record_failure(d).await?;
    assert_enforcement_matches(&h);
    h.gateway.record_success(d, None).await?;
    assert_enforcement_matches(&h);
    h.gateway.admin_lock(addr("10.2.0.9")).await?;
    assert_enforcement_matches(&h);
    // Reset unlocks a device without MFA and restores its access.
    assert_eq!(
        h.gateway.admin_reset(addr("10.2.0.9")).await?,
        AuthorizationState::Authenticated
    );
    assert_enforcement_matches(&h);
    // And is a no-op once it is unlocked.
    let before = h.network.mutation_count();
    h.gateway.admin_reset(addr("10.2.0.9")).await?;
    assert_eq!(h.network.mutation_count(), before);
    Ok(())
}

#[tokio::test]
async fn test_audit_records_transitions() -> TestResult {
    let h = harness(2, vec![d1()]);
    let d = addr("10.2.0.1");
    h.gateway.record_failure(d).await?;
    h.gateway.record_failure(d).await?;

    let events: Vec<String> = h
        .gateway
        .audit()
        .entries_for(d)
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert!(events.contains(&"AUTH_FAILURE".to_string()));
    assert!(events.contains(&"LOCKOUT".to_string()));
    assert!(events.contains(&"REVOKE".to_string()));
    Ok(())
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_lock_survives_restart_with_file_store() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("devices.json");
    let d = addr("10.2.0.1");

    let config = Config {
        lockout: 3,
        ..Config::default()
    };
    {
        let store = JsonFileStore::open(&path)?;
        store.insert(d1())?;
        let gateway = Gateway::new(
            &config,
            Arc::new(store),
            Arc::new(MemoryNetwork::new()),
            Arc::new(AuditLogger::in_memory()),
        );
        gateway.record_success(d, None).await?;
        gateway.admin_lock(d).await?;
    }

    let network = Arc::new(MemoryNetwork::new());
    let gateway = Gateway::new(
        &config,
        Arc::new(JsonFileStore::open(&path)?),
        Arc::clone(&network) as Arc<dyn NetworkLayer>,
        Arc::new(AuditLogger::in_memory()),
    );
    gateway.reconcile().await?;
    assert_eq!(gateway.state(d)?, AuthorizationState::Locked);
    assert!(!network.is_reachable(d));
    Ok(())
}

// =============================================================================
// Control plane
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_socket_round_trip() -> TestResult {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("wag.sock");
    let h = harness(3, vec![d1(), Device::new(addr("10.2.0.2"), "bob", "k2")]);

    let server = ControlServer::bind(&socket, Arc::clone(&h.gateway)).await?;
    let server_task = tokio::spawn(server.run());
    let client = ControlClient::new(&socket).with_timeout(Duration::from_secs(5));

    let listing = client.list_devices().await?;
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines[0], "username,address,publickey,enforcingmfa,authattempts");
    assert_eq!(lines[1], "alice,10.2.0.1,cHVibGljLWtleS1kMQ==,true,0");
    assert_eq!(lines.len(), 3);

    let state = client
        .call(Request::AuthSuccess {
            address: "10.2.0.1".into(),
            endpoint: Some("203.0.113.8:51820".into()),
        })
        .await?;
    assert_eq!(state, "AUTHENTICATED");
    assert_eq!(
        client.sessions().await?,
        "vpn_address,actual_endpoint\n10.2.0.1,203.0.113.8:51820"
    );

    assert_eq!(client.lock("10.2.0.1").await?, OK_BODY);
    assert!(!h.network.is_reachable(addr("10.2.0.1")));

    match client.call(Request::AuthSuccess { address: "10.2.0.1".into(), endpoint: None }).await {
        Err(ControlError::Remote(e)) => assert_eq!(e.kind(), ErrorKind::InvalidTransition),
        other => panic!("expected invalid transition, got {:?}", other),
    }

    assert_eq!(client.reset("10.2.0.1").await?, OK_BODY);
    assert_eq!(client.block("10.2.0.2").await?, OK_BODY);
    match client.block("10.2.0.2").await {
        Err(ControlError::Remote(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
        other => panic!("expected not found, got {:?}", other),
    }

    let response = client.send(&Request::Lock { address: "bogus".into() }).await?;
    assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));

    h.gateway.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), server_task).await???;
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_server_reports_already_running() -> TestResult {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("wag.sock");
    let h = harness(3, vec![d1()]);

    let server = ControlServer::bind(&socket, Arc::clone(&h.gateway)).await?;
    let server_task = tokio::spawn(server.run());

    let second = harness(3, vec![d1()]);
    match ControlServer::bind(&socket, Arc::clone(&second.gateway)).await {
        Err(ControlError::AlreadyRunning(path)) => assert_eq!(path, socket),
        Err(e) => panic!("expected AlreadyRunning, got {}", e),
        Ok(_) => panic!("second bind should fail"),
    }

    h.gateway.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), server_task).await???;
    Ok(())
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() -> TestResult {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("wag.sock");
    std::fs::write(&socket, b"")?;

    let h = harness(3, vec![d1()]);
    let server = ControlServer::bind(&socket, Arc::clone(&h.gateway)).await?;
    assert_eq!(server.path(), socket.as_path());
    Ok(())
}
