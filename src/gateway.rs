// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The gateway core.
//!
//! [`Gateway`] is the one entry point through which every source of change
//! reaches device state: control-plane commands, authentication outcomes,
//! traffic observations, the expiry sweep and reconciliation. Each
//! operation on an address runs entirely under that address's lock:
//!
//! 1. read the device from the store
//! 2. plan the transition ([`crate::authz::StateMachine`])
//! 3. commit the counter with compare-and-set
//! 4. update the session tracker
//! 5. apply enforcement ([`crate::enforcement::Enforcer`])
//!
//! so enforcement is always applied in the order transitions were committed.
//! Operations on different addresses run concurrently. A process-wide
//! reader/writer lock orders per-device work against setup and teardown,
//! which rewrite global rule state.
//!
//! Store calls run on the blocking pool, so a store waiting on a file lock
//! holds up only the device whose critical section made the call.
//!
//! A failed store call aborts before anything is written. A failed network
//! call after the commit is returned as [`GatewayError::Network`] but the
//! committed state stands; reconcile heals the drift.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};

use crate::audit::AuditLogger;
use crate::authz::{Enforcement, StateMachine, Transition};
use crate::config::Config;
use crate::enforcement::{Correction, Enforcer};
use crate::error::{GatewayError, GatewayResult, StoreError};
use crate::network::NetworkLayer;
use crate::security::DeviceLocks;
use crate::session::{SessionSnapshot, SessionTracker};
use crate::store::DeviceStore;
use crate::types::{AuthorizationState, Device, DeviceAddress};

/// Compare-and-set rounds before giving up on a contended counter.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Result of one reconcile pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Devices examined
    pub checked: usize,
    pub corrections: Vec<Correction>,
    /// Addresses that could not be converged, with the reason
    pub failures: Vec<(DeviceAddress, GatewayError)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty() && self.failures.is_empty()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked={} corrections={} failures={}",
            self.checked,
            self.corrections.len(),
            self.failures.len()
        )
    }
}

/// Result of one expiry sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<DeviceAddress>,
    pub failures: Vec<(DeviceAddress, GatewayError)>,
}

pub struct Gateway {
    store: Arc<dyn DeviceStore>,
    enforcer: Enforcer,
    sessions: SessionTracker,
    locks: DeviceLocks,
    /// Per-device operations hold it shared; setup and teardown hold it exclusively.
    rules: RwLock<()>,
    machine: StateMachine,
    audit: Arc<AuditLogger>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(
        config: &Config,
        store: Arc<dyn DeviceStore>,
        network: Arc<dyn NetworkLayer>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            enforcer: Enforcer::new(network, Arc::clone(&audit), config.enforcement_retries),
            sessions: SessionTracker::new(config.session_timeout()),
            locks: DeviceLocks::new(),
            rules: RwLock::new(()),
            machine: StateMachine::new(config.lockout),
            audit,
            shutdown,
        }
    }

    /// Override the network retry backoff.
    pub fn with_retry_backoff(mut self, base: std::time::Duration, max: std::time::Duration) -> Self {
        self.enforcer = self.enforcer.with_backoff(base, max);
        self
    }

    pub fn lockout(&self) -> u32 {
        self.machine.lockout()
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn session_tracker(&self) -> &SessionTracker {
        &self.sessions
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ask background passes and the control server to stop. In-flight
    /// per-device operations still run to completion.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn check_shutdown(&self) -> GatewayResult<()> {
        if self.is_shutting_down() {
            Err(GatewayError::ShutdownRequested)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Run a store call on the blocking pool, off the async workers.
    async fn store_call<T, F>(&self, call: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DeviceStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?;
        Ok(result?)
    }

    async fn fetch(&self, address: DeviceAddress) -> GatewayResult<Device> {
        self.store_call(move |store| store.get(address))
            .await?
            .ok_or_else(|| GatewayError::device_not_found(address))
    }

    fn load(&self, address: DeviceAddress) -> GatewayResult<Device> {
        self.store
            .get(address)?
            .ok_or_else(|| GatewayError::device_not_found(address))
    }

    /// Blocking read of one record; use for display and tests.
    pub fn device(&self, address: DeviceAddress) -> GatewayResult<Device> {
        self.load(address)
    }

    /// Current derived state. Unlocked read; use for display and tests.
    pub fn state(&self, address: DeviceAddress) -> GatewayResult<AuthorizationState> {
        let device = self.load(address)?;
        Ok(self.machine.derive(&device, self.sessions.contains(address)))
    }

    /// Snapshot of every device record. Blocking; async callers use
    /// [`Gateway::devices`].
    pub fn list_devices(&self) -> GatewayResult<Vec<Device>> {
        Ok(self.store.list()?)
    }

    /// Snapshot of every device record, read on the blocking pool.
    pub async fn devices(&self) -> GatewayResult<Vec<Device>> {
        self.store_call(|store| store.list()).await
    }

    /// Point-in-time list of live sessions.
    pub fn sessions(&self) -> SessionSnapshot {
        self.sessions.snapshot()
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Plan against the stored record and commit the counter with
    /// compare-and-set, re-planning if another writer moved it first.
    async fn commit<F>(&self, mut device: Device, plan: F) -> GatewayResult<(Device, Transition)>
    where
        F: Fn(&Device) -> GatewayResult<Transition>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let transition = plan(&device)?;
            let Some(new) = transition.attempts else {
                return Ok((device, transition));
            };
            let (address, expected) = (device.address, device.attempts);
            match self
                .store_call(move |store| store.compare_and_set_attempts(address, expected, new))
                .await?
            {
                None => return Err(GatewayError::device_not_found(device.address)),
                Some(current) if current == device.attempts => {
                    device.attempts = new;
                    return Ok((device, transition));
                }
                Some(current) => {
                    tracing::debug!(
                        target: "gateway",
                        address = %device.address,
                        expected = device.attempts,
                        current,
                        "Attempt counter moved underneath us; re-planning"
                    );
                    device.attempts = current;
                }
            }
        }
        Err(GatewayError::Store(StoreError::Conflict(format!(
            "attempt counter for {} kept changing",
            device.address
        ))))
    }

    fn audit_transition(&self, device: &Device, transition: &Transition) {
        tracing::info!(
            target: "gateway",
            address = %device.address,
            event = transition.event.as_str(),
            from = %transition.from,
            to = %transition.to,
            attempts = device.attempts,
            "Device transition"
        );
        self.audit.record(
            transition.event.as_str(),
            Some(device.address),
            format!(
                "attempts={} state={}->{}",
                device.attempts, transition.from, transition.to
            ),
        );
    }

    async fn enforce(&self, address: DeviceAddress, enforcement: Enforcement, reason: &str) -> GatewayResult<()> {
        match enforcement {
            Enforcement::Grant => self.enforcer.grant(address).await?,
            Enforcement::Revoke => {
                self.enforcer.revoke(&self.sessions, address, reason).await?;
            }
            Enforcement::Unchanged => {}
        }
        Ok(())
    }

    /// MFA succeeded for `address`.
    pub async fn record_success(
        &self,
        address: DeviceAddress,
        endpoint: Option<SocketAddr>,
    ) -> GatewayResult<AuthorizationState> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        let device = self.fetch(address).await?;
        let has_session = self.sessions.contains(address);
        let (device, transition) = self
            .commit(device, |d| self.machine.record_success(d, has_session))
            .await?;
        self.audit_transition(&device, &transition);

        if transition.open_session {
            self.sessions.open(address, endpoint);
        }
        self.enforce(address, transition.enforcement, "authenticated").await?;
        Ok(transition.to)
    }

    /// MFA failed for `address`.
    pub async fn record_failure(&self, address: DeviceAddress) -> GatewayResult<AuthorizationState> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        let device = self.fetch(address).await?;
        let has_session = self.sessions.contains(address);
        let (device, transition) =
            self.commit(device, |d| Ok(self.machine.record_failure(d, has_session))).await?;
        self.audit_transition(&device, &transition);

        self.enforce(address, transition.enforcement, "locked").await?;
        Ok(transition.to)
    }

    /// Administrator lock. Idempotent.
    pub async fn admin_lock(&self, address: DeviceAddress) -> GatewayResult<AuthorizationState> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        let device = self.fetch(address).await?;
        let has_session = self.sessions.contains(address);
        let (device, transition) = self
            .commit(device, |d| Ok(self.machine.admin_lock(d, has_session)))
            .await?;
        self.audit_transition(&device, &transition);

        self.enforce(address, transition.enforcement, "admin lock").await?;
        Ok(transition.to)
    }

    /// Administrator reset of the failure counter.
    pub async fn admin_reset(&self, address: DeviceAddress) -> GatewayResult<AuthorizationState> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        let device = self.fetch(address).await?;
        let has_session = self.sessions.contains(address);
        let (device, transition) = self
            .commit(device, |d| Ok(self.machine.admin_reset(d, has_session)))
            .await?;

        if transition.is_noop() {
            tracing::info!(
                target: "gateway",
                %address,
                "Reset has no effect on a device without MFA that is not locked"
            );
            self.audit.record("ADMIN_RESET_NOOP", Some(address), "enforcing_mfa=false");
            return Ok(transition.to);
        }

        self.audit_transition(&device, &transition);
        self.enforce(address, transition.enforcement, "admin reset").await?;
        Ok(transition.to)
    }

    /// Remove a device and everything the network knows about it.
    pub async fn admin_delete(&self, address: DeviceAddress) -> GatewayResult<()> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        if !self.store_call(move |store| store.delete(address)).await? {
            return Err(GatewayError::device_not_found(address));
        }
        tracing::info!(target: "gateway", %address, "Device deleted");
        self.audit.record("DEVICE_DELETED", Some(address), "");

        // Attempt both steps even if the first fails, then report the first error.
        let revoked = self.enforcer.revoke(&self.sessions, address, "deleted").await;
        let removed = self.enforcer.remove_peer(address).await;
        revoked?;
        removed?;
        Ok(())
    }

    /// Traffic or a handshake was observed from `address` at `endpoint`.
    ///
    /// Refreshes an existing session. A session is only created here for
    /// devices that need no MFA; MFA devices get theirs from
    /// [`Gateway::record_success`]. Returns whether a session exists now.
    pub async fn touch(&self, address: DeviceAddress, endpoint: SocketAddr) -> GatewayResult<bool> {
        let _rules = self.rules.read().await;
        let _guard = self.locks.acquire(address).await;

        let device = self.fetch(address).await?;
        if device.is_locked(self.machine.lockout()) {
            // Sessions never outlive a lock; heal if one slipped through.
            if self.sessions.remove(address, "locked").is_some() {
                tracing::warn!(target: "gateway", %address, "Removed session held by a locked device");
            }
            return Ok(false);
        }

        if self.sessions.refresh(address, Some(endpoint)).is_some() {
            return Ok(true);
        }

        if !device.enforcing_mfa {
            let event = self.sessions.open(address, Some(endpoint));
            self.audit.record(event.name(), Some(address), event.to_audit_string());
            return Ok(true);
        }

        tracing::debug!(target: "gateway", %address, "Ignoring traffic from unauthenticated device");
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Background passes
    // ------------------------------------------------------------------

    /// Expire sessions idle past the timeout at `now`.
    ///
    /// MFA devices lose reachability until they authenticate again; devices
    /// without MFA only lose the tracking entry. Stops between devices if
    /// shutdown is requested.
    pub async fn expire_sessions(&self, now: Instant) -> GatewayResult<SweepReport> {
        let mut report = SweepReport::default();

        for address in self.sessions.idle_addresses(now) {
            self.check_shutdown()?;
            let _rules = self.rules.read().await;
            let _guard = self.locks.acquire(address).await;

            let Some(event) = self.sessions.expire_if_idle(address, now) else {
                continue;
            };
            self.audit.record(event.name(), Some(address), event.to_audit_string());
            report.expired.push(address);

            let revoke = match self.store_call(move |store| store.get(address)).await {
                Ok(Some(device)) => device.enforcing_mfa,
                Ok(None) => true,
                Err(e) => {
                    // Fail closed; reconcile restores access if it was wrong.
                    tracing::warn!(target: "gateway", %address, error = %e, "Store read failed during expiry");
                    true
                }
            };
            if revoke {
                if let Err(e) = self.enforcer.revoke(&self.sessions, address, "expired").await {
                    report.failures.push((address, e.into()));
                }
            }
        }

        if !report.expired.is_empty() {
            tracing::info!(
                target: "gateway",
                expired = report.expired.len(),
                failures = report.failures.len(),
                "Session expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Full resynchronization of enforcement against the store.
    ///
    /// Every device is converged under its own lock, so a transition that
    /// commits while the pass is running is never undone: either it ran
    /// first and the pass sees its result, or it runs after and wins.
    pub async fn reconcile(&self) -> GatewayResult<ReconcileReport> {
        let _rules = self.rules.read().await;
        let network = Arc::clone(self.enforcer.network());

        let devices = self.store_call(|store| store.list()).await?;
        let reachable = network.list_reachable().await?;
        let peers = match network.list_peers().await {
            Ok(peers) => Some(peers),
            Err(e) => {
                tracing::warn!(target: "gateway", error = %e, "Could not list peers; skipping peer cleanup");
                None
            }
        };

        let mut report = ReconcileReport::default();
        let known: BTreeSet<DeviceAddress> = devices.iter().map(|d| d.address).collect();

        for device in &devices {
            self.check_shutdown()?;
            let address = device.address;
            let _guard = self.locks.acquire(address).await;
            report.checked += 1;

            // Re-read the record and the allow-list entry under the lock; both
            // listings above may predate a transition that finished meanwhile.
            let fresh = match self.store_call(move |store| store.get(address)).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    report.failures.push((address, e));
                    continue;
                }
            };
            let actual = match network.query_reachable(address).await {
                Ok(actual) => actual,
                Err(e) => {
                    report.failures.push((address, e.into()));
                    continue;
                }
            };
            let desired = match &fresh {
                Some(device) => {
                    if device.is_locked(self.machine.lockout()) {
                        self.sessions.remove(address, "locked");
                    }
                    self.machine.desired_reachable(device, self.sessions.contains(address))
                }
                None => false,
            };

            match self
                .enforcer
                .converge(&self.sessions, address, desired, actual)
                .await
            {
                Ok(Some(correction)) => report.corrections.push(correction),
                Ok(None) => {}
                Err(e) => report.failures.push((address, e.into())),
            }
        }

        // Anything the network or the tracker knows that the store does not.
        let mut strays: BTreeSet<DeviceAddress> = reachable.difference(&known).copied().collect();
        strays.extend(self.sessions.addresses().into_iter().filter(|a| !known.contains(a)));
        for address in strays {
            self.check_shutdown()?;
            let _guard = self.locks.acquire(address).await;
            if matches!(self.store_call(move |store| store.get(address)).await, Ok(Some(_))) {
                continue;
            }
            match self.enforcer.revoke(&self.sessions, address, "unknown device").await {
                Ok(_) => report.corrections.push(Correction::Revoked(address)),
                Err(e) => report.failures.push((address, e.into())),
            }
        }

        if let Some(peers) = peers {
            for address in peers.difference(&known).copied() {
                self.check_shutdown()?;
                let _guard = self.locks.acquire(address).await;
                if matches!(self.store_call(move |store| store.get(address)).await, Ok(Some(_))) {
                    continue;
                }
                match self.enforcer.remove_peer(address).await {
                    Ok(()) => report.corrections.push(Correction::PeerRemoved(address)),
                    Err(e) => report.failures.push((address, e.into())),
                }
            }
        }

        self.locks.prune();

        for correction in &report.corrections {
            self.audit.record(
                "RECONCILE_CORRECTION",
                Some(correction.address()),
                format!("action={}", correction.as_str()),
            );
        }
        if report.is_clean() {
            tracing::debug!(target: "gateway", %report, "Reconcile found no drift");
        } else {
            tracing::info!(target: "gateway", %report, "Reconcile finished");
            self.audit.record("RECONCILE", None, report.to_string());
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Install global network state. Call once before [`Gateway::reconcile`].
    pub async fn setup_network(&self) -> GatewayResult<()> {
        let _rules = self.rules.write().await;
        self.enforcer.network().setup().await?;
        self.audit.record("NETWORK_SETUP", None, "");
        Ok(())
    }

    /// Drop all sessions and release network resources.
    pub async fn teardown(&self) -> GatewayResult<()> {
        self.request_shutdown();
        let _rules = self.rules.write().await;
        let dropped = self.sessions.clear();
        self.enforcer.network().teardown().await?;
        tracing::info!(target: "gateway", sessions = dropped, "Network state torn down");
        self.audit.record("TEARDOWN", None, format!("sessions={}", dropped));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::network::MemoryNetwork;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    fn fixture(devices: Vec<Device>) -> (Gateway, Arc<MemoryStore>, Arc<MemoryNetwork>) {
        let config = Config {
            lockout: 3,
            enforcement_retries: 1,
            session_timeout_secs: 60,
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
        (gateway, store, network)
    }

    fn mfa(address: &str) -> Device {
        Device::new(addr(address), "alice", format!("key-{}", address))
    }

    /// Allow-list listing frozen at construction; per-address queries see
    /// the live table.
    struct StaleListing {
        inner: Arc<MemoryNetwork>,
        listed: BTreeSet<DeviceAddress>,
    }

    #[async_trait::async_trait]
    impl NetworkLayer for StaleListing {
        async fn setup(&self) -> Result<(), NetworkError> {
            self.inner.setup().await
        }

        async fn set_reachable(&self, address: DeviceAddress, reachable: bool) -> Result<(), NetworkError> {
            self.inner.set_reachable(address, reachable).await
        }

        async fn remove_peer(&self, address: DeviceAddress) -> Result<(), NetworkError> {
            self.inner.remove_peer(address).await
        }

        async fn list_peers(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
            self.inner.list_peers().await
        }

        async fn list_reachable(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
            Ok(self.listed.clone())
        }

        async fn query_reachable(&self, address: DeviceAddress) -> Result<bool, NetworkError> {
            self.inner.query_reachable(address).await
        }

        async fn teardown(&self) -> Result<(), NetworkError> {
            self.inner.teardown().await
        }
    }

    /// Reads of one address hold the calling thread, as a contended file
    /// lock would.
    struct SlowStore {
        inner: MemoryStore,
        slow: DeviceAddress,
        delay: Duration,
    }

    impl DeviceStore for SlowStore {
        fn get(&self, address: DeviceAddress) -> Result<Option<Device>, StoreError> {
            if address == self.slow {
                std::thread::sleep(self.delay);
            }
            self.inner.get(address)
        }

        fn list(&self) -> Result<Vec<Device>, StoreError> {
            self.inner.list()
        }

        fn insert(&self, device: Device) -> Result<(), StoreError> {
            self.inner.insert(device)
        }

        fn set_attempts(&self, address: DeviceAddress, attempts: u32) -> Result<bool, StoreError> {
            self.inner.set_attempts(address, attempts)
        }

        fn compare_and_set_attempts(
            &self,
            address: DeviceAddress,
            expected: u32,
            new: u32,
        ) -> Result<Option<u32>, StoreError> {
            self.inner.compare_and_set_attempts(address, expected, new)
        }

        fn delete(&self, address: DeviceAddress) -> Result<bool, StoreError> {
            self.inner.delete(address)
        }
    }

    #[tokio::test]
    async fn test_store_failure_aborts_without_write() {
        let (gateway, store, network) = fixture(vec![mfa("10.0.0.2")]);
        store.set_unavailable(true);
        let err = gateway.record_failure(addr("10.0.0.2")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
        store.set_unavailable(false);
        assert_eq!(gateway.device(addr("10.0.0.2")).unwrap().attempts, 0);
        assert_eq!(network.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_committed_state() {
        let (gateway, _store, network) = fixture(vec![mfa("10.0.0.2")]);
        network.set_failing(true);
        let err = gateway.record_success(addr("10.0.0.2"), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert_eq!(gateway.state(addr("10.0.0.2")).unwrap(), AuthorizationState::Authenticated);

        network.set_failing(false);
        let report = gateway.reconcile().await.unwrap();
        assert_eq!(report.corrections, vec![Correction::Granted(addr("10.0.0.2"))]);
        assert!(network.is_reachable(addr("10.0.0.2")));
    }

    #[tokio::test]
    async fn test_touch_only_creates_sessions_without_mfa() {
        let open = Device::new(addr("10.0.0.3"), "bob", "b").with_enforcing_mfa(false);
        let (gateway, _store, _network) = fixture(vec![mfa("10.0.0.2"), open]);
        let endpoint: SocketAddr = "203.0.113.5:51820".parse().unwrap();

        assert!(!gateway.touch(addr("10.0.0.2"), endpoint).await.unwrap());
        assert!(gateway.touch(addr("10.0.0.3"), endpoint).await.unwrap());

        gateway.record_success(addr("10.0.0.2"), None).await.unwrap();
        assert!(gateway.touch(addr("10.0.0.2"), endpoint).await.unwrap());
        assert_eq!(
            gateway.session_tracker().get(addr("10.0.0.2")).unwrap().endpoint,
            Some(endpoint)
        );
    }

    #[tokio::test]
    async fn test_touch_unknown_device() {
        let (gateway, _store, _network) = fixture(vec![]);
        let err = gateway
            .touch(addr("10.0.0.9"), "203.0.113.5:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expiry_revokes_only_mfa_devices() {
        let open = Device::new(addr("10.0.0.3"), "bob", "b").with_enforcing_mfa(false);
        let (gateway, _store, network) = fixture(vec![mfa("10.0.0.2"), open]);
        gateway.reconcile().await.unwrap();
        gateway.record_success(addr("10.0.0.2"), None).await.unwrap();
        gateway
            .touch(addr("10.0.0.3"), "203.0.113.5:51820".parse().unwrap())
            .await
            .unwrap();

        let later = Instant::now() + Duration::from_secs(120);
        let report = gateway.expire_sessions(later).await.unwrap();
        assert_eq!(report.expired, vec![addr("10.0.0.2"), addr("10.0.0.3")]);
        assert!(report.failures.is_empty());

        assert!(!network.is_reachable(addr("10.0.0.2")));
        assert!(network.is_reachable(addr("10.0.0.3")));
        assert_eq!(gateway.state(addr("10.0.0.2")).unwrap(), AuthorizationState::Unauthenticated);
        assert_eq!(gateway.device(addr("10.0.0.2")).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_reconcile_removes_strays() {
        let (gateway, _store, network) = fixture(vec![mfa("10.0.0.2")]);
        network.add_peer(addr("10.0.0.50"));
        network.tamper_reachable(addr("10.0.0.50"), true);
        network.tamper_reachable(addr("10.0.0.2"), true);

        let report = gateway.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.corrections.contains(&Correction::Revoked(addr("10.0.0.2"))));
        assert!(report.corrections.contains(&Correction::Revoked(addr("10.0.0.50"))));
        assert!(report.corrections.contains(&Correction::PeerRemoved(addr("10.0.0.50"))));
        assert!(network.reachable().is_empty());
        assert!(!network.has_peer(addr("10.0.0.50")));

        assert!(gateway.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_reconcile_checks_each_address_under_its_lock() {
        let open = Device::new(addr("10.0.0.2"), "bob", "b").with_enforcing_mfa(false);
        let config = Config {
            lockout: 3,
            ..Config::default()
        };
        let locked = mfa("10.0.0.3").with_attempts(3);
        let inner = Arc::new(MemoryNetwork::with_peers([addr("10.0.0.2"), addr("10.0.0.3")]));
        inner.tamper_reachable(addr("10.0.0.3"), true);

        // The listing claims the opposite of the live table for both devices.
        let network = StaleListing {
            inner: Arc::clone(&inner),
            listed: BTreeSet::from([addr("10.0.0.2")]),
        };
        let gateway = Gateway::new(
            &config,
            Arc::new(MemoryStore::with_devices([open, locked])) as Arc<dyn DeviceStore>,
            Arc::new(network) as Arc<dyn NetworkLayer>,
            Arc::new(AuditLogger::in_memory()),
        );

        let report = gateway.reconcile().await.unwrap();
        assert_eq!(
            report.corrections,
            vec![Correction::Granted(addr("10.0.0.2")), Correction::Revoked(addr("10.0.0.3"))]
        );
        assert!(inner.is_reachable(addr("10.0.0.2")));
        assert!(!inner.is_reachable(addr("10.0.0.3")));
    }

    #[tokio::test]
    async fn test_slow_store_stalls_only_its_own_device() {
        let delay = Duration::from_millis(500);
        let store = SlowStore {
            inner: MemoryStore::with_devices([mfa("10.0.0.2"), mfa("10.0.0.3")]),
            slow: addr("10.0.0.2"),
            delay,
        };
        let gateway = Gateway::new(
            &Config::default(),
            Arc::new(store) as Arc<dyn DeviceStore>,
            Arc::new(MemoryNetwork::new()) as Arc<dyn NetworkLayer>,
            Arc::new(AuditLogger::in_memory()),
        );

        // Single-threaded runtime: a store call made inline would block the
        // other device until the slow read returned.
        let started = Instant::now();
        let (slow, fast) = tokio::join!(gateway.record_failure(addr("10.0.0.2")), async {
            let state = gateway.record_failure(addr("10.0.0.3")).await;
            (state, started.elapsed())
        });

        assert_eq!(slow.unwrap(), AuthorizationState::Unauthenticated);
        let (state, elapsed) = fast;
        assert_eq!(state.unwrap(), AuthorizationState::Unauthenticated);
        assert!(elapsed < delay, "unrelated device waited {:?}", elapsed);
        assert!(started.elapsed() >= delay);
    }

    #[tokio::test]
    async fn test_reconcile_stops_on_shutdown() {
        let (gateway, _store, _network) = fixture(vec![mfa("10.0.0.2")]);
        gateway.request_shutdown();
        assert_eq!(gateway.reconcile().await.unwrap_err(), GatewayError::ShutdownRequested);
    }

    #[tokio::test]
    async fn test_teardown_clears_sessions() {
        let (gateway, _store, network) = fixture(vec![mfa("10.0.0.2")]);
        gateway.setup_network().await.unwrap();
        gateway.record_success(addr("10.0.0.2"), None).await.unwrap();
        gateway.teardown().await.unwrap();
        assert!(gateway.sessions().is_empty());
        assert!(!network.is_installed());
        assert!(gateway.is_shutting_down());
    }
}
