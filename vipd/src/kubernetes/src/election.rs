use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::watch;

use crate::context::Scope;
use crate::error::Error;

/// Consecutive transient renewal failures tolerated before the lease is
/// considered lost.
const MAX_RENEWAL_FAILURES: u32 = 3;
const RELINQUISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Deterministic per-service lease name, identical on every node.
pub fn service_lease_name(namespace: &str, name: &str) -> String {
    // fnv-1a over "namespace/name"
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in namespace.bytes().chain("/".bytes()).chain(name.bytes()) {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("vipd-{hash:016x}")
}

/// Spawns election drivers. An actor gets back a channel carrying its
/// leadership: `true` after acquisition, `false` after loss. The driver
/// lives under the scope it was spawned with and relinquishes the lease
/// when that scope is cancelled.
#[derive(Clone)]
pub enum ElectionBackend {
    Kube(KubeElections),
    Mock(Arc<MockElections>),
}

#[derive(Clone)]
pub struct KubeElections {
    pub client: Client,
    pub namespace: String,
    pub holder: String,
    pub lease_duration: u64,
    pub renew_interval: u64,
}

impl ElectionBackend {
    pub fn watch(&self, scope: &Scope, lease_name: &str) -> watch::Receiver<bool> {
        match self {
            ElectionBackend::Kube(k) => {
                let (tx, rx) = watch::channel(false);
                let election = LeaseElection {
                    api: Api::namespaced(k.client.clone(), &k.namespace),
                    lease_name: lease_name.to_string(),
                    holder: k.holder.clone(),
                    lease_duration: k.lease_duration,
                    renew_interval: Duration::from_secs(k.renew_interval),
                };
                let scope = scope.clone();
                tokio::spawn(async move { election.run(scope, tx).await });
                rx
            }
            ElectionBackend::Mock(m) => m.watch(lease_name),
        }
    }
}

/// Follower -> Candidate -> Leader -> Follower over a Kubernetes Lease.
/// Acquisition races resolve through create/replace conflicts, which the
/// API server serialises.
pub struct LeaseElection {
    api: Api<Lease>,
    lease_name: String,
    holder: String,
    lease_duration: u64,
    renew_interval: Duration,
}

impl LeaseElection {
    pub async fn run(self, scope: Scope, tx: watch::Sender<bool>) {
        tracing::info!(
            lease = self.lease_name,
            holder = self.holder,
            "starting election"
        );
        loop {
            // Candidate: poll for the lease until we hold it
            loop {
                if scope.is_cancelled() {
                    return;
                }
                match self.try_acquire().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error=?e, lease = self.lease_name, "failed to check leadership")
                    }
                }
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(self.renew_interval) => {}
                }
            }

            tracing::info!(lease = self.lease_name, "leadership acquired");
            let _ = tx.send(true);

            // Leader: renew until lost or cancelled
            let mut failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => {
                        self.relinquish().await;
                        let _ = tx.send(false);
                        return;
                    }
                    _ = tokio::time::sleep(self.renew_interval) => {}
                }
                match self.renew().await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        tracing::warn!(lease = self.lease_name, "lost leadership to another holder");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= MAX_RENEWAL_FAILURES {
                            tracing::error!(
                                error=?e,
                                lease = self.lease_name,
                                failures = failures,
                                "failed to renew the lease, dropping leadership"
                            );
                            break;
                        }
                        tracing::warn!(error=?e, lease = self.lease_name, attempt = failures, "transient lease renewal failure");
                    }
                }
            }
            let _ = tx.send(false);
        }
    }

    async fn try_acquire(&self) -> Result<bool, Error> {
        match self
            .api
            .get_opt(&self.lease_name)
            .await
            .map_err(Error::Kube)?
        {
            None => {
                let now = MicroTime(Utc::now());
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.holder.clone()),
                        lease_duration_seconds: Some(self.lease_duration as i32),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_conflict(&e) => Ok(false),
                    Err(e) => Err(Error::Kube(e)),
                }
            }
            Some(lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                if holder == self.holder {
                    return self.update(lease, false).await;
                }
                if !holder.is_empty() && !self.expired(&spec) {
                    return Ok(false);
                }
                self.update(lease, true).await
            }
        }
    }

    async fn renew(&self) -> Result<bool, Error> {
        match self
            .api
            .get_opt(&self.lease_name)
            .await
            .map_err(Error::Kube)?
        {
            None => Ok(false),
            Some(lease) => {
                let holder = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone())
                    .unwrap_or_default();
                if holder != self.holder {
                    return Ok(false);
                }
                self.update(lease, false).await
            }
        }
    }

    async fn update(&self, mut lease: Lease, takeover: bool) -> Result<bool, Error> {
        let now = MicroTime(Utc::now());
        let spec = lease.spec.get_or_insert_with(Default::default);
        if takeover {
            spec.holder_identity = Some(self.holder.clone());
            spec.acquire_time = Some(now.clone());
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.lease_duration_seconds = Some(self.lease_duration as i32);
        spec.renew_time = Some(now);
        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    fn expired(&self, spec: &LeaseSpec) -> bool {
        let duration = chrono::Duration::seconds(
            spec.lease_duration_seconds
                .unwrap_or(self.lease_duration as i32) as i64,
        );
        match spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) {
            Some(t) => t.0 + duration < Utc::now(),
            None => true,
        }
    }

    /// Best-effort release so the next holder does not have to wait out
    /// the lease duration.
    async fn relinquish(&self) {
        let released = tokio::time::timeout(RELINQUISH_TIMEOUT, async {
            if let Ok(Some(mut lease)) = self.api.get_opt(&self.lease_name).await {
                let ours = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.as_deref())
                    == Some(self.holder.as_str());
                if ours {
                    if let Some(spec) = lease.spec.as_mut() {
                        spec.holder_identity = None;
                        spec.acquire_time = None;
                        spec.renew_time = None;
                    }
                    let _ = self
                        .api
                        .replace(&self.lease_name, &PostParams::default(), &lease)
                        .await;
                }
            }
        })
        .await;
        if released.is_err() {
            tracing::warn!(lease = self.lease_name, "timed out releasing the lease");
        } else {
            tracing::info!(lease = self.lease_name, "released the lease");
        }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Channel-driven elections for tests. Senders are retained so tests can
/// flip leadership at any time.
#[derive(Debug)]
pub struct MockElections {
    auto_acquire: bool,
    inner: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl MockElections {
    pub fn new(auto_acquire: bool) -> Self {
        Self {
            auto_acquire,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn watch(&self, lease_name: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(self.auto_acquire);
        self.inner
            .lock()
            .unwrap()
            .insert(lease_name.to_string(), tx);
        rx
    }

    pub fn opened(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_leader(&self, lease_name: &str, leader: bool) {
        if let Some(tx) = self.inner.lock().unwrap().get(lease_name) {
            let _ = tx.send(leader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_lease_names_are_stable_and_distinct() {
        let a = service_lease_name("default", "svc1");
        assert_eq!(a, service_lease_name("default", "svc1"));
        assert_ne!(a, service_lease_name("default", "svc2"));
        assert_ne!(a, service_lease_name("other", "svc1"));
        assert!(a.starts_with("vipd-"));
        assert_eq!(a.len(), "vipd-".len() + 16);
    }
}
