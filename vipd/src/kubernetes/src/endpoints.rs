use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::watch;

use crate::context::Scope;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
const MIN_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A view of the service's endpoints that live on this node and are
/// serving. With `ExternalTrafficPolicy=Local` a node may advertise the
/// VIP only while this set is non-empty.
pub struct EndpointTracker {
    pub rx: watch::Receiver<BTreeSet<IpAddr>>,
}

#[derive(Clone)]
pub enum EndpointBackend {
    Kube(KubeEndpoints),
    Mock(Arc<MockEndpoints>),
}

#[derive(Clone)]
pub struct KubeEndpoints {
    pub client: Client,
    pub use_slices: bool,
    pub node_name: String,
}

impl EndpointBackend {
    pub fn track(&self, scope: &Scope, namespace: &str, service: &str) -> EndpointTracker {
        match self {
            EndpointBackend::Kube(k) => {
                let (tx, rx) = watch::channel(BTreeSet::new());
                let scope = scope.clone();
                let k = k.clone();
                let namespace = namespace.to_string();
                let service = service.to_string();
                tokio::spawn(async move {
                    if k.use_slices {
                        run_slice_tracker(k, scope, namespace, service, tx).await
                    } else {
                        run_endpoints_tracker(k, scope, namespace, service, tx).await
                    }
                });
                EndpointTracker { rx }
            }
            EndpointBackend::Mock(m) => m.track(namespace, service),
        }
    }
}

pub fn local_endpoints_from_slice(eps: &EndpointSlice, node: &str) -> BTreeSet<IpAddr> {
    let mut out = BTreeSet::new();
    for ep in eps.endpoints.iter() {
        if ep.node_name.as_deref() != Some(node) {
            continue;
        }
        // terminating endpoints keep serving until they are gone
        let serving = ep
            .conditions
            .as_ref()
            .and_then(|c| c.serving.or(c.ready))
            .unwrap_or(false);
        if !serving {
            continue;
        }
        for addr in ep.addresses.iter() {
            if let Ok(ip) = IpAddr::from_str(addr) {
                out.insert(ip);
            }
        }
    }
    out
}

pub fn local_endpoints_from_endpoints(ep: &Endpoints, node: &str) -> BTreeSet<IpAddr> {
    let mut out = BTreeSet::new();
    if let Some(subsets) = ep.subsets.as_ref() {
        for subset in subsets.iter() {
            let Some(addresses) = subset.addresses.as_ref() else {
                continue;
            };
            for addr in addresses.iter() {
                if addr.node_name.as_deref() != Some(node) {
                    continue;
                }
                if let Ok(ip) = IpAddr::from_str(&addr.ip) {
                    out.insert(ip);
                }
            }
        }
    }
    out
}

async fn run_slice_tracker(
    k: KubeEndpoints,
    scope: Scope,
    namespace: String,
    service: String,
    tx: watch::Sender<BTreeSet<IpAddr>>,
) {
    let api: Api<EndpointSlice> = Api::namespaced(k.client.clone(), &namespace);
    let selector = format!("{SERVICE_NAME_LABEL}={service}");
    let lp = ListParams::default().labels(&selector);
    let wp = WatchParams::default().labels(&selector);

    let mut slices: HashMap<String, BTreeSet<IpAddr>> = HashMap::new();
    let mut backoff = MIN_BACKOFF;
    loop {
        if scope.is_cancelled() {
            return;
        }
        // list to seed both the state and the watch version
        let list = tokio::select! {
            _ = scope.cancelled() => return,
            res = api.list(&lp) => match res {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(error=?e, service = service, "failed to list endpointslices");
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        };
        backoff = MIN_BACKOFF;
        let version = list.metadata.resource_version.unwrap_or_else(|| "0".to_string());
        slices.clear();
        for eps in list.items.iter() {
            slices.insert(eps.name_any(), local_endpoints_from_slice(eps, &k.node_name));
        }
        publish(&tx, &slices);

        let mut stream: BoxStream<'_, kube::Result<WatchEvent<EndpointSlice>>> =
            match api.watch(&wp, &version).await {
                Ok(s) => s.boxed(),
                Err(e) => {
                    tracing::warn!(error=?e, service = service, "failed to watch endpointslices");
                    continue;
                }
            };
        loop {
            let item = tokio::select! {
                _ = scope.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(WatchEvent::Added(eps))) | Some(Ok(WatchEvent::Modified(eps))) => {
                    slices.insert(eps.name_any(), local_endpoints_from_slice(&eps, &k.node_name));
                    publish(&tx, &slices);
                }
                Some(Ok(WatchEvent::Deleted(eps))) => {
                    slices.remove(&eps.name_any());
                    publish(&tx, &slices);
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Ok(WatchEvent::Error(e))) => {
                    tracing::warn!(error = e.message, service = service, "endpointslice watch error");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error=?e, service = service, "endpointslice watch stream error");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn run_endpoints_tracker(
    k: KubeEndpoints,
    scope: Scope,
    namespace: String,
    service: String,
    tx: watch::Sender<BTreeSet<IpAddr>>,
) {
    let api: Api<Endpoints> = Api::namespaced(k.client.clone(), &namespace);
    let selector = format!("metadata.name={service}");
    let lp = ListParams::default().fields(&selector);
    let wp = WatchParams::default().fields(&selector);

    let mut backoff = MIN_BACKOFF;
    loop {
        if scope.is_cancelled() {
            return;
        }
        let list = tokio::select! {
            _ = scope.cancelled() => return,
            res = api.list(&lp) => match res {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(error=?e, service = service, "failed to list endpoints");
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        };
        backoff = MIN_BACKOFF;
        let version = list.metadata.resource_version.unwrap_or_else(|| "0".to_string());
        let mut local = BTreeSet::new();
        for ep in list.items.iter() {
            local = local_endpoints_from_endpoints(ep, &k.node_name);
        }
        let _ = tx.send(local);

        let mut stream: BoxStream<'_, kube::Result<WatchEvent<Endpoints>>> =
            match api.watch(&wp, &version).await {
                Ok(s) => s.boxed(),
                Err(e) => {
                    tracing::warn!(error=?e, service = service, "failed to watch endpoints");
                    continue;
                }
            };
        loop {
            let item = tokio::select! {
                _ = scope.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(WatchEvent::Added(ep))) | Some(Ok(WatchEvent::Modified(ep))) => {
                    let _ = tx.send(local_endpoints_from_endpoints(&ep, &k.node_name));
                }
                Some(Ok(WatchEvent::Deleted(_))) => {
                    let _ = tx.send(BTreeSet::new());
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Ok(WatchEvent::Error(e))) => {
                    tracing::warn!(error = e.message, service = service, "endpoints watch error");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error=?e, service = service, "endpoints watch stream error");
                    break;
                }
                None => break,
            }
        }
    }
}

fn publish(tx: &watch::Sender<BTreeSet<IpAddr>>, slices: &HashMap<String, BTreeSet<IpAddr>>) {
    let union: BTreeSet<IpAddr> = slices.values().flatten().copied().collect();
    let _ = tx.send(union);
}

/// Test endpoint source; local sets are pushed by the test.
#[derive(Debug, Default)]
pub struct MockEndpoints {
    inner: Mutex<HashMap<String, watch::Sender<BTreeSet<IpAddr>>>>,
}

impl MockEndpoints {
    fn track(&self, namespace: &str, service: &str) -> EndpointTracker {
        let (tx, rx) = watch::channel(BTreeSet::new());
        self.inner
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{service}"), tx);
        EndpointTracker { rx }
    }

    pub fn set_local(&self, namespace: &str, service: &str, addrs: BTreeSet<IpAddr>) {
        if let Some(tx) = self
            .inner
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{service}"))
        {
            let _ = tx.send(addrs);
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::endpoint_slice;
    use rstest::rstest;

    #[rstest(
        endpoints,
        node,
        expected,
        case(vec![("10.1.0.5", "node0", true)], "node0", vec!["10.1.0.5"]),
        case(vec![("10.1.0.5", "node1", true)], "node0", vec![]),
        case(vec![("10.1.0.5", "node0", false)], "node0", vec![]),
        case(
            vec![("10.1.0.5", "node0", true), ("10.1.0.6", "node0", true), ("10.1.0.7", "node1", true)],
            "node0",
            vec!["10.1.0.5", "10.1.0.6"],
        ),
    )]
    fn works_local_endpoints_from_slice(
        endpoints: Vec<(&str, &str, bool)>,
        node: &str,
        expected: Vec<&str>,
    ) {
        let eps = endpoint_slice("svc1-abc", "default", "svc1", &endpoints);
        let got = local_endpoints_from_slice(&eps, node);
        let want: BTreeSet<IpAddr> = expected
            .iter()
            .map(|a| IpAddr::from_str(a).unwrap())
            .collect();
        assert_eq!(got, want);
    }
}
