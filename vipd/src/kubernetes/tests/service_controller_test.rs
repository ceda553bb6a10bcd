use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vipd_kubernetes::config::Config;
use vipd_kubernetes::context::Scope;
use vipd_kubernetes::controller::ServiceController;
use vipd_kubernetes::election::{service_lease_name, ElectionBackend, MockElections};
use vipd_kubernetes::endpoints::{EndpointBackend, MockEndpoints};
use vipd_kubernetes::error::Error;
use vipd_kubernetes::fixture::{
    cluster_ip_service, load_balancer_service, with_annotation, with_label, with_traffic_policy,
};
use vipd_kubernetes::metrics::Metrics;
use vipd_kubernetes::registry::InstanceRegistry;
use vipd_kubernetes::service::IGNORE_ANNOTATION;
use vipd_kubernetes::watcher::{ServiceEvent, ServiceEventSource};
use vipd_net::mock::{HostEvent, MockHost};
use vipd_net::{AddressManager, Advertiser};

struct Harness {
    events: mpsc::Sender<ServiceEvent>,
    host: Arc<MockHost>,
    elections: Arc<MockElections>,
    endpoints: Arc<MockEndpoints>,
    registry: Arc<InstanceRegistry>,
    metrics: Metrics,
    scope: Scope,
    task: JoinHandle<Result<(), Error>>,
}

fn arp_config() -> Config {
    Config {
        node_name: "node0".to_string(),
        interface: "eth0".to_string(),
        ..Default::default()
    }
}

fn bgp_config() -> Config {
    Config {
        node_name: "node0".to_string(),
        interface: "eth0".to_string(),
        enable_arp: false,
        enable_bgp: true,
        enable_services_election: false,
        ..Default::default()
    }
}

fn start(config: Config) -> Harness {
    start_with(config, true)
}

fn start_with(config: Config, auto_acquire: bool) -> Harness {
    let (events, rx) = mpsc::channel(64);
    let host = Arc::new(MockHost::default());
    let elections = Arc::new(MockElections::new(auto_acquire));
    let endpoints = Arc::new(MockEndpoints::default());
    let registry = Arc::new(InstanceRegistry::default());
    let metrics = Metrics::default();
    let scope = Scope::new();

    let controller = ServiceController::new(
        Arc::new(config),
        scope.clone(),
        registry.clone(),
        ServiceEventSource::Mock(rx),
        AddressManager::Mock(host.clone()),
        Advertiser::Mock(host.clone()),
        ElectionBackend::Mock(elections.clone()),
        None,
        EndpointBackend::Mock(endpoints.clone()),
        metrics.clone(),
    );
    let task = tokio::spawn(controller.run());

    Harness {
        events,
        host,
        elections,
        endpoints,
        registry,
        metrics,
        scope,
        task,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ip(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap()
}

#[tokio::test]
async fn arp_leader_binds_and_advertises() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    assert_eq!(
        h.elections.opened(),
        vec![service_lease_name("default", "svc1")]
    );
    assert!(h.host.announce_count(ip("10.0.0.5")) >= 1);
    assert!(h.host.announced().contains(&ip("10.0.0.5")));
    assert_eq!(h.registry.len(), 1);
}

#[tokio::test]
async fn bgp_without_election_advertises_on_every_node() {
    // three independent agents observing the same service
    let mut harnesses = Vec::new();
    for _ in 0..3 {
        let h = start(bgp_config());
        h.host.set_bind_addresses(false);
        let svc = load_balancer_service("svc2", "default", "u2", &["10.0.0.6"]);
        h.events.send(ServiceEvent::Added(svc)).await.unwrap();
        harnesses.push(h);
    }

    for h in harnesses.iter() {
        let host = h.host.clone();
        wait_for(
            || host.announced().contains(&ip("10.0.0.6")),
            "the prefix to be announced",
        )
        .await;
        // BGP does not bind the address on the interface
        assert!(h.host.bound().is_empty());
        // and no election was opened
        assert!(h.elections.opened().is_empty());
    }
}

#[tokio::test]
async fn modified_without_address_change_touches_nothing() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc3", "default", "u3", &["10.0.0.7"]);
    h.events.send(ServiceEvent::Added(svc.clone())).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.announced().contains(&ip("10.0.0.7")),
        "the address to be announced",
    )
    .await;
    let before = h.host.events();

    let relabelled = with_label(svc, "team", "platform");
    h.events
        .send(ServiceEvent::Modified(relabelled))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.host.events(), before);
    assert_eq!(h.registry.len(), 1);
}

#[tokio::test]
async fn modified_with_changed_addresses_replaces_the_actor() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc4", "default", "u4", &["10.0.0.8"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.announced().contains(&ip("10.0.0.8")),
        "the first address to be announced",
    )
    .await;

    let moved = load_balancer_service("svc4", "default", "u4", &["10.0.0.9"]);
    h.events.send(ServiceEvent::Modified(moved)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.announced().contains(&ip("10.0.0.9")),
        "the new address to be announced",
    )
    .await;

    assert!(!h.host.announced().contains(&ip("10.0.0.8")));
    assert!(!h.host.bound().contains(&ip("10.0.0.8")));

    // all of the old address is gone before any of the new one shows up
    let events = h.host.events();
    let pos = |e: HostEvent| events.iter().position(|x| *x == e).unwrap();
    let withdraw_old = pos(HostEvent::Withdraw(ip("10.0.0.8")));
    let release_old = pos(HostEvent::Release(ip("10.0.0.8")));
    let gc_new = pos(HostEvent::GarbageCollect(ip("10.0.0.9")));
    let assign_new = pos(HostEvent::Assign(ip("10.0.0.9")));
    let announce_new = pos(HostEvent::Announce(ip("10.0.0.9")));
    assert!(withdraw_old < release_old);
    assert!(release_old < gc_new);
    assert!(gc_new < assign_new);
    assert!(assign_new < announce_new);
}

#[tokio::test]
async fn deleted_service_releases_everything() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc.clone())).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    h.events.send(ServiceEvent::Deleted(svc)).await.unwrap();

    let registry = h.registry.clone();
    wait_for(|| registry.is_empty(), "the registry to be emptied").await;

    assert!(h.host.bound().is_empty());
    assert!(h.host.announced().is_empty());
    let events = h.host.events();
    assert!(events.contains(&HostEvent::Withdraw(ip("10.0.0.5"))));
    assert!(events.contains(&HostEvent::Release(ip("10.0.0.5"))));
}

#[tokio::test]
async fn ignored_service_is_counted_but_not_managed() {
    let h = start(arp_config());

    let svc = with_annotation(
        load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]),
        IGNORE_ANNOTATION,
        "true",
    );
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.registry.is_empty());
    assert!(h.host.events().is_empty());
    assert_eq!(h.metrics.watch_events.with_label_values(&["ADDED"]).get(), 1);
}

#[tokio::test]
async fn non_load_balancer_services_are_ignored() {
    let h = start(arp_config());

    let svc = cluster_ip_service("svc1", "default", "u1");
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.registry.is_empty());
    assert!(h.host.events().is_empty());
}

#[tokio::test]
async fn service_without_addresses_is_ignored() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &[]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.registry.is_empty());
    assert_eq!(h.metrics.watch_events.with_label_values(&["ADDED"]).get(), 1);
}

#[tokio::test]
async fn cancelling_the_controller_converges_to_an_empty_host() {
    let h = start(arp_config());

    for (name, uid, addr) in [
        ("svc1", "u1", "10.0.0.5"),
        ("svc2", "u2", "10.0.0.6"),
        ("svc3", "u3", "10.0.0.7"),
    ] {
        let svc = load_balancer_service(name, "default", uid, &[addr]);
        h.events.send(ServiceEvent::Added(svc)).await.unwrap();
    }

    let host = h.host.clone();
    wait_for(|| host.bound().len() == 3, "all addresses to be bound").await;

    h.scope.cancel();
    h.task.await.unwrap().unwrap();

    assert!(h.host.bound().is_empty());
    assert!(h.host.announced().is_empty());
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn at_most_one_node_binds_under_election() {
    let node_a = start(arp_config());
    let mut config_b = arp_config();
    config_b.node_name = "node1".to_string();
    // node B starts as a follower
    let node_b = start_with(config_b, false);

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    node_a.events.send(ServiceEvent::Added(svc.clone())).await.unwrap();
    node_b.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host_a = node_a.host.clone();
    wait_for(
        || host_a.bound().contains(&ip("10.0.0.5")),
        "the leader to bind the address",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node_b.host.bound().is_empty());

    // leadership moves: the old leader retreats before the new one binds
    let lease = service_lease_name("default", "svc1");
    node_a.elections.set_leader(&lease, false);
    let host_a = node_a.host.clone();
    wait_for(|| host_a.bound().is_empty(), "the old leader to retreat").await;

    node_b.elections.set_leader(&lease, true);
    let host_b = node_b.host.clone();
    wait_for(
        || host_b.bound().contains(&ip("10.0.0.5")),
        "the new leader to bind the address",
    )
    .await;
    assert!(node_a.host.bound().is_empty());
}

#[tokio::test]
async fn losing_leadership_withdraws_until_reacquired() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    let lease = service_lease_name("default", "svc1");
    h.elections.set_leader(&lease, false);

    let host = h.host.clone();
    wait_for(|| host.bound().is_empty(), "the address to be released").await;
    // the actor stays registered, armed for the next acquisition
    assert_eq!(h.registry.len(), 1);

    h.elections.set_leader(&lease, true);
    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound again",
    )
    .await;
}

#[tokio::test]
async fn host_failures_back_off_and_retry() {
    let h = start(arp_config());
    h.host.fail_next_assigns(2);

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound after retries",
    )
    .await;

    assert!(h.metrics.host_failures.with_label_values(&["claim"]).get() >= 2);
}

#[tokio::test]
async fn local_traffic_policy_gates_on_local_endpoints() {
    let h = start(arp_config());

    let svc = with_traffic_policy(
        load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]),
        "Local",
    );
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let endpoints = h.endpoints.clone();
    wait_for(
        || endpoints.tracked() == vec!["default/svc1".to_string()],
        "the endpoint tracker to start",
    )
    .await;

    // leader, but no local pod backs the service yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.host.bound().is_empty());

    h.endpoints.set_local(
        "default",
        "svc1",
        BTreeSet::from([ip("10.1.0.9")]),
    );
    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound once an endpoint is local",
    )
    .await;

    h.endpoints.set_local("default", "svc1", BTreeSet::new());
    let host = h.host.clone();
    wait_for(
        || host.bound().is_empty(),
        "the address to be released when the last local endpoint goes",
    )
    .await;
}

#[tokio::test]
async fn flipping_to_rejected_tears_the_service_down() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc.clone())).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    let ignored = with_annotation(svc, IGNORE_ANNOTATION, "true");
    h.events.send(ServiceEvent::Modified(ignored)).await.unwrap();

    let registry = h.registry.clone();
    wait_for(|| registry.is_empty(), "the actor to be torn down").await;
    assert!(h.host.bound().is_empty());
    assert!(h.host.announced().is_empty());
}

#[tokio::test]
async fn stale_bindings_are_reclaimed_before_assign() {
    let h = start(arp_config());
    // a binding left behind by a crashed process
    h.host.seed_stale(ip("10.0.0.5"));

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    let events = h.host.events();
    let gc = events
        .iter()
        .position(|e| *e == HostEvent::GarbageCollect(ip("10.0.0.5")))
        .unwrap();
    let assign = events
        .iter()
        .position(|e| *e == HostEvent::Assign(ip("10.0.0.5")))
        .unwrap();
    assert!(gc < assign);
}

#[tokio::test]
async fn closing_the_event_source_drains_cleanly() {
    let h = start(arp_config());

    let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
    h.events.send(ServiceEvent::Added(svc)).await.unwrap();

    let host = h.host.clone();
    wait_for(
        || host.bound().contains(&ip("10.0.0.5")),
        "the address to be bound",
    )
    .await;

    drop(h.events);
    h.task.await.unwrap().unwrap();
    assert!(h.host.bound().is_empty());
    assert!(h.registry.is_empty());
}
