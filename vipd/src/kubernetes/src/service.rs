use std::net::IpAddr;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::config::Config;
use crate::error::Error;

/// Services carrying this annotation are skipped unconditionally.
pub const IGNORE_ANNOTATION: &str = "kube-vip.io/ignore";
/// Comma-separated addresses requested for a service, an alternative to
/// the status field and the deprecated spec.loadBalancerIP.
pub const LB_IPS_ANNOTATION: &str = "kube-vip.io/loadbalancerIPs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficPolicy {
    Cluster,
    Local,
}

/// Immutable copy of the parts of a Service the engine acts on. Two
/// snapshots describe the same host state only when their address lists
/// are equal; the filter decisions are equal by construction for any two
/// accepted snapshots of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub traffic_policy: TrafficPolicy,
    pub lb_class: Option<String>,
    pub addresses: Vec<IpAddr>,
}

impl ServiceSnapshot {
    pub fn from_service(svc: &Service) -> Result<ServiceSnapshot, Error> {
        let uid = svc.uid().ok_or(Error::MissingUid)?;
        Ok(ServiceSnapshot {
            uid,
            name: svc.name_any(),
            namespace: svc.namespace().unwrap_or_else(|| "default".to_string()),
            traffic_policy: traffic_policy(svc),
            lb_class: svc
                .spec
                .as_ref()
                .and_then(|spec| spec.load_balancer_class.clone()),
            addresses: fetch_service_addresses(svc),
        })
    }
}

pub fn is_load_balancer(svc: &Service) -> bool {
    match svc.spec.as_ref().and_then(|spec| spec.type_.as_ref()) {
        Some(t) => t.eq("LoadBalancer"),
        None => false,
    }
}

pub fn is_ignored(svc: &Service) -> bool {
    svc.annotations()
        .get(IGNORE_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn traffic_policy(svc: &Service) -> TrafficPolicy {
    match svc
        .spec
        .as_ref()
        .and_then(|spec| spec.external_traffic_policy.as_deref())
    {
        Some("Local") => TrafficPolicy::Local,
        _ => TrafficPolicy::Cluster,
    }
}

/// The filter is a pure function of the service's type, annotations,
/// class and addresses: given a fixed config the same service always gets
/// the same answer.
pub fn accepts(svc: &Service, config: &Config) -> bool {
    if !is_load_balancer(svc) {
        return false;
    }
    if is_ignored(svc) {
        tracing::info!(name = svc.name_any(), "ignore annotation is set, skipping");
        return false;
    }
    if config.lb_class_legacy_handling {
        accepts_class_legacy(svc, &config.lb_class_name, config.lb_class_only)
    } else {
        accepts_class(svc, &config.lb_class_name)
    }
}

pub fn accepts_class(svc: &Service, lb_class_name: &str) -> bool {
    let class = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_class.as_deref());
    match class {
        None => {
            if lb_class_name.is_empty() {
                true
            } else {
                tracing::info!(
                    name = svc.name_any(),
                    expected = lb_class_name,
                    "no loadBalancer class, skipping"
                );
                false
            }
        }
        Some(class) => {
            if class == lb_class_name {
                true
            } else {
                tracing::info!(
                    name = svc.name_any(),
                    class = class,
                    expected = lb_class_name,
                    "wrong loadBalancer class, skipping"
                );
                false
            }
        }
    }
}

pub fn accepts_class_legacy(svc: &Service, lb_class_name: &str, class_only: bool) -> bool {
    let class = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_class.as_deref());
    match class {
        Some(class) => {
            if class == lb_class_name {
                true
            } else {
                tracing::info!(
                    name = svc.name_any(),
                    class = class,
                    "wrong loadBalancer class, skipping"
                );
                false
            }
        }
        None => {
            if class_only {
                tracing::info!(
                    name = svc.name_any(),
                    "service has no loadBalancer class and only classed services are recognized, skipping"
                );
                false
            } else {
                true
            }
        }
    }
}

/// Addresses assigned to a service, in order: the load balancer status,
/// the address annotation, then the deprecated spec field. Duplicates are
/// dropped keeping the first occurrence.
pub fn fetch_service_addresses(svc: &Service) -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = Vec::new();

    if let Some(ingress) = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
    {
        for i in ingress.iter() {
            if let Some(ip) = i.ip.as_ref().and_then(|ip| IpAddr::from_str(ip).ok()) {
                addrs.push(ip);
            }
        }
    }

    if let Some(annotated) = svc.annotations().get(LB_IPS_ANNOTATION) {
        for s in annotated.split(',') {
            if let Ok(ip) = IpAddr::from_str(s.trim()) {
                addrs.push(ip);
            }
        }
    }

    if let Some(ip) = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_ip.as_ref())
        .and_then(|ip| IpAddr::from_str(ip).ok())
    {
        addrs.push(ip);
    }

    let mut seen = Vec::new();
    addrs.retain(|a| {
        if seen.contains(a) {
            false
        } else {
            seen.push(*a);
            true
        }
    });
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{
        load_balancer_service, with_annotation, with_lb_class, with_spec_lb_ip,
    };
    use rstest::rstest;
    use std::net::Ipv4Addr;

    #[rstest(
        svc,
        expected,
        case(load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))]),
        case(load_balancer_service("svc1", "default", "u1", &["10.0.0.5", "2001:db8::1"]), vec![IpAddr::from_str("10.0.0.5").unwrap(), IpAddr::from_str("2001:db8::1").unwrap()]),
        case(load_balancer_service("svc1", "default", "u1", &[]), vec![]),
        case(with_annotation(load_balancer_service("svc1", "default", "u1", &[]), LB_IPS_ANNOTATION, "10.0.0.7,10.0.0.8"), vec![IpAddr::from_str("10.0.0.7").unwrap(), IpAddr::from_str("10.0.0.8").unwrap()]),
        case(with_spec_lb_ip(load_balancer_service("svc1", "default", "u1", &[]), "10.0.0.9"), vec![IpAddr::from_str("10.0.0.9").unwrap()]),
        // the status address wins over a duplicate in the annotation
        case(with_annotation(load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]), LB_IPS_ANNOTATION, "10.0.0.5,10.0.0.6"), vec![IpAddr::from_str("10.0.0.5").unwrap(), IpAddr::from_str("10.0.0.6").unwrap()]),
    )]
    fn works_fetch_service_addresses(svc: k8s_openapi::api::core::v1::Service, expected: Vec<IpAddr>) {
        assert_eq!(fetch_service_addresses(&svc), expected);
    }

    #[rstest(
        class,
        expected_class,
        accepted,
        case(None, "", true),
        case(None, "vipd", false),
        case(Some("vipd"), "vipd", true),
        case(Some("other"), "vipd", false),
        case(Some("other"), "", false),
    )]
    fn works_accepts_class(class: Option<&str>, expected_class: &str, accepted: bool) {
        let mut svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
        if let Some(class) = class {
            svc = with_lb_class(svc, class);
        }
        assert_eq!(accepts_class(&svc, expected_class), accepted);
    }

    #[rstest(
        class,
        expected_class,
        class_only,
        accepted,
        case(None, "", false, true),
        case(None, "vipd", false, true),
        case(None, "vipd", true, false),
        case(Some("vipd"), "vipd", false, true),
        case(Some("other"), "vipd", false, false),
        case(Some("other"), "vipd", true, false),
    )]
    fn works_accepts_class_legacy(
        class: Option<&str>,
        expected_class: &str,
        class_only: bool,
        accepted: bool,
    ) {
        let mut svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
        if let Some(class) = class {
            svc = with_lb_class(svc, class);
        }
        assert_eq!(
            accepts_class_legacy(&svc, expected_class, class_only),
            accepted
        );
    }

    #[test]
    fn ignore_annotation_skips_the_service() {
        let config = Config {
            node_name: "node0".to_string(),
            interface: "eth0".to_string(),
            ..Default::default()
        };
        let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
        assert!(accepts(&svc, &config));
        let svc = with_annotation(svc, IGNORE_ANNOTATION, "true");
        assert!(!accepts(&svc, &config));
    }

    #[test]
    fn filter_is_deterministic() {
        let config = Config {
            node_name: "node0".to_string(),
            interface: "eth0".to_string(),
            ..Default::default()
        };
        let svc = load_balancer_service("svc1", "default", "u1", &["10.0.0.5"]);
        let first = accepts(&svc, &config);
        for _ in 0..10 {
            assert_eq!(accepts(&svc, &config), first);
        }
    }
}
