// Builders for the Kubernetes objects the engine consumes. Compiled into
// the crate so the integration tests and the unit tables share them.

use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServiceSpec, ServiceStatus,
};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointSlice};
use kube::core::ObjectMeta;

pub fn load_balancer_service(name: &str, namespace: &str, uid: &str, addrs: &[&str]) -> Service {
    let ingress: Vec<LoadBalancerIngress> = addrs
        .iter()
        .map(|a| LoadBalancerIngress {
            ip: Some(a.to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        status: Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(ingress),
            }),
            ..Default::default()
        }),
    }
}

pub fn cluster_ip_service(name: &str, namespace: &str, uid: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn with_annotation(mut svc: Service, key: &str, value: &str) -> Service {
    svc.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    svc
}

pub fn with_label(mut svc: Service, key: &str, value: &str) -> Service {
    svc.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    svc
}

pub fn with_lb_class(mut svc: Service, class: &str) -> Service {
    svc.spec.get_or_insert_with(Default::default).load_balancer_class = Some(class.to_string());
    svc
}

pub fn with_spec_lb_ip(mut svc: Service, ip: &str) -> Service {
    svc.spec.get_or_insert_with(Default::default).load_balancer_ip = Some(ip.to_string());
    svc
}

pub fn with_traffic_policy(mut svc: Service, policy: &str) -> Service {
    svc.spec
        .get_or_insert_with(Default::default)
        .external_traffic_policy = Some(policy.to_string());
    svc
}

pub fn endpoint_slice(
    name: &str,
    namespace: &str,
    service: &str,
    endpoints: &[(&str, &str, bool)],
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(
                    "kubernetes.io/service-name".to_string(),
                    service.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .iter()
            .map(|(addr, node, serving)| Endpoint {
                addresses: vec![addr.to_string()],
                node_name: Some(node.to_string()),
                conditions: Some(EndpointConditions {
                    ready: Some(*serving),
                    serving: Some(*serving),
                    terminating: Some(false),
                }),
                ..Default::default()
            })
            .collect(),
        ports: None,
    }
}
