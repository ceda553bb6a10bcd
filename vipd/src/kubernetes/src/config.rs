use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error};

pub(crate) const DEFAULT_LEASE_NAME: &str = "vipd-global-lock";
pub(crate) const DEFAULT_LEASE_NAMESPACE: &str = "kube-system";
pub(crate) const DEFAULT_LEASE_DURATION: u64 = 15;
pub(crate) const DEFAULT_RENEW_INTERVAL: u64 = 5;
pub(crate) const DEFAULT_ARP_INTERVAL: u64 = 3;
pub(crate) const DEFAULT_SPEAKER_ENDPOINT: &str = "127.0.0.1:5000";
pub(crate) const DEFAULT_SPEAKER_TIMEOUT: u64 = 30;
pub(crate) const DEFAULT_ROUTING_TABLE_ID: u32 = 198;
pub(crate) const DEFAULT_HTTP_PORT: u16 = 2112;
pub(crate) const DEFAULT_METRICS_NAMESPACE: &str = "vipd";

/// Which election gates the ARMED to ACTIVE transition of the actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionTopology {
    /// One Lease per service; advertising nodes race per VIP.
    PerService,
    /// One Lease for the whole agent fleet.
    Global,
    /// No election; every node advertises (BGP / routing fabric multipath).
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Namespace to watch. Empty means all namespaces.
    pub service_namespace: String,
    /// Expected spec.loadBalancerClass. Empty accepts unclassed services.
    pub lb_class_name: String,
    pub lb_class_legacy_handling: bool,
    /// Legacy-mode option: reject services without any class.
    pub lb_class_only: bool,
    pub enable_leader_election: bool,
    pub enable_services_election: bool,
    pub enable_bgp: bool,
    pub enable_routing_table: bool,
    pub enable_arp: bool,
    /// Track EndpointSlices instead of Endpoints.
    pub enable_endpoint_slices: bool,
    pub node_name: String,
    pub interface: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration: u64,
    pub lease_renew_interval: u64,
    pub arp_interval: u64,
    pub bgp_speaker_endpoint: String,
    pub bgp_speaker_timeout: u64,
    /// Also bind VIPs on the interface in BGP mode.
    pub bgp_bind_addresses: bool,
    pub routing_table_id: u32,
    pub prefix_v4: u8,
    pub prefix_v6: u8,
    pub http_port: u16,
    /// Prefix for every exported metric name.
    pub metrics_namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_namespace: String::new(),
            lb_class_name: String::new(),
            lb_class_legacy_handling: false,
            lb_class_only: false,
            enable_leader_election: false,
            enable_services_election: true,
            enable_bgp: false,
            enable_routing_table: false,
            enable_arp: true,
            enable_endpoint_slices: true,
            node_name: String::new(),
            interface: String::new(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            lease_renew_interval: DEFAULT_RENEW_INTERVAL,
            arp_interval: DEFAULT_ARP_INTERVAL,
            bgp_speaker_endpoint: DEFAULT_SPEAKER_ENDPOINT.to_string(),
            bgp_speaker_timeout: DEFAULT_SPEAKER_TIMEOUT,
            bgp_bind_addresses: false,
            routing_table_id: DEFAULT_ROUTING_TABLE_ID,
            prefix_v4: 32,
            prefix_v6: 128,
            http_port: DEFAULT_HTTP_PORT,
            metrics_namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
        }
    }
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(|_| ConfigError::FailedToLoad)?;
        serde_yaml::from_str(&contents).map_err(|_| Error::Config(ConfigError::FailedToLoad))
    }

    pub fn election_topology(&self) -> ElectionTopology {
        // per-service takes precedence when both are configured
        if self.enable_services_election {
            ElectionTopology::PerService
        } else if self.enable_leader_election {
            ElectionTopology::Global
        } else {
            ElectionTopology::None
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let backends = [self.enable_arp, self.enable_routing_table, self.enable_bgp]
            .iter()
            .filter(|b| **b)
            .count();
        if backends != 1 {
            return Err(ConfigError::BackendSelection.into());
        }
        if self.enable_arp && self.election_topology() == ElectionTopology::None {
            return Err(ConfigError::ArpWithoutElection.into());
        }
        if self.lb_class_only && !self.lb_class_legacy_handling {
            return Err(ConfigError::ConflictingClassModes.into());
        }
        if self.node_name.is_empty() {
            return Err(ConfigError::MissingNodeName.into());
        }
        if self.interface.is_empty() && (self.enable_arp || self.enable_routing_table || self.bgp_bind_addresses) {
            return Err(ConfigError::MissingInterface.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn base() -> Config {
        Config {
            node_name: "node0".to_string(),
            interface: "eth0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base().validate().is_ok());
    }

    #[rstest(
        mutate,
        case(|c: &mut Config| c.enable_bgp = true),
        case(|c: &mut Config| c.enable_arp = false),
        case(|c: &mut Config| c.enable_services_election = false),
        case(|c: &mut Config| c.lb_class_only = true),
        case(|c: &mut Config| c.node_name = String::new()),
        case(|c: &mut Config| c.interface = String::new()),
    )]
    fn rejects_illegal_configs(mutate: fn(&mut Config)) {
        let mut config = base();
        mutate(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bgp_does_not_require_an_interface() {
        let mut config = base();
        config.enable_arp = false;
        config.enable_bgp = true;
        config.enable_services_election = false;
        config.interface = String::new();
        assert!(config.validate().is_ok());
    }

    #[rstest(
        services,
        leader,
        expected,
        case(true, false, ElectionTopology::PerService),
        case(true, true, ElectionTopology::PerService),
        case(false, true, ElectionTopology::Global),
        case(false, false, ElectionTopology::None),
    )]
    fn election_topology_precedence(services: bool, leader: bool, expected: ElectionTopology) {
        let mut config = base();
        config.enable_services_election = services;
        config.enable_leader_election = leader;
        assert_eq!(config.election_topology(), expected);
    }
}
