use clap::Parser;

use vipd_kubernetes::config::Config;

#[derive(Debug, Clone, Parser)]
pub struct AgentCmd {
    #[arg(short = 'f', long = "config-file", help = "Agent configuration file")]
    pub file: Option<String>,

    #[arg(long, help = "Name of this node, the election holder identity")]
    pub node_name: Option<String>,

    #[arg(long, help = "Interface VIPs are bound to")]
    pub interface: Option<String>,

    #[arg(long, help = "Namespace to watch, empty for all namespaces")]
    pub namespace: Option<String>,

    #[arg(long, help = "Use per-service leader election")]
    pub services_election: bool,

    #[arg(long, help = "Use a single global leader election")]
    pub leader_election: bool,

    #[arg(long, help = "Advertise VIPs over BGP via the local speaker")]
    pub bgp: bool,

    #[arg(long, help = "Advertise VIPs as kernel routes")]
    pub routing_table: bool,

    #[arg(long, help = "Local BGP speaker endpoint")]
    pub speaker_endpoint: Option<String>,
}

impl AgentCmd {
    pub fn into_config(self) -> Config {
        let mut config = match &self.file {
            Some(file) => Config::load(file).unwrap_or_else(|e| {
                eprintln!("failed to load the configuration: {e}");
                std::process::exit(1);
            }),
            None => Config::default(),
        };
        if let Some(node_name) = self.node_name {
            config.node_name = node_name;
        }
        if let Some(interface) = self.interface {
            config.interface = interface;
        }
        if let Some(namespace) = self.namespace {
            config.service_namespace = namespace;
        }
        if self.services_election {
            config.enable_services_election = true;
        }
        if self.leader_election {
            config.enable_leader_election = true;
        }
        if self.bgp {
            config.enable_bgp = true;
            config.enable_arp = false;
        }
        if self.routing_table {
            config.enable_routing_table = true;
            config.enable_arp = false;
        }
        if let Some(endpoint) = self.speaker_endpoint {
            config.bgp_speaker_endpoint = endpoint;
        }
        config
    }
}
