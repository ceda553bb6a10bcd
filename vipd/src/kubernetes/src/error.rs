use thiserror::Error;
use vipd_trace::error::TraceableError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Failed to create the services watcher: {0}")]
    WatchStart(#[source] kube::Error),

    #[error("Net Error: {0}")]
    Net(#[source] vipd_net::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service object has no UID")]
    MissingUid,

    #[error("Failed to get lock")]
    FailedToGetLock,

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),
}

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("failed to load the configuration file")]
    FailedToLoad,

    #[error("exactly one of ARP, routing table and BGP must be enabled")]
    BackendSelection,

    #[error("ARP advertisement requires leader election or per-service election")]
    ArpWithoutElection,

    #[error("legacy and non-legacy loadBalancer class handling are mutually exclusive")]
    ConflictingClassModes,

    #[error("node_name must be set")]
    MissingNodeName,

    #[error("interface must be set")]
    MissingInterface,
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
