use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Open netlink socket: {0}")]
    Open(#[source] std::io::Error),

    #[error("Link: {0}")]
    Link(#[source] rtnetlink::Error),

    #[error("Address: {0}")]
    Address(#[source] rtnetlink::Error),

    #[error("Route: {0}")]
    Route(#[source] rtnetlink::Error),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Invalid MAC address")]
    InvalidMacAddress,

    #[error("Invalid prefix for {0}")]
    InvalidPrefix(std::net::IpAddr),

    #[error("Raw socket: {0}")]
    RawSocket(#[source] std::io::Error),

    #[error("Failed to communicate with the speaker: {0}")]
    SpeakerTransport(#[source] tonic::transport::Error),

    #[error("Speaker returned an error: {0}")]
    Speaker(#[source] tonic::Status),

    #[error("Timed out connecting to the speaker")]
    SpeakerTimeout,

    #[error("Injected failure: {0}")]
    Injected(&'static str),
}
