use std::net::IpAddr;
use std::sync::Arc;

use crate::arp::ArpAdvertiser;
use crate::bgp::BgpAdvertiser;
use crate::error::Error;
use crate::mock::MockHost;
use crate::route::RouteAdvertiser;

/// How the network learns that a VIP is reachable via this node.
///
/// Exactly one variant is the process-wide primary back-end; the variant
/// decides whether advertising is only safe under leader election and
/// whether the address must also be bound on the interface.
#[derive(Debug, Clone)]
pub enum Advertiser {
    Arp(ArpAdvertiser),
    Route(RouteAdvertiser),
    Bgp(BgpAdvertiser),
    Mock(Arc<MockHost>),
}

impl Advertiser {
    pub async fn announce(&self, addr: IpAddr) -> Result<(), Error> {
        match self {
            Advertiser::Arp(a) => a.announce(addr).await,
            Advertiser::Route(r) => r.announce(addr).await,
            Advertiser::Bgp(b) => b.announce(addr).await,
            Advertiser::Mock(h) => {
                h.announce(addr);
                Ok(())
            }
        }
    }

    pub async fn withdraw(&self, addr: IpAddr) -> Result<(), Error> {
        match self {
            Advertiser::Arp(a) => a.withdraw(addr).await,
            Advertiser::Route(r) => r.withdraw(addr).await,
            Advertiser::Bgp(b) => b.withdraw(addr).await,
            Advertiser::Mock(h) => {
                h.withdraw(addr);
                Ok(())
            }
        }
    }

    pub fn stop(&self) {
        if let Advertiser::Arp(a) = self {
            a.stop()
        }
    }

    /// ARP claims an address outright, so two nodes advertising the same
    /// VIP would fight over the neighbor caches.
    pub fn requires_election(&self) -> bool {
        matches!(self, Advertiser::Arp(_))
    }

    /// Whether VIPs must also be bound on the interface for this back-end.
    pub fn binds_addresses(&self) -> bool {
        match self {
            Advertiser::Arp(_) | Advertiser::Route(_) => true,
            Advertiser::Bgp(b) => b.binds_addresses(),
            Advertiser::Mock(h) => h.binds_addresses(),
        }
    }
}
