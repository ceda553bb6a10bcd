use std::net::IpAddr;

use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteProtocol, RouteScope};
use rtnetlink::IpVersion;

use crate::error::Error;
use crate::link::get_link_index_by_name;

// routes installed by this daemon carry their own protocol number so
// nothing else claims them
const ROUTE_PROTOCOL_VIPD: u8 = 198;

/// Announces VIPs as host routes pointing at the local interface. Safe
/// without an election only when the upstream is a routing fabric that
/// handles multipath.
#[derive(Debug, Clone)]
pub struct RouteAdvertiser {
    iface: String,
    table: u32,
    prefix_v4: u8,
    prefix_v6: u8,
}

impl RouteAdvertiser {
    pub fn new(iface: &str, table: u32, prefix_v4: u8, prefix_v6: u8) -> Self {
        Self {
            iface: iface.to_string(),
            table,
            prefix_v4,
            prefix_v6,
        }
    }

    fn to_net(&self, addr: IpAddr) -> Result<IpNet, Error> {
        let prefix = match addr {
            IpAddr::V4(_) => self.prefix_v4,
            IpAddr::V6(_) => self.prefix_v6,
        };
        IpNet::new(addr, prefix).map_err(|_| Error::InvalidPrefix(addr))
    }

    pub async fn announce(&self, addr: IpAddr) -> Result<(), Error> {
        let dst = self.to_net(addr)?;

        let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Open)?;
        tokio::spawn(conn);

        let index = get_link_index_by_name(&handle, &self.iface).await?;

        let req = handle
            .route()
            .add()
            .scope(RouteScope::Link)
            .output_interface(index)
            .table_id(self.table)
            .protocol(RouteProtocol::Other(ROUTE_PROTOCOL_VIPD));

        let res = match dst {
            IpNet::V4(dst) => {
                req.v4()
                    .destination_prefix(dst.addr(), dst.prefix_len())
                    .execute()
                    .await
            }
            IpNet::V6(dst) => {
                req.v6()
                    .destination_prefix(dst.addr(), dst.prefix_len())
                    .execute()
                    .await
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref em)) if em.raw_code() == -libc::EEXIST => {
                Ok(())
            }
            Err(e) => Err(Error::Route(e)),
        }
    }

    pub async fn withdraw(&self, addr: IpAddr) -> Result<(), Error> {
        let dst = self.to_net(addr)?;

        let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Open)?;
        tokio::spawn(conn);

        let ip_version = match dst {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        };
        let mut routes = handle.route().get(ip_version.clone()).execute();

        while let Some(r) = routes.try_next().await.map_err(Error::Route)? {
            let mut in_table = r.header.table as u32 == self.table;
            let mut matched = false;
            for attr in r.attributes.iter() {
                if let RouteAttribute::Table(id) = attr {
                    in_table = *id == self.table;
                }
                let dst_prefix_len = r.header.destination_prefix_length;
                match ip_version {
                    IpVersion::V4 => {
                        if let RouteAttribute::Destination(RouteAddress::Inet(a)) = attr {
                            matched = IpAddr::V4(*a) == dst.addr()
                                && dst_prefix_len == dst.prefix_len();
                        }
                    }
                    IpVersion::V6 => {
                        if let RouteAttribute::Destination(RouteAddress::Inet6(a)) = attr {
                            matched = IpAddr::V6(*a) == dst.addr()
                                && dst_prefix_len == dst.prefix_len();
                        }
                    }
                }
            }
            if in_table && matched {
                return handle.route().del(r).execute().await.map_err(Error::Route);
            }
        }
        // already gone
        Ok(())
    }
}
