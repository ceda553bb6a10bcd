use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::Handle;

use crate::error::Error;

/// Index and hardware address of a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub mac: [u8; 6],
}

pub async fn get_link_index_by_name(handle: &Handle, name: &str) -> Result<u32, Error> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    if let Some(msg) = links.try_next().await.map_err(Error::Link)? {
        return Ok(msg.header.index);
    }
    Err(Error::LinkNotFound(name.to_string()))
}

pub async fn get_link_info(name: &str) -> Result<LinkInfo, Error> {
    let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Open)?;
    tokio::spawn(conn);

    let mut links = handle.link().get().match_name(name.to_string()).execute();
    if let Some(msg) = links.try_next().await.map_err(Error::Link)? {
        let index = msg.header.index;
        for attr in msg.attributes.into_iter() {
            if let LinkAttribute::Address(v) = attr {
                if v.len() != 6 {
                    return Err(Error::InvalidMacAddress);
                }
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&v);
                return Ok(LinkInfo { index, mac });
            }
        }
        return Err(Error::InvalidMacAddress);
    }
    Err(Error::LinkNotFound(name.to_string()))
}
