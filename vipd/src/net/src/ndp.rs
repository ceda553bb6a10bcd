use std::net::{Ipv6Addr, SocketAddrV6};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::Error;
use crate::link::LinkInfo;

const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const NDP_HOP_LIMIT: u32 = 255;

/// Sends an unsolicited neighbor advertisement for `addr` to all nodes on
/// the link. The kernel fills in the ICMPv6 checksum for raw ICMPv6
/// sockets.
pub fn send_neighbor_advertisement(link: &LinkInfo, addr: Ipv6Addr) -> Result<(), Error> {
    let packet = build_neighbor_advertisement(&link.mac, addr);

    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
        .map_err(Error::RawSocket)?;
    socket
        .set_multicast_hops_v6(NDP_HOP_LIMIT)
        .map_err(Error::RawSocket)?;

    let dst = SockAddr::from(SocketAddrV6::new(ALL_NODES, 0, 0, link.index));
    socket.send_to(&packet, &dst).map_err(Error::RawSocket)?;
    Ok(())
}

fn build_neighbor_advertisement(mac: &[u8; 6], addr: Ipv6Addr) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32);
    packet.push(136); // neighbor advertisement
    packet.push(0); // code
    packet.extend_from_slice(&[0x00, 0x00]); // checksum, kernel-computed
    packet.push(0x20); // override flag, not solicited, not a router
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    packet.extend_from_slice(&addr.octets());
    // target link-layer address option
    packet.push(2);
    packet.push(1);
    packet.extend_from_slice(mac);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_advertisement_layout() {
        let mac = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let packet = build_neighbor_advertisement(&mac, addr);

        assert_eq!(packet.len(), 32);
        assert_eq!(packet[0], 136);
        assert_eq!(packet[4], 0x20);
        assert_eq!(&packet[8..24], &addr.octets());
        assert_eq!(&packet[24..26], &[2, 1]);
        assert_eq!(&packet[26..32], &mac);
    }
}
