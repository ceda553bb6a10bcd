use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::link::{get_link_info, LinkInfo};
use crate::ndp;

const BROADCAST: [u8; 6] = [0xff; 6];

/// Announces VIPs by emitting gratuitous ARP (IPv4) and unsolicited
/// neighbor advertisements (IPv6) on the interface.
///
/// A frame goes out immediately on announce and then at the configured
/// cadence from a repeater task until the address is withdrawn. Safe only
/// under leader election.
#[derive(Debug, Clone)]
pub struct ArpAdvertiser {
    inner: Arc<ArpInner>,
}

#[derive(Debug)]
struct ArpInner {
    iface: String,
    link: tokio::sync::OnceCell<LinkInfo>,
    announced: Mutex<BTreeSet<IpAddr>>,
    cancel: CancellationToken,
}

impl ArpAdvertiser {
    pub fn new(iface: &str, interval: Duration) -> Self {
        let inner = Arc::new(ArpInner {
            iface: iface.to_string(),
            link: tokio::sync::OnceCell::new(),
            announced: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
        });

        let repeater = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = repeater.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(link) = repeater.link.get().copied() else {
                    continue;
                };
                let addrs = repeater.announced.lock().unwrap().clone();
                for addr in addrs {
                    if let Err(e) = send_advertisement(&link, addr) {
                        tracing::warn!(error=?e, address=%addr, iface=repeater.iface, "failed to re-advertise");
                    }
                }
            }
        });

        Self { inner }
    }

    async fn link(&self) -> Result<LinkInfo, Error> {
        self.inner
            .link
            .get_or_try_init(|| get_link_info(&self.inner.iface))
            .await
            .copied()
    }

    pub async fn announce(&self, addr: IpAddr) -> Result<(), Error> {
        let link = self.link().await?;
        send_advertisement(&link, addr)?;
        self.inner.announced.lock().unwrap().insert(addr);
        tracing::debug!(address=%addr, iface=self.inner.iface, "advertising address");
        Ok(())
    }

    pub async fn withdraw(&self, addr: IpAddr) -> Result<(), Error> {
        self.inner.announced.lock().unwrap().remove(&addr);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

fn send_advertisement(link: &LinkInfo, addr: IpAddr) -> Result<(), Error> {
    match addr {
        IpAddr::V4(v4) => send_gratuitous_arp(link, v4),
        IpAddr::V6(v6) => ndp::send_neighbor_advertisement(link, v6),
    }
}

fn send_gratuitous_arp(link: &LinkInfo, addr: Ipv4Addr) -> Result<(), Error> {
    let frame = build_gratuitous_arp(&link.mac, addr);
    send_raw_frame(link.index, &frame)
}

// A gratuitous ARP is a broadcast request for our own address with the
// sender and target protocol addresses both set to the VIP.
fn build_gratuitous_arp(mac: &[u8; 6], addr: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(42);
    // ethernet header
    frame.extend_from_slice(&BROADCAST);
    frame.extend_from_slice(mac);
    frame.extend_from_slice(&[0x08, 0x06]);
    // arp payload
    frame.extend_from_slice(&[0x00, 0x01]); // hardware type: ethernet
    frame.extend_from_slice(&[0x08, 0x00]); // protocol type: ipv4
    frame.push(6); // hardware length
    frame.push(4); // protocol length
    frame.extend_from_slice(&[0x00, 0x01]); // operation: request
    frame.extend_from_slice(mac);
    frame.extend_from_slice(&addr.octets());
    frame.extend_from_slice(&[0x00; 6]);
    frame.extend_from_slice(&addr.octets());
    frame
}

fn send_raw_frame(ifindex: u32, frame: &[u8]) -> Result<(), Error> {
    unsafe {
        let fd = libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ARP as u16).to_be() as i32,
        );
        if fd < 0 {
            return Err(Error::RawSocket(std::io::Error::last_os_error()));
        }

        let mut sll: libc::sockaddr_ll = std::mem::zeroed();
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        sll.sll_ifindex = ifindex as i32;
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&BROADCAST);

        let rc = libc::sendto(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        );
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if rc < 0 {
            return Err(Error::RawSocket(err));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gratuitous_arp_frame_layout() {
        let mac = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
        let frame = build_gratuitous_arp(&mac, Ipv4Addr::new(10, 0, 0, 5));

        assert_eq!(frame.len(), 42);
        // broadcast destination, our source
        assert_eq!(&frame[..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &mac);
        // ethertype ARP, request operation
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[20..22], &[0x00, 0x01]);
        // sender and target protocol address both carry the VIP
        assert_eq!(&frame[28..32], &[10, 0, 0, 5]);
        assert_eq!(&frame[38..42], &[10, 0, 0, 5]);
        // target hardware address is zero
        assert_eq!(&frame[32..38], &[0u8; 6]);
    }
}
