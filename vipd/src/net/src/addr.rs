use std::net::IpAddr;
use std::sync::Arc;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;

use crate::error::Error;
use crate::link::get_link_index_by_name;
use crate::mock::{HostEvent, MockHost};

/// Binds and unbinds VIP addresses on the local interface.
///
/// Tagged variants so the engine can run against a recording fake host in
/// tests.
#[derive(Debug, Clone)]
pub enum AddressManager {
    Netlink(NetlinkAddressManager),
    Mock(Arc<MockHost>),
}

impl AddressManager {
    pub async fn assign(&self, addr: IpAddr) -> Result<(), Error> {
        match self {
            AddressManager::Netlink(m) => m.assign(addr).await,
            AddressManager::Mock(h) => h.assign(addr),
        }
    }

    pub async fn release(&self, addr: IpAddr) -> Result<(), Error> {
        match self {
            AddressManager::Netlink(m) => m.release(addr).await,
            AddressManager::Mock(h) => h.release(addr),
        }
    }

    /// Probes for a binding of `addr` left behind by a previous process and
    /// removes it. Returns whether one was found.
    pub async fn garbage_collect(&self, addr: IpAddr) -> Result<bool, Error> {
        match self {
            AddressManager::Netlink(m) => m.garbage_collect(addr).await,
            AddressManager::Mock(h) => h.garbage_collect(addr),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetlinkAddressManager {
    inner: Arc<NetlinkAddressManagerInner>,
}

#[derive(Debug)]
struct NetlinkAddressManagerInner {
    iface: String,
    prefix_v4: u8,
    prefix_v6: u8,
    // binds and unbinds on the shared interface are serialised
    lock: tokio::sync::Mutex<()>,
}

impl NetlinkAddressManager {
    pub fn new(iface: &str, prefix_v4: u8, prefix_v6: u8) -> Self {
        Self {
            inner: Arc::new(NetlinkAddressManagerInner {
                iface: iface.to_string(),
                prefix_v4,
                prefix_v6,
                lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn prefix_for(&self, addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => self.inner.prefix_v4,
            IpAddr::V6(_) => self.inner.prefix_v6,
        }
    }

    async fn assign(&self, addr: IpAddr) -> Result<(), Error> {
        let _guard = self.inner.lock.lock().await;

        let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Open)?;
        tokio::spawn(conn);

        let index = get_link_index_by_name(&handle, &self.inner.iface).await?;
        match handle
            .address()
            .add(index, addr, self.prefix_for(&addr))
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref em)) if em.raw_code() == -libc::EEXIST => {
                Ok(())
            }
            Err(e) => Err(Error::Address(e)),
        }
    }

    async fn release(&self, addr: IpAddr) -> Result<(), Error> {
        let _guard = self.inner.lock.lock().await;
        self.remove_binding(addr).await.map(|_| ())
    }

    async fn garbage_collect(&self, addr: IpAddr) -> Result<bool, Error> {
        let _guard = self.inner.lock.lock().await;
        self.remove_binding(addr).await
    }

    async fn remove_binding(&self, addr: IpAddr) -> Result<bool, Error> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(Error::Open)?;
        tokio::spawn(conn);

        let index = get_link_index_by_name(&handle, &self.inner.iface).await?;

        let mut addrs = handle.address().get().execute();
        while let Some(msg) = addrs.try_next().await.map_err(Error::Address)? {
            if msg.header.index != index {
                continue;
            }
            let matched = msg
                .attributes
                .iter()
                .any(|attr| matches!(attr, AddressAttribute::Address(a) if *a == addr));
            if matched {
                handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(Error::Address)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl MockHost {
    pub(crate) fn assign(&self, addr: IpAddr) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_assigns > 0 {
            inner.fail_assigns -= 1;
            return Err(Error::Injected("assign"));
        }
        inner.bound.insert(addr);
        inner.events.push(HostEvent::Assign(addr));
        Ok(())
    }

    pub(crate) fn release(&self, addr: IpAddr) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.bound.remove(&addr);
        inner.events.push(HostEvent::Release(addr));
        Ok(())
    }

    pub(crate) fn garbage_collect(&self, addr: IpAddr) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(HostEvent::GarbageCollect(addr));
        Ok(inner.stale.remove(&addr))
    }
}
