use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Mutex;

/// Records every address operation so tests can assert on host state and
/// on operation ordering.
#[derive(Debug)]
pub struct MockHost {
    pub inner: Mutex<MockHostInner>,
}

#[derive(Debug)]
pub struct MockHostInner {
    pub bound: BTreeSet<IpAddr>,
    pub announced: BTreeSet<IpAddr>,
    // pre-seeded bindings standing in for leftovers of a crashed process
    pub stale: BTreeSet<IpAddr>,
    pub events: Vec<HostEvent>,
    pub announce_count: BTreeMap<IpAddr, u64>,
    pub bind_addresses: bool,
    pub fail_assigns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    GarbageCollect(IpAddr),
    Assign(IpAddr),
    Release(IpAddr),
    Announce(IpAddr),
    Withdraw(IpAddr),
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MockHostInner {
                bound: BTreeSet::new(),
                announced: BTreeSet::new(),
                stale: BTreeSet::new(),
                events: Vec::new(),
                announce_count: BTreeMap::new(),
                bind_addresses: true,
                fail_assigns: 0,
            }),
        }
    }
}

impl MockHost {
    pub fn bound(&self) -> BTreeSet<IpAddr> {
        self.inner.lock().unwrap().bound.clone()
    }

    pub fn announced(&self) -> BTreeSet<IpAddr> {
        self.inner.lock().unwrap().announced.clone()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn announce_count(&self, addr: IpAddr) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .announce_count
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    pub fn seed_stale(&self, addr: IpAddr) {
        self.inner.lock().unwrap().stale.insert(addr);
    }

    pub fn set_bind_addresses(&self, bind: bool) {
        self.inner.lock().unwrap().bind_addresses = bind;
    }

    pub fn fail_next_assigns(&self, n: u32) {
        self.inner.lock().unwrap().fail_assigns = n;
    }

    pub(crate) fn binds_addresses(&self) -> bool {
        self.inner.lock().unwrap().bind_addresses
    }

    pub(crate) fn announce(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.announced.insert(addr);
        inner.events.push(HostEvent::Announce(addr));
        *inner.announce_count.entry(addr).or_insert(0) += 1;
    }

    pub(crate) fn withdraw(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.announced.remove(&addr);
        inner.events.push(HostEvent::Withdraw(addr));
    }
}
