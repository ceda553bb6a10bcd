use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::context::Scope;
use crate::error::Error;
use crate::service::ServiceSnapshot;

/// A live actor and the last snapshot it was given.
#[derive(Debug)]
pub struct ServiceInstance {
    pub snapshot: ServiceSnapshot,
    pub scope: Scope,
    pub mailbox: UnboundedSender<ServiceSnapshot>,
    pub task: Option<JoinHandle<()>>,
}

/// Process-wide map of service UID to actor, safe for concurrent use.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    inner: Mutex<HashMap<String, ServiceInstance>>,
}

impl InstanceRegistry {
    pub fn store(&self, instance: ServiceInstance) -> Result<(), Error> {
        let mut map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        map.insert(instance.snapshot.uid.clone(), instance);
        Ok(())
    }

    pub fn contains(&self, uid: &str) -> Result<bool, Error> {
        let map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        Ok(map.contains_key(uid))
    }

    /// Looks up by UID, falling back to an exact address-set match so a
    /// service recreated under a new UID during a modification race still
    /// resolves to the actor holding its addresses.
    pub fn find(
        &self,
        uid: &str,
        addresses: &[IpAddr],
    ) -> Result<Option<(String, ServiceSnapshot)>, Error> {
        let map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        if let Some(instance) = map.get(uid) {
            return Ok(Some((uid.to_string(), instance.snapshot.clone())));
        }
        for (key, instance) in map.iter() {
            if !addresses.is_empty() && instance.snapshot.addresses == addresses {
                return Ok(Some((key.clone(), instance.snapshot.clone())));
            }
        }
        Ok(None)
    }

    /// Replaces the stored snapshot in place and hands back the actor's
    /// mailbox so the caller can forward the new snapshot.
    pub fn update(
        &self,
        uid: &str,
        snapshot: ServiceSnapshot,
    ) -> Result<Option<UnboundedSender<ServiceSnapshot>>, Error> {
        let mut map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        match map.get_mut(uid) {
            Some(instance) => {
                instance.snapshot = snapshot;
                Ok(Some(instance.mailbox.clone()))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, uid: &str) -> Result<Option<ServiceInstance>, Error> {
        let mut map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        Ok(map.remove(uid))
    }

    pub fn drain(&self) -> Result<Vec<ServiceInstance>, Error> {
        let mut map = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        Ok(map.drain().map(|(_, v)| v).collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::TrafficPolicy;
    use std::str::FromStr;

    fn snapshot(uid: &str, addrs: &[&str]) -> ServiceSnapshot {
        ServiceSnapshot {
            uid: uid.to_string(),
            name: format!("svc-{uid}"),
            namespace: "default".to_string(),
            traffic_policy: TrafficPolicy::Cluster,
            lb_class: None,
            addresses: addrs.iter().map(|a| IpAddr::from_str(a).unwrap()).collect(),
        }
    }

    fn instance(uid: &str, addrs: &[&str]) -> ServiceInstance {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        ServiceInstance {
            snapshot: snapshot(uid, addrs),
            scope: Scope::new(),
            mailbox: tx,
            task: None,
        }
    }

    #[tokio::test]
    async fn find_prefers_uid_and_falls_back_to_addresses() {
        let registry = InstanceRegistry::default();
        registry.store(instance("u1", &["10.0.0.5"])).unwrap();

        let (uid, _) = registry
            .find("u1", &[])
            .unwrap()
            .expect("found by uid");
        assert_eq!(uid, "u1");

        let addrs = [IpAddr::from_str("10.0.0.5").unwrap()];
        let (uid, _) = registry
            .find("u2", &addrs)
            .unwrap()
            .expect("found by addresses");
        assert_eq!(uid, "u1");

        assert!(registry.find("u2", &[]).unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_and_drain_empty_the_registry() {
        let registry = InstanceRegistry::default();
        registry.store(instance("u1", &["10.0.0.5"])).unwrap();
        registry.store(instance("u2", &["10.0.0.6"])).unwrap();

        assert!(registry.remove("u1").unwrap().is_some());
        assert!(registry.remove("u1").unwrap().is_none());
        assert_eq!(registry.drain().unwrap().len(), 1);
        assert!(registry.is_empty());
    }
}
