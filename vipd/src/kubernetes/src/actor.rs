use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use vipd_net::{AddressManager, Advertiser};

use crate::config::Config;
use crate::context::Scope;
use crate::endpoints::EndpointTracker;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::service::{ServiceSnapshot, TrafficPolicy};

const CLAIM_BACKOFF_MIN: Duration = Duration::from_millis(250);
const CLAIM_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Per-service unit of ownership.
///
/// The actor owns a cancellable scope and moves between ARMED (watching
/// for the right to advertise) and ACTIVE (addresses programmed and
/// advertised). Whatever happens, the host state it created is gone
/// before its task completes: the controller relies on that when it
/// awaits teardown before recreating an actor for the same UID.
pub struct ServiceActor {
    config: Arc<Config>,
    snapshot: ServiceSnapshot,
    scope: Scope,
    mailbox: Option<mpsc::UnboundedReceiver<ServiceSnapshot>>,
    addresses: AddressManager,
    advertiser: Advertiser,
    election: Option<watch::Receiver<bool>>,
    tracker: Option<EndpointTracker>,
    metrics: Metrics,
    configured: Vec<IpAddr>,
    active: bool,
}

impl ServiceActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        snapshot: ServiceSnapshot,
        scope: Scope,
        mailbox: mpsc::UnboundedReceiver<ServiceSnapshot>,
        addresses: AddressManager,
        advertiser: Advertiser,
        election: Option<watch::Receiver<bool>>,
        tracker: Option<EndpointTracker>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            snapshot,
            scope,
            mailbox: Some(mailbox),
            addresses,
            advertiser,
            election,
            tracker,
            metrics,
            configured: Vec::new(),
            active: false,
        }
    }

    pub async fn run(mut self) {
        let scope = self.scope.clone();
        let mut election = self.election.take();
        let mut tracker = self.tracker.take();
        let mut mailbox = self.mailbox.take();
        let mut backoff = CLAIM_BACKOFF_MIN;

        tracing::info!(
            uid = self.snapshot.uid,
            name = self.snapshot.name,
            namespace = self.snapshot.namespace,
            addresses = ?self.snapshot.addresses,
            "service actor started"
        );

        loop {
            if scope.is_cancelled() {
                break;
            }

            let leader = election.as_ref().map(|rx| *rx.borrow()).unwrap_or(true);
            let endpoints_ready = self.snapshot.traffic_policy != TrafficPolicy::Local
                || tracker
                    .as_ref()
                    .map(|t| !t.rx.borrow().is_empty())
                    .unwrap_or(true);
            let eligible = leader && endpoints_ready;

            if self.active && !eligible {
                tracing::info!(
                    uid = self.snapshot.uid,
                    name = self.snapshot.name,
                    leader = leader,
                    "no longer eligible, withdrawing addresses"
                );
                self.retreat().await;
                continue;
            }
            if !self.active && eligible {
                match self.claim().await {
                    Ok(()) => {
                        self.active = true;
                        backoff = CLAIM_BACKOFF_MIN;
                        tracing::info!(
                            uid = self.snapshot.uid,
                            name = self.snapshot.name,
                            addresses = ?self.configured,
                            "addresses configured and advertised"
                        );
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(
                            error=?e,
                            uid = self.snapshot.uid,
                            name = self.snapshot.name,
                            "failed to program the host, retrying"
                        );
                        self.metrics.host_failure("claim");
                        tokio::select! {
                            _ = scope.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(CLAIM_BACKOFF_MAX);
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = scope.cancelled() => break,
                changed = wait_changed(&mut election) => {
                    if changed.is_err() {
                        tracing::error!(
                            uid = self.snapshot.uid,
                            "election driver went away, terminating the actor"
                        );
                        break;
                    }
                }
                changed = wait_tracker(&mut tracker) => {
                    if changed.is_err() {
                        tracing::error!(
                            uid = self.snapshot.uid,
                            "endpoint tracker went away, terminating the actor"
                        );
                        break;
                    }
                }
                msg = wait_mailbox(&mut mailbox) => {
                    if let Some(snapshot) = msg {
                        // address-changing updates arrive as a fresh actor,
                        // so this swap never touches host state
                        self.snapshot = snapshot;
                    } else {
                        // the controller dropped us from the registry;
                        // cancellation follows
                        mailbox = None;
                    }
                }
            }
        }

        if self.active {
            self.retreat().await;
        }
        tracing::info!(
            uid = self.snapshot.uid,
            name = self.snapshot.name,
            "service actor finished"
        );
    }

    /// Claims each address: reclaim anything stale a crashed process left
    /// behind, bind, then advertise. Partial progress is kept in
    /// `configured` so a retry resumes where it failed.
    async fn claim(&mut self) -> Result<(), Error> {
        let bind = self.advertiser.binds_addresses();
        for addr in self.snapshot.addresses.clone() {
            if self.configured.contains(&addr) {
                continue;
            }
            if bind {
                match self.addresses.garbage_collect(addr).await {
                    Ok(true) => {
                        tracing::warn!(
                            address = %addr,
                            iface = self.config.interface,
                            "found and reclaimed an existing address binding"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error=?e, address = %addr, "failed to probe for a stale binding");
                    }
                }
                self.addresses.assign(addr).await.map_err(Error::Net)?;
            }
            if let Err(e) = self.advertiser.announce(addr).await {
                // keep the bind/advertise pair atomic from the retry's
                // point of view
                if bind {
                    let _ = self.addresses.release(addr).await;
                }
                return Err(Error::Net(e));
            }
            self.configured.push(addr);
        }
        Ok(())
    }

    /// Withdraws and releases everything in `configured`, in order.
    async fn retreat(&mut self) {
        let bind = self.advertiser.binds_addresses();
        for addr in std::mem::take(&mut self.configured) {
            if let Err(e) = self.advertiser.withdraw(addr).await {
                tracing::error!(error=?e, address = %addr, "failed to withdraw the advertisement");
                self.metrics.host_failure("withdraw");
            }
            if bind {
                if let Err(e) = self.addresses.release(addr).await {
                    tracing::error!(error=?e, address = %addr, "failed to release the address");
                    self.metrics.host_failure("release");
                }
            }
        }
        self.active = false;
    }
}

async fn wait_changed(election: &mut Option<watch::Receiver<bool>>) -> Result<(), ()> {
    match election.as_mut() {
        Some(rx) => rx.changed().await.map_err(|_| ()),
        None => std::future::pending().await,
    }
}

async fn wait_tracker(tracker: &mut Option<EndpointTracker>) -> Result<(), ()> {
    match tracker.as_mut() {
        Some(t) => t.rx.changed().await.map_err(|_| ()),
        None => std::future::pending().await,
    }
}

async fn wait_mailbox(
    mailbox: &mut Option<mpsc::UnboundedReceiver<ServiceSnapshot>>,
) -> Option<ServiceSnapshot> {
    match mailbox.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
