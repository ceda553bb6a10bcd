use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tokio::sync::{mpsc, watch};
use vipd_net::{AddressManager, Advertiser};

use crate::actor::ServiceActor;
use crate::config::{Config, ElectionTopology};
use crate::context::Scope;
use crate::election::{service_lease_name, ElectionBackend};
use crate::endpoints::EndpointBackend;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::registry::{InstanceRegistry, ServiceInstance};
use crate::service::{self, ServiceSnapshot, TrafficPolicy};
use crate::watcher::{ServiceEvent, ServiceEventSource};

/// Drives the whole engine: consumes the restartable service watch and
/// creates, updates and destroys service actors through the registry.
///
/// The dispatcher itself never blocks on host work; everything slow runs
/// inside the actors. Per-UID ordering holds because destruction awaits
/// the old actor's completion before anything new is spawned for that
/// UID, and snapshot updates flow through the actor's own mailbox.
pub struct ServiceController {
    config: Arc<Config>,
    scope: Scope,
    registry: Arc<InstanceRegistry>,
    source: ServiceEventSource,
    addresses: AddressManager,
    advertiser: Advertiser,
    elections: ElectionBackend,
    global_election: Option<watch::Receiver<bool>>,
    endpoints: EndpointBackend,
    metrics: Metrics,
}

impl ServiceController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        scope: Scope,
        registry: Arc<InstanceRegistry>,
        source: ServiceEventSource,
        addresses: AddressManager,
        advertiser: Advertiser,
        elections: ElectionBackend,
        global_election: Option<watch::Receiver<bool>>,
        endpoints: EndpointBackend,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            scope,
            registry,
            source,
            addresses,
            advertiser,
            elections,
            global_election,
            endpoints,
            metrics,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        if self.config.service_namespace.is_empty() {
            tracing::info!("starting services watcher for all namespaces");
        } else {
            tracing::info!(
                namespace = self.config.service_namespace,
                "starting services watcher"
            );
        }

        let result = loop {
            let event = tokio::select! {
                _ = self.scope.cancelled() => break Ok(()),
                event = self.source.recv() => event,
            };
            match event {
                Ok(Some(event)) => {
                    if let Err(e) = self.handle(event).await {
                        // one service failing is never a reason to stop
                        // serving the rest
                        tracing::error!(error=%e, "failed to process a service event");
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.drain().await;
        tracing::info!("stopped watching services");
        result
    }

    async fn handle(&mut self, event: ServiceEvent) -> Result<(), Error> {
        self.metrics.watch_event(event.type_label());
        match event {
            ServiceEvent::Added(svc) | ServiceEvent::Modified(svc) => self.upsert(svc).await,
            ServiceEvent::Deleted(svc) => self.delete(svc).await,
            ServiceEvent::Bookmark => Ok(()),
            ServiceEvent::Error(message) => {
                tracing::warn!(error = message, "error event from the services watch");
                Ok(())
            }
        }
    }

    async fn upsert(&mut self, svc: Service) -> Result<(), Error> {
        let uid = svc.uid().ok_or(Error::MissingUid)?;

        if !service::accepts(&svc, &self.config) {
            // a service that stops matching the filters is gone as far as
            // the engine is concerned
            if self.registry.contains(&uid)? {
                tracing::info!(
                    uid = uid,
                    name = svc.name_any(),
                    "service no longer accepted, tearing down"
                );
                self.destroy(&uid).await;
            }
            return Ok(());
        }

        let snapshot = ServiceSnapshot::from_service(&svc)?;
        if snapshot.addresses.is_empty() {
            tracing::debug!(
                uid = uid,
                name = snapshot.name,
                "no load balancer address assigned yet"
            );
            return Ok(());
        }

        match self.registry.find(&uid, &snapshot.addresses)? {
            Some((existing_uid, previous)) => {
                if existing_uid != uid {
                    tracing::warn!(
                        old_uid = existing_uid,
                        uid = uid,
                        name = snapshot.name,
                        "service was recreated under a new UID"
                    );
                    self.destroy(&existing_uid).await;
                    self.spawn_actor(snapshot);
                } else if previous.addresses == snapshot.addresses {
                    tracing::debug!(
                        uid = uid,
                        name = snapshot.name,
                        "service modified without address changes"
                    );
                    match self.registry.update(&uid, snapshot.clone())? {
                        Some(mailbox) => {
                            if mailbox.send(snapshot.clone()).is_err() {
                                tracing::warn!(
                                    uid = uid,
                                    name = snapshot.name,
                                    "actor is gone, recreating"
                                );
                                self.destroy(&uid).await;
                                self.spawn_actor(snapshot);
                            }
                        }
                        None => self.spawn_actor(snapshot),
                    }
                } else {
                    tracing::warn!(
                        uid = uid,
                        name = snapshot.name,
                        old = ?previous.addresses,
                        new = ?snapshot.addresses,
                        "load balancer addresses changed, cancelling the original actor"
                    );
                    self.destroy(&uid).await;
                    self.spawn_actor(snapshot);
                }
            }
            None => {
                tracing::info!(
                    uid = uid,
                    name = snapshot.name,
                    namespace = snapshot.namespace,
                    addresses = ?snapshot.addresses,
                    "service added"
                );
                self.spawn_actor(snapshot);
            }
        }
        Ok(())
    }

    async fn delete(&mut self, svc: Service) -> Result<(), Error> {
        let uid = svc.uid().ok_or(Error::MissingUid)?;
        if self.registry.contains(&uid)? {
            self.destroy(&uid).await;
            tracing::info!(
                uid = uid,
                name = svc.name_any(),
                namespace = svc.namespace().unwrap_or_default(),
                "service deleted"
            );
        }
        Ok(())
    }

    fn spawn_actor(&self, snapshot: ServiceSnapshot) {
        let scope = self.scope.child();
        let topology = self.config.election_topology();
        let election = match topology {
            ElectionTopology::PerService => Some(self.elections.watch(
                &scope,
                &service_lease_name(&snapshot.namespace, &snapshot.name),
            )),
            ElectionTopology::Global => self.global_election.clone(),
            ElectionTopology::None => None,
        };
        let tracker = if snapshot.traffic_policy == TrafficPolicy::Local
            && topology != ElectionTopology::Global
        {
            Some(
                self.endpoints
                    .track(&scope, &snapshot.namespace, &snapshot.name),
            )
        } else {
            None
        };

        let (mailbox, receiver) = mpsc::unbounded_channel();
        let actor = ServiceActor::new(
            self.config.clone(),
            snapshot.clone(),
            scope.clone(),
            receiver,
            self.addresses.clone(),
            self.advertiser.clone(),
            election,
            tracker,
            self.metrics.clone(),
        );
        let task = tokio::spawn(actor.run());

        let instance = ServiceInstance {
            snapshot,
            scope,
            mailbox,
            task: Some(task),
        };
        if let Err(e) = self.registry.store(instance) {
            tracing::error!(error=%e, "failed to store the service instance");
            return;
        }
        self.metrics.active_services.inc();
    }

    /// Cancels the actor and waits for its teardown to finish, so a
    /// replacement for the same UID never observes leftover host state.
    async fn destroy(&mut self, uid: &str) {
        let mut instance = match self.registry.remove(uid) {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error=%e, uid = uid, "failed to remove the service instance");
                return;
            }
        };
        instance.scope.cancel();
        tracing::debug!(uid = uid, "waiting for the service actor to finish");
        if let Some(task) = instance.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error=%e, uid = uid, "service actor task failed");
            }
        }
        self.metrics.active_services.dec();
    }

    async fn drain(&mut self) {
        let instances = match self.registry.drain() {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(error=%e, "failed to drain the registry");
                return;
            }
        };
        for mut instance in instances {
            instance.scope.cancel();
            if let Some(task) = instance.task.take() {
                if let Err(e) = task.await {
                    tracing::error!(
                        error=%e,
                        uid = instance.snapshot.uid,
                        "service actor task failed during drain"
                    );
                }
            }
            self.metrics.active_services.dec();
        }
    }
}
