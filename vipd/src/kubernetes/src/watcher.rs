use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::mpsc;

use crate::error::Error;

const MIN_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A typed service watch event. Everything the controller consumes goes
/// through this variant, so tests can feed the engine from a channel.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added(Service),
    Modified(Service),
    Deleted(Service),
    Bookmark,
    Error(String),
}

impl ServiceEvent {
    pub fn type_label(&self) -> &'static str {
        match self {
            ServiceEvent::Added(_) => "ADDED",
            ServiceEvent::Modified(_) => "MODIFIED",
            ServiceEvent::Deleted(_) => "DELETED",
            ServiceEvent::Bookmark => "BOOKMARK",
            ServiceEvent::Error(_) => "ERROR",
        }
    }
}

pub enum ServiceEventSource {
    Kube(KubeServiceWatcher),
    Mock(mpsc::Receiver<ServiceEvent>),
}

impl ServiceEventSource {
    /// The next event, or `None` when the source is exhausted (mock only;
    /// the kube watcher restarts itself until the process ends).
    pub async fn recv(&mut self) -> Result<Option<ServiceEvent>, Error> {
        match self {
            ServiceEventSource::Kube(w) => w.recv().await.map(Some),
            ServiceEventSource::Mock(rx) => Ok(rx.recv().await),
        }
    }
}

/// A watch on Services that survives API-server disconnects by
/// re-subscribing at the last seen resource version, with bounded backoff
/// between attempts. A failure to establish the very first watch is
/// fatal; later failures are transient.
pub struct KubeServiceWatcher {
    api: Api<Service>,
    params: WatchParams,
    version: Option<String>,
    stream: Option<BoxStream<'static, kube::Result<WatchEvent<Service>>>>,
    backoff: Duration,
    started: bool,
}

impl KubeServiceWatcher {
    pub fn new(client: Client, namespace: &str) -> Self {
        let api = if namespace.is_empty() {
            Api::all(client)
        } else {
            Api::namespaced(client, namespace)
        };
        Self {
            api,
            params: WatchParams::default(),
            version: None,
            stream: None,
            backoff: MIN_BACKOFF,
            started: false,
        }
    }

    pub async fn recv(&mut self) -> Result<ServiceEvent, Error> {
        loop {
            if self.stream.is_none() {
                self.subscribe().await?;
            }
            match self.stream.as_mut().unwrap().next().await {
                Some(Ok(event)) => {
                    self.backoff = MIN_BACKOFF;
                    match event {
                        WatchEvent::Added(svc) => {
                            self.observe(&svc);
                            return Ok(ServiceEvent::Added(svc));
                        }
                        WatchEvent::Modified(svc) => {
                            self.observe(&svc);
                            return Ok(ServiceEvent::Modified(svc));
                        }
                        WatchEvent::Deleted(svc) => {
                            self.observe(&svc);
                            return Ok(ServiceEvent::Deleted(svc));
                        }
                        WatchEvent::Bookmark(bookmark) => {
                            self.version = Some(bookmark.metadata.resource_version.clone());
                            return Ok(ServiceEvent::Bookmark);
                        }
                        WatchEvent::Error(e) => {
                            if e.code == 410 {
                                // history is gone, relist for a fresh version
                                self.version = None;
                            }
                            self.stream = None;
                            return Ok(ServiceEvent::Error(e.message));
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error=?e, "services watch stream error, restarting");
                    self.stream = None;
                    self.wait_backoff().await;
                }
                None => {
                    tracing::debug!("services watch ended, restarting");
                    self.stream = None;
                    self.wait_backoff().await;
                }
            }
        }
    }

    async fn subscribe(&mut self) -> Result<(), Error> {
        loop {
            if self.version.is_none() {
                match self.api.list(&ListParams::default().limit(1)).await {
                    Ok(list) => {
                        self.version =
                            Some(list.metadata.resource_version.unwrap_or_else(|| "0".to_string()))
                    }
                    Err(e) if !self.started => return Err(Error::WatchStart(e)),
                    Err(e) => {
                        tracing::warn!(error=?e, "failed to list services for the watch version");
                        self.wait_backoff().await;
                        continue;
                    }
                }
            }
            let version = self.version.clone().unwrap();
            match self.api.watch(&self.params, &version).await {
                Ok(stream) => {
                    self.stream = Some(stream.boxed());
                    self.started = true;
                    return Ok(());
                }
                Err(e) if !self.started => return Err(Error::WatchStart(e)),
                Err(e) => {
                    tracing::warn!(error=?e, "failed to re-subscribe the services watch");
                    // the stored version may have expired while we were away
                    self.version = None;
                    self.wait_backoff().await;
                }
            }
        }
    }

    fn observe(&mut self, svc: &Service) {
        if let Some(version) = svc.resource_version() {
            self.version = Some(version);
        }
    }

    async fn wait_backoff(&mut self) {
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
    }
}
