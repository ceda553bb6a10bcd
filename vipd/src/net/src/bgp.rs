use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnet::IpNet;
use tokio::time::Instant;

use vipd_proto::speaker::speaker_api_client::SpeakerApiClient;
use vipd_proto::speaker::{AddPathRequest, DeletePathRequest};

use crate::error::Error;

/// Announces VIPs by adding and removing prefixes on the local BGP
/// speaker daemon. All nodes may advertise the same prefix (multipath),
/// so no election is required.
#[derive(Debug, Clone)]
pub struct BgpAdvertiser {
    speaker: Arc<Speaker>,
    prefix_v4: u8,
    prefix_v6: u8,
    bind_addresses: bool,
}

impl BgpAdvertiser {
    pub fn new(speaker: Speaker, prefix_v4: u8, prefix_v6: u8, bind_addresses: bool) -> Self {
        Self {
            speaker: Arc::new(speaker),
            prefix_v4,
            prefix_v6,
            bind_addresses,
        }
    }

    pub fn binds_addresses(&self) -> bool {
        self.bind_addresses
    }

    fn prefix(&self, addr: IpAddr) -> Result<String, Error> {
        let len = match addr {
            IpAddr::V4(_) => self.prefix_v4,
            IpAddr::V6(_) => self.prefix_v6,
        };
        IpNet::new(addr, len)
            .map(|net| net.to_string())
            .map_err(|_| Error::InvalidPrefix(addr))
    }

    pub async fn announce(&self, addr: IpAddr) -> Result<(), Error> {
        let prefix = self.prefix(addr)?;
        self.speaker.add_path(prefix).await
    }

    pub async fn withdraw(&self, addr: IpAddr) -> Result<(), Error> {
        let prefix = self.prefix(addr)?;
        self.speaker.delete_path(prefix).await
    }
}

/// Transport to the BGP speaker. The gRPC variant talks to the local
/// daemon; the mock records the advertised prefix set for tests.
#[derive(Debug)]
pub enum Speaker {
    Grpc(GrpcSpeaker),
    Mock(Arc<MockSpeaker>),
}

impl Speaker {
    pub async fn add_path(&self, prefix: String) -> Result<(), Error> {
        match self {
            Speaker::Grpc(s) => s.add_path(prefix).await,
            Speaker::Mock(m) => {
                m.paths.lock().unwrap().insert(prefix);
                Ok(())
            }
        }
    }

    pub async fn delete_path(&self, prefix: String) -> Result<(), Error> {
        match self {
            Speaker::Grpc(s) => s.delete_path(prefix).await,
            Speaker::Mock(m) => {
                m.paths.lock().unwrap().remove(&prefix);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MockSpeaker {
    pub paths: Mutex<BTreeSet<String>>,
}

impl MockSpeaker {
    pub fn paths(&self) -> BTreeSet<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct GrpcSpeaker {
    endpoint: String,
    timeout: Duration,
    client: tokio::sync::Mutex<Option<SpeakerApiClient<tonic::transport::Channel>>>,
}

impl GrpcSpeaker {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timeout,
            client: tokio::sync::Mutex::new(None),
        }
    }

    async fn try_connect(&self) -> Result<SpeakerApiClient<tonic::transport::Channel>, Error> {
        let url = format!("http://{}", self.endpoint);
        SpeakerApiClient::connect(url)
            .await
            .map_err(Error::SpeakerTransport)
    }

    async fn connect(&self) -> Result<SpeakerApiClient<tonic::transport::Channel>, Error> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.try_connect().await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    if Instant::now() > deadline {
                        tracing::error!(error=?e, endpoint=self.endpoint, "giving up connecting to the speaker");
                        return Err(Error::SpeakerTimeout);
                    }
                    tracing::warn!(error=?e, endpoint=self.endpoint, "failed to connect to the speaker, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn add_path(&self, prefix: String) -> Result<(), Error> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let client = guard.as_mut().unwrap();
        match client
            .add_path(AddPathRequest {
                prefixes: vec![prefix],
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(status) => {
                // drop the channel so the next call reconnects
                *guard = None;
                Err(Error::Speaker(status))
            }
        }
    }

    async fn delete_path(&self, prefix: String) -> Result<(), Error> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let client = guard.as_mut().unwrap();
        match client
            .delete_path(DeletePathRequest {
                prefixes: vec![prefix],
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(status) => {
                *guard = None;
                Err(Error::Speaker(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn advertiser_tracks_prefixes_on_the_speaker() {
        let speaker = Arc::new(MockSpeaker::default());
        let advertiser = BgpAdvertiser::new(Speaker::Mock(speaker.clone()), 32, 128, false);

        advertiser.announce("10.0.0.6".parse().unwrap()).await.unwrap();
        advertiser.announce("2001:db8::1".parse().unwrap()).await.unwrap();
        assert_eq!(
            speaker.paths(),
            BTreeSet::from(["10.0.0.6/32".to_string(), "2001:db8::1/128".to_string()])
        );

        advertiser.withdraw("10.0.0.6".parse().unwrap()).await.unwrap();
        assert_eq!(
            speaker.paths(),
            BTreeSet::from(["2001:db8::1/128".to_string()])
        );
    }
}
