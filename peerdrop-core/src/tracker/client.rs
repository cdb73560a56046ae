//! Peer-side access to the tracker's control plane.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::messages::{
    Ack, CompleteTransferRequest, ErrorBody, FileIdlePeersRequest, FileIdlePeersResponse,
    FilesResponse, IdlePeersRequest, IdlePeersResponse, PeerSummary, PeersResponse, PortRequest,
    PublishResponse, RegisterRequest, RequestFileRequest, RequestFileResponse,
};
use super::{FileAssignment, PeerKey, TrackedFile, TrackerError};
use crate::transfer::FileDescriptor;

/// Control-plane operations a peer performs against the tracker.
///
/// `port` arguments are the caller's own piece-serving port; together with
/// the caller's address they form its [`PeerKey`].
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Registers (or re-registers) the caller's inventory.
    ///
    /// # Errors
    /// - `TrackerError::InvalidRegistration` - Malformed inventory
    async fn register(
        &self,
        port: u16,
        files: &[String],
        file_sizes: &[u64],
    ) -> Result<(), TrackerError>;

    /// # Errors
    /// - `TrackerError::NotRegistered` - Caller was evicted or never registered
    async fn heartbeat(&self, port: u16) -> Result<(), TrackerError>;

    /// # Errors
    /// - `TrackerError::NotRegistered` - Caller is not registered
    async fn disconnect(&self, port: u16) -> Result<(), TrackerError>;

    /// # Errors
    /// - `TrackerError::NotEnoughPeers` - Fewer than `count` idle peers
    async fn idle_peers(&self, port: u16, count: usize) -> Result<Vec<PeerKey>, TrackerError>;

    /// Asks for one reserved idle holder per requested file.
    ///
    /// # Errors
    /// - `TrackerError::NotEnoughPeers` - Not every file could be matched
    async fn file_idle_peers(
        &self,
        port: u16,
        filenames: &[String],
    ) -> Result<FileAssignment, TrackerError>;

    /// # Errors
    /// - `TrackerError::PeerBusy` - Target is serving someone else
    async fn request_file(&self, peer: PeerKey, filename: &str) -> Result<PeerKey, TrackerError>;

    /// Tells the tracker a serving peer may return to Idle.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Serving peer is no longer known
    async fn complete_transfer(&self, peer: PeerKey) -> Result<(), TrackerError>;

    /// # Errors
    /// - `TrackerError::DescriptorConflict` - Different layout already published
    async fn publish_descriptor(&self, descriptor: &FileDescriptor) -> Result<bool, TrackerError>;

    /// # Errors
    /// - `TrackerError::UnknownFile` - Nothing published under this name
    async fn descriptor(&self, filename: &str) -> Result<FileDescriptor, TrackerError>;

    async fn peers(&self) -> Result<Vec<PeerSummary>, TrackerError>;

    /// Files the tracker knows about, with their current holder counts.
    async fn files(&self) -> Result<Vec<TrackedFile>, TrackerError>;

    /// Tracker location, for logging.
    fn tracker_url(&self) -> &str;
}

/// JSON-over-HTTP tracker client.
pub struct HttpTrackerClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates a client for a tracker at `address` (`host:port` or a full URL).
    ///
    /// # Errors
    /// - `TrackerError::Protocol` - Unparseable address
    /// - `TrackerError::Http` - HTTP client could not be built
    pub fn new(address: &str, timeout: Duration) -> Result<Self, TrackerError> {
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let base_url = Url::parse(&with_scheme).map_err(|e| TrackerError::Protocol {
            message: format!("invalid tracker address {address:?}: {e}"),
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("peerdrop/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TrackerError> {
        self.base_url
            .join(path)
            .map_err(|e| TrackerError::Protocol {
                message: format!("invalid tracker path {path:?}: {e}"),
            })
    }

    fn transport_error(&self, error: reqwest::Error) -> TrackerError {
        tracing::warn!(tracker = %self.base_url, error = %error, "Tracker request failed");
        if error.is_timeout() {
            TrackerError::TrackerTimeout {
                url: self.base_url.to_string(),
            }
        } else {
            TrackerError::Http(error)
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, TrackerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }

    async fn get<R: DeserializeOwned>(&self, url: Url) -> Result<R, TrackerError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }

    async fn decode<R: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<R, TrackerError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| TrackerError::Protocol {
                message: format!("malformed tracker response: {e}"),
            });
        }

        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.into_tracker_error()),
            Err(_) => Err(TrackerError::Rejected {
                kind: "http_status".to_string(),
                message: status_message(status),
            }),
        }
    }
}

fn status_message(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(|reason| format!("{} {reason}", status.as_u16()))
        .unwrap_or_else(|| status.as_u16().to_string())
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn register(
        &self,
        port: u16,
        files: &[String],
        file_sizes: &[u64],
    ) -> Result<(), TrackerError> {
        let request = RegisterRequest {
            port,
            files: files.to_vec(),
            file_sizes: file_sizes.to_vec(),
        };
        let Ack::Ok = self.post("register", &request).await?;
        tracing::debug!(tracker = %self.base_url, files = files.len(), "Registered with tracker");
        Ok(())
    }

    async fn heartbeat(&self, port: u16) -> Result<(), TrackerError> {
        let Ack::Ok = self.post("heartbeat", &PortRequest { port }).await?;
        Ok(())
    }

    async fn disconnect(&self, port: u16) -> Result<(), TrackerError> {
        let Ack::Ok = self.post("disconnect", &PortRequest { port }).await?;
        Ok(())
    }

    async fn idle_peers(&self, port: u16, count: usize) -> Result<Vec<PeerKey>, TrackerError> {
        let request = IdlePeersRequest { port, count };
        match self.post("idle-peers", &request).await? {
            IdlePeersResponse::PeersAvailable { peers } => Ok(peers),
            IdlePeersResponse::NotEnough { available } => Err(TrackerError::NotEnoughPeers {
                requested: count,
                matched: available,
            }),
        }
    }

    async fn file_idle_peers(
        &self,
        port: u16,
        filenames: &[String],
    ) -> Result<FileAssignment, TrackerError> {
        let request = FileIdlePeersRequest {
            port,
            filenames: filenames.to_vec(),
        };
        match self.post("file-idle-peers", &request).await? {
            FileIdlePeersResponse::PeersAvailable(assignment) => Ok(assignment),
            FileIdlePeersResponse::NotEnough { requested, matched } => {
                Err(TrackerError::NotEnoughPeers { requested, matched })
            }
        }
    }

    async fn request_file(&self, peer: PeerKey, filename: &str) -> Result<PeerKey, TrackerError> {
        let request = RequestFileRequest {
            peer_address: peer.address(),
            filename: filename.to_string(),
        };
        match self.post("request-file", &request).await? {
            RequestFileResponse::PeerContact { ip, port } => {
                Ok(PeerKey::new((ip, port).into()))
            }
            RequestFileResponse::PeerBusy => Err(TrackerError::PeerBusy { peer }),
        }
    }

    async fn complete_transfer(&self, peer: PeerKey) -> Result<(), TrackerError> {
        let request = CompleteTransferRequest {
            peer_address: peer.address(),
        };
        let Ack::Ok = self.post("complete-transfer", &request).await?;
        Ok(())
    }

    async fn publish_descriptor(&self, descriptor: &FileDescriptor) -> Result<bool, TrackerError> {
        let response: PublishResponse = self.post("descriptors", descriptor).await?;
        Ok(response.stored)
    }

    async fn descriptor(&self, filename: &str) -> Result<FileDescriptor, TrackerError> {
        let mut url = self.endpoint("descriptors/")?;
        url.path_segments_mut()
            .map_err(|_| TrackerError::Protocol {
                message: format!("tracker URL {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .push(filename);

        let descriptor: FileDescriptor = self.get(url).await?;
        descriptor.validate().map_err(|e| TrackerError::Protocol {
            message: e.to_string(),
        })?;
        Ok(descriptor)
    }

    async fn peers(&self) -> Result<Vec<PeerSummary>, TrackerError> {
        let response: PeersResponse = self.get(self.endpoint("peers")?).await?;
        Ok(response.peers)
    }

    async fn files(&self) -> Result<Vec<TrackedFile>, TrackerError> {
        let response: FilesResponse = self.get(self.endpoint("files")?).await?;
        Ok(response.files)
    }

    fn tracker_url(&self) -> &str {
        self.base_url.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_without_scheme() {
        let client = HttpTrackerClient::new("127.0.0.1:1108", Duration::from_secs(1)).unwrap();
        assert_eq!(client.tracker_url(), "http://127.0.0.1:1108/");
        assert_eq!(
            client.endpoint("file-idle-peers").unwrap().as_str(),
            "http://127.0.0.1:1108/file-idle-peers"
        );
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        assert!(matches!(
            HttpTrackerClient::new("http://[::1", Duration::from_secs(1)),
            Err(TrackerError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_tracker_reports_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpTrackerClient::new(&address.to_string(), Duration::from_secs(1)).unwrap();
        let result = client.heartbeat(7000).await;
        assert!(matches!(
            result,
            Err(TrackerError::Http(_) | TrackerError::TrackerTimeout { .. })
        ));
    }
}
