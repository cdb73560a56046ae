//! Control-plane message bodies exchanged with the tracker as JSON.
//!
//! Requests identify the caller by the connection's remote IP plus the
//! `port` field, the port the caller serves pieces on.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FileAssignment, PeerKey, PeerRecord, PeerStatus, TrackedFile, TrackerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub port: u16,
    pub files: Vec<String>,
    pub file_sizes: Vec<u64>,
}

/// Body shared by Heartbeat and Disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdlePeersRequest {
    pub port: u16,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdlePeersRequest {
    pub port: u16,
    pub filenames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFileRequest {
    pub peer_address: SocketAddr,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTransferRequest {
    pub peer_address: SocketAddr,
}

/// Plain acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ack {
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdlePeersResponse {
    PeersAvailable { peers: Vec<PeerKey> },
    NotEnough { available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileIdlePeersResponse {
    PeersAvailable(FileAssignment),
    NotEnough { requested: usize, matched: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestFileResponse {
    PeerContact { ip: IpAddr, port: u16 },
    PeerBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// False when an identical descriptor was already known.
    pub stored: bool,
}

/// One row of the peer listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub address: PeerKey,
    pub status: PeerStatus,
    pub files: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(record: &PeerRecord) -> Self {
        Self {
            address: record.key,
            status: record.status,
            files: record.files.iter().cloned().collect(),
            registered_at: record.registered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesResponse {
    pub files: Vec<TrackedFile>,
}

/// Error body returned with any non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl From<&TrackerError> for ErrorBody {
    fn from(error: &TrackerError) -> Self {
        let (peer, filename) = match error {
            TrackerError::NotRegistered { peer } | TrackerError::PeerBusy { peer } => {
                (Some(*peer), None)
            }
            TrackerError::UnknownFile { filename }
            | TrackerError::DescriptorConflict { filename } => (None, Some(filename.clone())),
            _ => (None, None),
        };

        Self {
            error: error.kind().to_string(),
            message: match error {
                TrackerError::InvalidRegistration { reason } => reason.clone(),
                TrackerError::Protocol { message } => message.clone(),
                other => other.to_string(),
            },
            peer,
            filename,
        }
    }
}

impl ErrorBody {
    /// Rebuilds the registry error the tracker reported.
    pub fn into_tracker_error(self) -> TrackerError {
        let Self {
            error,
            message,
            peer,
            filename,
        } = self;

        match (error.as_str(), peer, filename) {
            ("invalid_registration", _, _) => TrackerError::InvalidRegistration { reason: message },
            ("protocol", _, _) => TrackerError::Protocol { message },
            ("not_registered", Some(peer), _) => TrackerError::NotRegistered { peer },
            ("peer_busy", Some(peer), _) => TrackerError::PeerBusy { peer },
            ("unknown_file", _, Some(filename)) => TrackerError::UnknownFile { filename },
            ("descriptor_conflict", _, Some(filename)) => {
                TrackerError::DescriptorConflict { filename }
            }
            (kind, _, _) => TrackerError::Rejected {
                kind: kind.to_string(),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_file_idle_peers_wire_format() {
        let peer: PeerKey = PeerKey::new("10.0.0.1:7001".parse().unwrap());
        let response = FileIdlePeersResponse::PeersAvailable(FileAssignment {
            peers: BTreeMap::from([("f1".to_string(), peer)]),
            alternates: BTreeMap::from([("f1".to_string(), vec![])]),
            file_sizes: BTreeMap::from([("f1".to_string(), 3000)]),
        });

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "peers_available",
                "peers": { "f1": "10.0.0.1:7001" },
                "alternates": { "f1": [] },
                "file_sizes": { "f1": 3000 }
            })
        );

        let decoded: FileIdlePeersResponse = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, response);

        let not_enough: FileIdlePeersResponse =
            serde_json::from_value(json!({"type": "not_enough", "requested": 2, "matched": 1}))
                .unwrap();
        assert_eq!(
            not_enough,
            FileIdlePeersResponse::NotEnough {
                requested: 2,
                matched: 1
            }
        );
    }

    #[test]
    fn test_request_file_wire_format() {
        let contact = RequestFileResponse::PeerContact {
            ip: "10.0.0.1".parse().unwrap(),
            port: 7001,
        };
        assert_eq!(
            serde_json::to_value(contact).unwrap(),
            json!({"type": "peer_contact", "ip": "10.0.0.1", "port": 7001})
        );
        assert_eq!(
            serde_json::to_value(RequestFileResponse::PeerBusy).unwrap(),
            json!({"type": "peer_busy"})
        );
    }

    #[test]
    fn test_errors_survive_the_boundary() {
        let peer = PeerKey::new("10.0.0.1:7001".parse().unwrap());
        let errors = [
            TrackerError::NotRegistered { peer },
            TrackerError::PeerBusy { peer },
            TrackerError::UnknownFile {
                filename: "f1".to_string(),
            },
            TrackerError::DescriptorConflict {
                filename: "f1".to_string(),
            },
            TrackerError::InvalidRegistration {
                reason: "bad".to_string(),
            },
            TrackerError::Protocol {
                message: "missing field `port`".to_string(),
            },
        ];

        for error in errors {
            let body = ErrorBody::from(&error);
            let wire: ErrorBody =
                serde_json::from_str(&serde_json::to_string(&body).unwrap()).unwrap();
            let rebuilt = wire.into_tracker_error();
            assert_eq!(rebuilt.kind(), error.kind());
            assert_eq!(rebuilt.to_string(), error.to_string());
        }
    }
}
