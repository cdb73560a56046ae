//! Registration, liveness and assignment endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use peerdrop_core::tracker::messages::{
    Ack, CompleteTransferRequest, FileIdlePeersRequest, FileIdlePeersResponse, IdlePeersRequest,
    IdlePeersResponse, PortRequest, RegisterRequest, RequestFileRequest, RequestFileResponse,
};
use peerdrop_core::tracker::{PeerKey, PeerRegistry};
use peerdrop_core::TrackerError;

use super::{ApiJson, ApiResult};

/// Key of the calling peer: its connection IP plus its advertised port.
fn caller(remote: SocketAddr, port: u16) -> PeerKey {
    PeerKey::new(SocketAddr::new(remote.ip(), port))
}

pub async fn register(
    State(registry): State<Arc<PeerRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Ack> {
    let Json(request) = payload.map_err(|rejection| TrackerError::InvalidRegistration {
        reason: rejection.body_text(),
    })?;
    registry.register(
        caller(remote, request.port),
        &request.files,
        &request.file_sizes,
    )?;
    Ok(Json(Ack::Ok))
}

pub async fn heartbeat(
    State(registry): State<Arc<PeerRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ApiJson(request): ApiJson<PortRequest>,
) -> ApiResult<Ack> {
    registry.heartbeat(caller(remote, request.port))?;
    Ok(Json(Ack::Ok))
}

pub async fn disconnect(
    State(registry): State<Arc<PeerRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ApiJson(request): ApiJson<PortRequest>,
) -> ApiResult<Ack> {
    registry.disconnect(caller(remote, request.port))?;
    Ok(Json(Ack::Ok))
}

pub async fn idle_peers(
    State(registry): State<Arc<PeerRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ApiJson(request): ApiJson<IdlePeersRequest>,
) -> ApiResult<IdlePeersResponse> {
    match registry.idle_peers(caller(remote, request.port), request.count) {
        Ok(peers) => Ok(Json(IdlePeersResponse::PeersAvailable { peers })),
        Err(TrackerError::NotEnoughPeers { matched, .. }) => {
            Ok(Json(IdlePeersResponse::NotEnough { available: matched }))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn file_idle_peers(
    State(registry): State<Arc<PeerRegistry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ApiJson(request): ApiJson<FileIdlePeersRequest>,
) -> ApiResult<FileIdlePeersResponse> {
    match registry.assign_files(Some(caller(remote, request.port)), &request.filenames) {
        Ok(assignment) => Ok(Json(FileIdlePeersResponse::PeersAvailable(assignment))),
        Err(TrackerError::NotEnoughPeers { requested, matched }) => {
            Ok(Json(FileIdlePeersResponse::NotEnough { requested, matched }))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn request_file(
    State(registry): State<Arc<PeerRegistry>>,
    ApiJson(request): ApiJson<RequestFileRequest>,
) -> ApiResult<RequestFileResponse> {
    match registry.request_file(PeerKey::new(request.peer_address), &request.filename) {
        Ok(peer) => Ok(Json(RequestFileResponse::PeerContact {
            ip: peer.address().ip(),
            port: peer.address().port(),
        })),
        Err(TrackerError::PeerBusy { .. }) => Ok(Json(RequestFileResponse::PeerBusy)),
        Err(e) => Err(e.into()),
    }
}

pub async fn complete_transfer(
    State(registry): State<Arc<PeerRegistry>>,
    ApiJson(request): ApiJson<CompleteTransferRequest>,
) -> ApiResult<Ack> {
    registry.complete_transfer(PeerKey::new(request.peer_address))?;
    Ok(Json(Ack::Ok))
}
