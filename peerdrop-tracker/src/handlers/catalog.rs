//! Descriptor catalog and peer listing endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use peerdrop_core::FileDescriptor;
use peerdrop_core::tracker::PeerRegistry;
use peerdrop_core::tracker::messages::{FilesResponse, PeerSummary, PeersResponse, PublishResponse};

use super::{ApiJson, ApiResult};

pub async fn publish_descriptor(
    State(registry): State<Arc<PeerRegistry>>,
    ApiJson(descriptor): ApiJson<FileDescriptor>,
) -> ApiResult<PublishResponse> {
    let stored = registry.publish_descriptor(descriptor)?;
    Ok(Json(PublishResponse { stored }))
}

pub async fn get_descriptor(
    State(registry): State<Arc<PeerRegistry>>,
    Path(filename): Path<String>,
) -> ApiResult<FileDescriptor> {
    let descriptor = registry.descriptor(&filename)?;
    Ok(Json(FileDescriptor::clone(&descriptor)))
}

pub async fn list_peers(State(registry): State<Arc<PeerRegistry>>) -> ApiResult<PeersResponse> {
    let peers = registry.snapshot().iter().map(PeerSummary::from).collect();
    Ok(Json(PeersResponse { peers }))
}

pub async fn list_files(State(registry): State<Arc<PeerRegistry>>) -> ApiResult<FilesResponse> {
    Ok(Json(FilesResponse {
        files: registry.files(),
    }))
}
