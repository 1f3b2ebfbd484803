//! The HTTP API.
//!
//! Thin write-through to the store: obtain creates an Unbound allocation
//! and waits on a per-id watch for the controller to bind it; release is
//! the mirror image. Nothing here talks to DHCP or the kernel.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mayfly_common::{service_hostname, Allocation, MacAddr};
use mayfly_store::{AllocationEvent, StateStore, StoreError};

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";
const STATUS_TIMEOUT: &str = "timeout";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    /// How long obtain waits for the controller before giving up.
    pub request_timeout: Duration,
}

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/ip", post(obtain_ip).delete(return_ip))
        .route("/v1/mac", post(register_macs).delete(remove_macs))
        .route("/v1/status", get(status))
}

#[derive(Debug, Deserialize)]
struct NewIpRequest {
    /// `namespace/name` of the requesting service.
    service: String,
}

#[derive(Debug, Deserialize)]
struct ReturnIpRequest {
    ip: String,
}

#[derive(Debug, Serialize)]
struct IpResponse {
    ip: String,
    id: String,
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct MacBatchRequest {
    #[serde(rename = "MACs")]
    macs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegisterMacResponse {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Rejected")]
    rejected: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RemoveMacResponse {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Unprocessed")]
    unprocessed: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "Allocations")]
    allocations: Vec<Allocation>,
    #[serde(rename = "AvailableMACs")]
    available_macs: Vec<String>,
}

async fn obtain_ip(State(state): State<AppState>, Json(request): Json<NewIpRequest>) -> Response {
    let hostname = service_hostname(&request.service);
    info!(service = %request.service, hostname = %hostname, "ip requested");

    let allocation = Allocation::new(hostname);
    // Arm the watch before the write: the controller can bind faster than a
    // late watcher would be installed.
    let mut watch = match state.store.watch_allocation(allocation.id).await {
        Ok(watch) => watch,
        Err(e) => {
            warn!(error = %e, "could not watch allocation");
            return store_failure(&allocation);
        }
    };
    if let Err(e) = state.store.put(&allocation).await {
        warn!(error = %e, "could not create allocation");
        return store_failure(&allocation);
    }

    let bound = tokio::time::timeout(state.request_timeout, async {
        while let Some(event) = watch.recv().await {
            match event {
                AllocationEvent::Created(updated) | AllocationEvent::Modified(updated) => {
                    if let Some(lease) = updated.lease {
                        return Some(lease.fixed_address);
                    }
                }
                AllocationEvent::Deleted(_) => {}
            }
        }
        None
    })
    .await;

    match bound {
        Ok(Some(ip)) => {
            info!(ip = %ip, hostname = %allocation.hostname, "ip assigned");
            (
                StatusCode::OK,
                Json(IpResponse {
                    ip: ip.to_string(),
                    id: allocation.id.to_string(),
                    status: STATUS_SUCCESS,
                }),
            )
                .into_response()
        }
        Ok(None) | Err(_) => {
            // No lease in time: withdraw the request so the controller
            // stops trying. Best effort — the record may already be gone.
            if let Err(e) = state.store.remove(&allocation).await {
                warn!(id = %allocation.id, error = %e, "could not remove timed-out allocation");
            }
            info!(hostname = %allocation.hostname, "ip request timed out");
            (
                StatusCode::OK,
                Json(IpResponse {
                    ip: String::new(),
                    id: allocation.id.to_string(),
                    status: STATUS_TIMEOUT,
                }),
            )
                .into_response()
        }
    }
}

fn store_failure(allocation: &Allocation) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(IpResponse {
            ip: String::new(),
            id: allocation.id.to_string(),
            status: STATUS_ERROR,
        }),
    )
        .into_response()
}

async fn return_ip(State(state): State<AppState>, Json(request): Json<ReturnIpRequest>) -> Response {
    let Ok(ip) = request.ip.parse::<Ipv4Addr>() else {
        info!(ip = %request.ip, "ignoring return request with unparsable ip");
        return (
            StatusCode::OK,
            Json(IpResponse {
                ip: "invalid".to_string(),
                id: String::new(),
                status: STATUS_ERROR,
            }),
        )
            .into_response();
    };

    let allocation = match state.store.get_by_ip(ip).await {
        Ok(allocation) => allocation,
        Err(e) => {
            warn!(ip = %ip, error = %e, "could not resolve allocation for returned ip");
            return (
                StatusCode::OK,
                Json(IpResponse {
                    ip: ip.to_string(),
                    id: String::new(),
                    status: STATUS_ERROR,
                }),
            )
                .into_response();
        }
    };

    if let Err(e) = state.store.remove(&allocation).await {
        warn!(ip = %ip, error = %e, "could not remove allocation");
        return (
            StatusCode::OK,
            Json(IpResponse {
                ip: ip.to_string(),
                id: allocation.id.to_string(),
                status: STATUS_ERROR,
            }),
        )
            .into_response();
    }

    info!(ip = %ip, id = %allocation.id, "ip returned");
    (
        StatusCode::OK,
        Json(IpResponse {
            ip: ip.to_string(),
            id: allocation.id.to_string(),
            status: STATUS_SUCCESS,
        }),
    )
        .into_response()
}

async fn register_macs(
    State(state): State<AppState>,
    Json(request): Json<MacBatchRequest>,
) -> Response {
    let mut rejected = Vec::new();
    for raw in &request.macs {
        match MacAddr::from_str(raw) {
            Ok(mac) => {
                if let Err(e) = state.store.put_mac(mac).await {
                    warn!(mac = %mac, error = %e, "could not register MAC");
                }
            }
            Err(_) => rejected.push(raw.clone()),
        }
    }

    let status = if rejected.is_empty() {
        STATUS_SUCCESS
    } else {
        STATUS_ERROR
    };
    (
        StatusCode::OK,
        Json(RegisterMacResponse { status, rejected }),
    )
        .into_response()
}

async fn remove_macs(
    State(state): State<AppState>,
    Json(request): Json<MacBatchRequest>,
) -> Response {
    let mut unprocessed = Vec::new();
    for raw in &request.macs {
        match MacAddr::from_str(raw) {
            Ok(mac) => {
                if let Err(e) = state.store.remove_mac(mac).await {
                    warn!(mac = %mac, error = %e, "could not remove MAC");
                }
            }
            Err(_) => unprocessed.push(raw.clone()),
        }
    }

    let status = if unprocessed.is_empty() {
        STATUS_SUCCESS
    } else {
        STATUS_ERROR
    };
    (
        StatusCode::OK,
        Json(RemoveMacResponse {
            status,
            unprocessed,
        }),
    )
        .into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let allocations = match state.store.allocations().await {
        Ok(allocations) => allocations,
        Err(e) => return status_failure(e),
    };
    let available_macs = match state.store.mac_pool().await {
        Ok(macs) => macs,
        Err(e) => return status_failure(e),
    };
    (
        StatusCode::OK,
        Json(StatusResponse {
            allocations,
            available_macs,
        }),
    )
        .into_response()
}

fn status_failure(error: StoreError) -> Response {
    warn!(error = %error, "could not snapshot state");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
