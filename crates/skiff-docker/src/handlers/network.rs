//! Network handlers, backed by port-layer scopes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use skiff_error::EngineError;
use skiff_portlayer::models::ScopeInfo;

use crate::api::AppState;
use crate::error::Result;
use crate::types::{
    Ipam, IpamConfig, NetworkCreateRequest, NetworkCreateResponse, NetworkSummary,
};

fn summarize(scope: &ScopeInfo) -> NetworkSummary {
    let config = if scope.subnet.is_some() || scope.gateway.is_some() {
        vec![IpamConfig {
            subnet: scope.subnet.clone(),
            gateway: scope.gateway.clone(),
        }]
    } else {
        Vec::new()
    };
    NetworkSummary {
        name: scope.name.clone(),
        id: scope.name.clone(),
        scope: "local".to_string(),
        driver: scope.scope_type.clone(),
        ipam: Ipam {
            driver: "default".to_string(),
            config,
        },
    }
}

/// `GET /networks`
pub async fn list_networks(State(state): State<AppState>) -> Result<Json<Vec<NetworkSummary>>> {
    let scopes = state.backend.portlayer().scope_list(None).await?;
    Ok(Json(scopes.iter().map(summarize).collect()))
}

/// `GET /networks/{id}`
pub async fn inspect_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NetworkSummary>> {
    let scopes = state.backend.portlayer().scope_list(Some(&id)).await?;
    let scope = scopes
        .first()
        .ok_or_else(|| EngineError::not_found(format!("No such network: {id}")))?;
    Ok(Json(summarize(scope)))
}

/// `POST /networks/create`
pub async fn create_network(
    State(state): State<AppState>,
    Json(req): Json<NetworkCreateRequest>,
) -> Result<(StatusCode, Json<NetworkCreateResponse>)> {
    let pool = req
        .ipam
        .and_then(|ipam| ipam.config.into_iter().next());
    let spec = ScopeInfo {
        name: req.name,
        scope_type: req.driver.unwrap_or_else(|| "bridge".to_string()),
        subnet: pool.as_ref().and_then(|p| p.subnet.clone()),
        gateway: pool.as_ref().and_then(|p| p.gateway.clone()),
    };
    let created = state.backend.portlayer().scope_create(&spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(NetworkCreateResponse {
            id: created.name,
            warning: String::new(),
        }),
    ))
}

/// `DELETE /networks/{id}`
pub async fn remove_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.backend.portlayer().scope_delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
