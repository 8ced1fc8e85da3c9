//! HTTP route handlers.
//!
//! `POST /?protocol=&path=` configures the bulk-data channel,
//! `GET /-METADATA-` and `POST /-SHUTDOWN-` are control requests, and every
//! other `GET /<member>` invokes a handler member.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};

use crate::bridge::protocol::{ConfigureQuery, Fault, METADATA, SHUTDOWN};
use crate::worker::WorkerService;

fn fault_response(fault: Fault) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(fault)).into_response()
}

async fn configure(
    State(service): State<Arc<WorkerService>>,
    query: Result<Query<ConfigureQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => {
            return fault_response(Fault::protocol_error(format!(
                "expected ?protocol=<version>&path=<file>: {rejection}"
            )));
        }
    };
    match service.configure(query.protocol, query.path).await {
        Ok(handshake) => (StatusCode::OK, Json(handshake)).into_response(),
        Err(fault) => fault_response(fault),
    }
}

async fn metadata(State(service): State<Arc<WorkerService>>) -> Response {
    (StatusCode::OK, Json(service.metadata().clone())).into_response()
}

async fn shutdown(State(service): State<Arc<WorkerService>>) -> Response {
    match service.shutdown().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(fault) => fault_response(fault),
    }
}

async fn invoke(
    State(service): State<Arc<WorkerService>>,
    Path(member): Path<String>,
) -> Response {
    match service.invoke(member).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(fault) => {
            tracing::debug!(fault = %fault.name, message = %fault.message, "Request raised");
            fault_response(fault)
        }
    }
}

pub fn routes(service: Arc<WorkerService>) -> Router {
    Router::new()
        .route("/", post(configure))
        .route(&format!("/{METADATA}"), get(metadata))
        .route(&format!("/{SHUTDOWN}"), post(shutdown))
        .route("/{member}", get(invoke))
        .with_state(service)
}
