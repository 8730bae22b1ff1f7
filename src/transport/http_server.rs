//! HTTP server exposing a silo's directory endpoint

use crate::directory::types::{ClusterId, HostId};
use crate::transport::messages::{
    ActivationBatchRequest, ActivationBatchResponse, ActivationRequest, DeactivationsRequest,
    DeletionRequest, HealthResponse, NonexistingActivationRequest, NoticeResponse,
    ACTIVATION_BATCH_PATH, ACTIVATION_PATH, DEACTIVATIONS_PATH, DELETION_PATH, HEALTH_PATH,
    NONEXISTING_ACTIVATION_PATH,
};
use crate::transport::DirectoryService;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use slog::{debug, error, info, warn, Logger};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// HTTP server for receiving directory requests
#[derive(Clone)]
pub struct HttpDirectoryServer {
    /// Endpoint that answers the requests
    service: Arc<dyn DirectoryService>,
    cluster_id: ClusterId,
    silo: HostId,
    logger: Logger,
}

impl HttpDirectoryServer {
    pub fn new(
        service: Arc<dyn DirectoryService>,
        cluster_id: ClusterId,
        silo: HostId,
        logger: Logger,
    ) -> Self {
        Self {
            service,
            cluster_id,
            silo,
            logger,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(ACTIVATION_PATH, post(handle_activation))
            .route(ACTIVATION_BATCH_PATH, post(handle_activation_batch))
            .route(DEACTIVATIONS_PATH, post(handle_deactivations))
            .route(DELETION_PATH, post(handle_deletion))
            .route(NONEXISTING_ACTIVATION_PATH, post(handle_nonexisting_activation))
            .route(HEALTH_PATH, get(handle_health))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let address = listener.local_addr()?;
        let app = self.router();
        info!(self.logger, "HTTP directory server listening"; "address" => %address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| {
                error!(self.logger, "HTTP server error"; "error" => %e);
                e
            })?;

        info!(self.logger, "HTTP directory server stopped"; "address" => %address);
        Ok(())
    }
}

async fn handle_activation(
    State(server): State<HttpDirectoryServer>,
    Json(req): Json<ActivationRequest>,
) -> Response {
    debug!(server.logger, "Activation request via HTTP";
        "grain" => %req.grain,
        "from" => %req.requesting_cluster,
        "hop" => req.hop_count
    );
    let response = server
        .service
        .process_activation_request(req.grain, req.requesting_cluster, req.hop_count)
        .await;
    Json(response).into_response()
}

async fn handle_activation_batch(
    State(server): State<HttpDirectoryServer>,
    Json(req): Json<ActivationBatchRequest>,
) -> Response {
    debug!(server.logger, "Activation batch via HTTP";
        "grains" => req.grains.len(),
        "from" => %req.requesting_cluster
    );
    let responses = server
        .service
        .process_activation_request_batch(req.grains, req.requesting_cluster, req.hop_count)
        .await;
    Json(ActivationBatchResponse { responses }).into_response()
}

fn notice_reply(server: &HttpDirectoryServer, result: Result<(), crate::errors::DirectoryError>) -> Response {
    match result {
        Ok(()) => Json(NoticeResponse::ok()).into_response(),
        Err(e) => {
            warn!(server.logger, "Failed to process directory notice"; "error" => %e);
            Json(NoticeResponse::error(e.to_string())).into_response()
        }
    }
}

async fn handle_deactivations(
    State(server): State<HttpDirectoryServer>,
    Json(req): Json<DeactivationsRequest>,
) -> Response {
    let result = server
        .service
        .process_deactivations(req.addresses, req.hop_count)
        .await;
    notice_reply(&server, result)
}

async fn handle_deletion(
    State(server): State<HttpDirectoryServer>,
    Json(req): Json<DeletionRequest>,
) -> Response {
    let result = server.service.process_deletion(req.grain, req.hop_count).await;
    notice_reply(&server, result)
}

async fn handle_nonexisting_activation(
    State(server): State<HttpDirectoryServer>,
    Json(req): Json<NonexistingActivationRequest>,
) -> Response {
    let result = server
        .service
        .unregister_after_nonexisting_activation(req.address, req.hop_count)
        .await;
    notice_reply(&server, result)
}

async fn handle_health(State(server): State<HttpDirectoryServer>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cluster_id: server.cluster_id.clone(),
        silo: server.silo.to_string(),
    })
}
