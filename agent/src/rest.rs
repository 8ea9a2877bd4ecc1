use crate::desired::DeviceDocuments;
use crate::metrics;
use crate::model::{DeviceMetadata, ReportedProperties};
use axum::{extract::State, routing::get, Json, Router};

#[derive(Debug, Clone)]
struct AppState {
    documents: DeviceDocuments,
}

pub fn create_router(documents: DeviceDocuments) -> Router {
    let state = AppState { documents };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/twin", get(get_twin))
        .route("/api/v1/metadata", get(get_metadata))
        .with_state(state)
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn get_twin(State(state): State<AppState>) -> Json<ReportedProperties> {
    Json(state.documents.reported())
}

async fn get_metadata(State(state): State<AppState>) -> Json<DeviceMetadata> {
    Json(state.documents.metadata())
}
