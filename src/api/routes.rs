use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::AppState;
use crate::api::models::{SectionSummary, StatusResponse};
use crate::api::response;
use crate::api::static_files::{content_type_for, resolve};

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .fallback(static_handler)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state)
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    response::success(StatusResponse {
        scheduler: state.scheduler.status(),
        sections: state.config.news.sections.iter().map(SectionSummary::from).collect(),
    })
}

async fn static_handler(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(path) = resolve(&state.config.public_dir, uri.path()) else {
        warn!(path = uri.path(), "rejected request outside the public root");
        return response::plain(StatusCode::FORBIDDEN);
    };

    match tokio::fs::read(&path).await {
        Ok(body) => response::file(content_type_for(&path), body),
        Err(e) => {
            debug!(path = %path.display(), "static file unavailable: {e}");
            response::plain(StatusCode::NOT_FOUND)
        }
    }
}
