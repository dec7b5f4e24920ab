pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};

use crate::chat::handlers;
use crate::generation::handlers::handle_generate_cv;
use crate::state::AppState;

/// Headroom over the attachment limit for multipart framing.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.config.max_attachment_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health::health_handler))
        // Chat sessions
        .route("/api/v1/sessions", post(handlers::handle_create_session))
        .route("/api/v1/sessions/:id", delete(handlers::handle_end_session))
        .route(
            "/api/v1/sessions/:id/history",
            get(handlers::handle_get_history),
        )
        .route(
            "/api/v1/sessions/:id/attachments",
            post(handlers::handle_upload_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/v1/sessions/:id/messages",
            post(handlers::handle_send_message),
        )
        .route(
            "/api/v1/sessions/:id/actions/:action_id",
            post(handlers::handle_quick_action),
        )
        // CV generation
        .route("/api/v1/cv/generate", post(handle_generate_cv))
        .with_state(state)
}
