mod middleware;
mod print;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderName,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::print::PrintService;

use middleware::{log_responses, set_request_context};

pub use middleware::REQUEST_ID_HEADER;
pub use print::LAYERS_REMOVED_HEADER;

#[derive(Clone)]
pub struct HttpState {
    pub print: Arc<PrintService>,
    /// Header through which a trusted proxy passes extra authorized topics.
    pub trusted_topics_header: Option<HeaderName>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/print/info.json", get(print::info))
        .route("/print/create.json", post(print::create))
        .route("/print/create", post(print::create))
        .route("/print/{file}", get(print::show))
        .route("/_health", get(print::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
