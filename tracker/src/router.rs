use std::future::ready;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::database::Client;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::store::Store;
use crate::time::TimeSource;
use crate::token::TokenGenerator;
use crate::{event, init};

#[derive(Clone)]
pub struct State {
    pub store: Store,
    pub tokens: Arc<TokenGenerator>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub max_cookie_retries: NonZeroU32,
}

async fn index() -> &'static str {
    "tracker"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    client: Arc<dyn Client + Send + Sync>,
    tokens: TokenGenerator,
    config: &Config,
) -> Router {
    let state = State {
        store: Store::new(client),
        tokens: Arc::new(tokens),
        timesource: Arc::new(timesource),
        max_cookie_retries: config.max_cookie_retries,
    };

    // The client library sends the device cookie cross-origin, so the origin
    // is mirrored and credentials allowed.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/init", post(init::init))
        .route("/event/:kind", post(event::event))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if !config.export_prometheus {
        return router;
    }

    match setup_metrics_recorder() {
        Ok(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        Err(e) => {
            tracing::error!("failed to install prometheus recorder: {}", e);
            router
        }
    }
}
