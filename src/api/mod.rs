use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::FromRef, http::StatusCode, response::IntoResponse, routing::get};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::{config::Config, delivery::DeliveryEngine, registry::Registry};

pub mod auth;
pub mod error;
pub mod messages;
pub mod validation;

use error::PrettyJson;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub engine: DeliveryEngine,
}

impl FromRef<ApiState> for Arc<Config> {
    fn from_ref(state: &ApiState) -> Self {
        state.config.clone()
    }
}

#[derive(OpenApi)]
#[openapi(paths(
    messages::get_message,
    messages::send_message,
    messages::async_send_message
))]
struct ApiDoc;

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        config: Arc<Config>,
        registry: Arc<Registry>,
        engine: DeliveryEngine,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let docs_enabled = config.http.docs_enabled;
        let max_body = config.http.max_body;

        let state = ApiState {
            config,
            registry,
            engine,
        };

        let (message_router, _) = OpenApiRouter::with_openapi(ApiDoc::openapi())
            .routes(routes!(messages::get_message))
            .routes(routes!(messages::send_message))
            .routes(routes!(messages::async_send_message))
            .with_state(state.clone())
            .split_for_parts();

        let mut router = Router::new()
            .route("/", get(root))
            .merge(message_router)
            .fallback(not_found)
            .layer((
                TraceLayer::new_for_http(),
                RequestBodyLimitLayer::new(max_body),
                TimeoutLayer::new(Duration::from_secs(30)),
            ));

        if docs_enabled {
            router = router.route("/docs", get(docs));
        }

        ApiServer {
            socket,
            router,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("restmailer listening on {}", self.socket);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(e) = self.serve().await {
                error!("server error: {:?}", e);
                token.cancel();
            }
        });
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

async fn root() -> &'static str {
    "restmailer is serving requests"
}

async fn docs() -> impl IntoResponse {
    PrettyJson(ApiDoc::openapi())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Method not found")
}
