use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use herald_core::directory::{ConversationDirectory, MessageStore};
use herald_core::ids::{EventId, UserId};
use herald_core::Event;
use herald_store::EventLog;

use crate::auth::{bearer_token, Authenticator};
use crate::catchup::{CatchupError, CatchupReader, CatchupSettings};
use crate::config::ServerConfig;
use crate::connection::{self, ConnectionSettings};
use crate::registry::{self, RegistryDeps, RegistryHandle};
use crate::shutdown::ShutdownCoordinator;

/// Everything the server needs from the outside world.
pub struct ServerDeps {
    pub log: EventLog,
    pub conversations: Arc<dyn ConversationDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub authenticator: Arc<dyn Authenticator>,
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub catchup: CatchupReader,
    pub authenticator: Arc<dyn Authenticator>,
    pub connection: ConnectionSettings,
    pub shutdown: ShutdownCoordinator,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/events", get(events_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Spawn the registry actor and the HTTP server. Returns once the listener is
/// bound.
pub async fn start(config: &ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let coordinator = ShutdownCoordinator::new();

    let (registry, registry_task) = registry::spawn(
        RegistryDeps {
            log: deps.log.clone(),
            conversations: deps.conversations,
            messages: deps.messages,
        },
        config.registry_mailbox_capacity,
        coordinator.token(),
    );

    let state = AppState {
        registry: registry.clone(),
        catchup: CatchupReader::new(deps.log, CatchupSettings::from(config)),
        authenticator: deps.authenticator,
        connection: ConnectionSettings::from(config),
        shutdown: coordinator.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "herald server listening");

    let router = build_router(state);
    let token = coordinator.token();
    let server_task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        local_addr,
        registry,
        coordinator,
        tasks: vec![server_task, registry_task],
    })
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: RegistryHandle,
    coordinator: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// For in-process producers: `registry().publish(...)`.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub async fn shutdown(self, timeout: Duration) {
        self.coordinator.graceful_shutdown(self.tasks, timeout).await;
        info!("herald server stopped");
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn authenticate(state: &AppState, token: Option<&str>) -> Result<UserId, Response> {
    let Some(token) = token else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "missing credentials"));
    };
    state
        .authenticator
        .authenticate(token)
        .await
        .map_err(|e| error_response(StatusCode::UNAUTHORIZED, e.to_string()))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let user_id = match authenticate(&state, params.token.as_deref()).await {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };

    let AppState {
        registry,
        connection: settings,
        shutdown,
        ..
    } = state;
    ws.max_message_size(settings.max_frame_bytes)
        .on_upgrade(move |socket| {
            connection::serve(socket, user_id, registry, settings, shutdown.token())
        })
}

#[derive(Debug, Deserialize)]
struct CatchupParams {
    since: Option<String>,
    limit: Option<String>,
}

async fn events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CatchupParams>,
) -> Response {
    let user_id = match authenticate(&state, bearer_token(&headers)).await {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };

    let limit = match params.limit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "limit must be a non-negative integer"),
        },
    };
    let since = params
        .since
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(EventId::from_raw);

    let cancel = state.shutdown.token().child_token();
    match state
        .catchup
        .poll(&user_id, since.as_ref(), limit, &cancel)
        .await
    {
        Ok(outcome) => events_response(outcome.into_events()),
        Err(CatchupError::UnknownCursor(id)) => {
            debug!(user_id = %user_id, cursor = %id, "unknown catch-up cursor");
            error_response(StatusCode::BAD_REQUEST, format!("unknown cursor: {id}"))
        }
        // Shutdown ends the wait like an idle deadline; the client re-polls.
        Err(CatchupError::Cancelled) => {
            debug!(user_id = %user_id, "catch-up cut short by shutdown");
            events_response(Vec::new())
        }
        Err(CatchupError::Store(e)) => {
            error!(user_id = %user_id, error = %e, "catch-up read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "event log unavailable")
        }
    }
}

fn events_response(events: Vec<Event>) -> Response {
    ([(header::CACHE_CONTROL, "no-cache")], Json(events)).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.registry.connected_count().await {
        Ok(connections) => Json(json!({ "status": "healthy", "connections": connections }))
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        )
            .into_response(),
    }
}
