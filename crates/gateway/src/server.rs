use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Json},
        routing::{delete, get, post},
    },
    serde::Deserialize,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use {
    switchboard_channels::{ChannelTransport, LoopbackTransport, TransportError},
    switchboard_config::SwitchboardConfig,
};

use crate::{
    auth,
    dispatch::SendTextRequest,
    error::GatewayError,
    guards::require_admin,
    state::GatewayState,
};

type ApiResult<T> = Result<T, GatewayError>;

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceBody {
    instance_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchQuery {
    instance_name: Option<String>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/instance/create", post(create_handler))
        .route("/instance/init/{instance}", get(init_handler))
        .route("/instance/connect/{instance}", get(connect_handler))
        .route(
            "/instance/connectionState/{instance}",
            get(connection_state_handler),
        )
        .route("/instance/fetchInstances", get(fetch_instances_handler))
        .route("/instance/logout/{instance}", delete(logout_handler))
        .route("/instance/delete/{instance}", delete(delete_handler))
        .route("/message/sendText/{instance}", post(send_text_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP server and run until Ctrl-C.
pub async fn start_gateway(config: SwitchboardConfig) -> anyhow::Result<()> {
    let strategy = auth::install(&config.auth)?;

    let transport: Arc<dyn ChannelTransport> =
        Arc::new(LoopbackTransport::from_config(&config.transport));
    let state = GatewayState::new(strategy, Arc::clone(&transport), &config.dispatch);
    let listener_task = Arc::clone(&state.instances).spawn_event_listener();

    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("switchboard gateway v{}", state.version),
        format!("listening on {addr}"),
        format!("auth: {}", state.strategy.mode().as_str()),
        format!("transport: {}", transport.id()),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    listener_task.abort();
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "auth": state.strategy.mode().as_str(),
        "instances": state.instance_count().await,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn create_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<CreateInstanceBody>,
) -> ApiResult<impl IntoResponse> {
    require_admin(state.strategy.as_ref(), &state.auth_context(&headers))?;
    let created = state.instances.create_instance(&body.instance_name)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn connect_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    state
        .lifecycle
        .admit(&instance, &state.auth_context(&headers))
        .await?;
    // Run the handshake on its own task so a client hanging up does not
    // cancel it; the outcome still lands in the registry.
    let instances = Arc::clone(&state.instances);
    let result = tokio::spawn(async move { instances.connect_to_whatsapp(&instance).await })
        .await
        .map_err(|e| GatewayError::Transport(TransportError::Unavailable(e.to_string())))??;
    Ok(Json(result))
}

/// Get-or-create-and-connect. Admin only, since it may create.
async fn init_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_admin(state.strategy.as_ref(), &state.auth_context(&headers))?;
    let instances = Arc::clone(&state.instances);
    let outcome = tokio::spawn(async move { instances.init_instance(&instance).await })
        .await
        .map_err(|e| GatewayError::Transport(TransportError::Unavailable(e.to_string())))??;
    Ok(Json(outcome))
}

async fn connection_state_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let admission = state
        .lifecycle
        .admit(&instance, &state.auth_context(&headers))
        .await?;
    let current = admission.instance();
    Ok(Json(serde_json::json!({
        "instance": current.name(),
        "state": current.state(),
    })))
}

async fn fetch_instances_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<FetchQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_admin(state.strategy.as_ref(), &state.auth_context(&headers))?;
    let instances = state
        .instances
        .fetch_instances(query.instance_name.as_deref())
        .await?;
    Ok(Json(instances))
}

async fn logout_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    state
        .lifecycle
        .admit(&instance, &state.auth_context(&headers))
        .await?;
    Ok(Json(state.instances.logout(&instance).await?))
}

async fn delete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    state
        .lifecycle
        .admit(&instance, &state.auth_context(&headers))
        .await?;
    Ok(Json(state.instances.delete_instance(&instance).await?))
}

async fn send_text_handler(
    State(state): State<Arc<GatewayState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendTextRequest>,
) -> ApiResult<impl IntoResponse> {
    let admission = state
        .logged_in
        .admit(&instance, &state.auth_context(&headers))
        .await?;
    let result = state.dispatch.send_text(&admission, body).await?;
    Ok((StatusCode::CREATED, Json(result)))
}
