use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mingle_api::state::{AppState, AppStateInner};
use mingle_api::middleware::require_auth;
use mingle_api::{groups, inbox, messages, users};
use mingle_chat::{ChatService, HttpProfileDirectory, ProfileDirectory, StaticProfileDirectory};
use mingle_feed::Feed;
use mingle_gateway::connection;

#[derive(Clone)]
struct GatewayState {
    chat: ChatService,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mingle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("MINGLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("MINGLE_DB_PATH").unwrap_or_else(|_| "mingle.db".into());
    let host = std::env::var("MINGLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MINGLE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init store
    let db = Arc::new(mingle_db::Database::open(&PathBuf::from(&db_path))?);

    // External profile directory; without a configured URL every
    // counterpart renders as the unknown-user sentinel.
    let profiles: Arc<dyn ProfileDirectory> = match std::env::var("MINGLE_PROFILE_URL") {
        Ok(url) => Arc::new(HttpProfileDirectory::new(url)),
        Err(_) => {
            warn!("MINGLE_PROFILE_URL not set, display names will be unresolved");
            Arc::new(StaticProfileDirectory::default())
        }
    };

    // Shared state
    let feed = Feed::new();
    let chat = ChatService::new(db, feed, profiles);
    let app_state: AppState = Arc::new(AppStateInner {
        chat: chat.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let gateway_state = GatewayState { chat, jwt_secret };

    // Routes
    let api_routes = Router::new()
        .route("/inbox", get(inbox::get_inbox))
        .route("/users", get(users::list_users))
        .route("/chats/{user_id}/messages", get(messages::get_messages))
        .route("/chats/{user_id}/messages", post(messages::send_message))
        .route("/chats/{user_id}/seen", post(messages::mark_seen))
        .route("/messages/{message_id}/status", post(messages::advance_status))
        .route("/groups", get(groups::list_groups))
        .route("/groups", post(groups::create_group))
        .route("/groups/{group_id}/join", post(groups::join_group))
        .route("/groups/{group_id}/members", get(groups::list_members))
        .route("/groups/{group_id}/messages", get(groups::get_messages))
        .route("/groups/{group_id}/messages", post(groups::send_message))
        .route("/groups/{group_id}/seen", post(groups::mark_seen))
        .route("/group-messages/{message_id}/status", post(groups::advance_status))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Mingle server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.chat, state.jwt_secret))
}
