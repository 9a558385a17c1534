use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::admin;
use crate::answer::{AnswerGenerator, OpenAiAnswerGenerator};
use crate::config::{AppConfig, StoreBackend};
use crate::delivery::PlatformDelivery;
use crate::pipeline::{ChatService, Collaborators};
use crate::profile::GraphProfileFetcher;
use crate::realtime::ConnectionHub;
use crate::store::{ChatStore, MemoryChatStore, PgChatStore};
use crate::types::Channel;
use crate::webhooks;
use crate::widget;
use crate::ws;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<ChatService>,
}

impl AppState {
    pub fn new(service: Arc<ChatService>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(service.config().clone()),
            service,
        })
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    info!("{method} {path} -> {}", response.status());
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let operator_api = Router::new()
        .route("/api/sessions", get(admin::list_sessions))
        .route("/api/sessions/{chat_id}", get(admin::get_session))
        .route(
            "/api/sessions/{chat_id}/manual-mode",
            patch(admin::set_manual_mode),
        )
        .route("/api/sessions/{chat_id}/closed", patch(admin::set_closed))
        .route(
            "/api/sessions/{chat_id}/messages",
            post(admin::post_consultant_message),
        )
        .route("/api/messages/synced", post(admin::mark_synced))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_operator,
        ));

    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/{channel}",
            get(webhooks::webhook_verify).post(webhooks::webhook_event),
        )
        .route("/api/web/sessions", post(widget::open_session))
        .route(
            "/api/web/sessions/{chat_id}/messages",
            post(widget::post_message),
        )
        .route("/ws/chat/{chat_id}", get(ws::chat_socket))
        .route("/ws/operators", get(ws::operator_feed))
        .merge(operator_api)
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    match &config.store {
        StoreBackend::Memory => {
            warn!("using the in-memory chat store; sessions are lost on restart");
            Ok(Arc::new(MemoryChatStore::new()))
        }
        StoreBackend::Postgres { database_url } => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            let store = PgChatStore::new(pool);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

fn collaborators(config: &AppConfig, http: reqwest::Client) -> Collaborators {
    let answers = config.openai.clone().map(|settings| {
        Arc::new(OpenAiAnswerGenerator::new(http.clone(), settings)) as Arc<dyn AnswerGenerator>
    });
    if answers.is_none() {
        warn!("OPENAI_API_KEY is not set; chats will wait for consultants");
    }
    Collaborators {
        answers,
        profiles: Some(Arc::new(GraphProfileFetcher::new(
            http.clone(),
            config.graph_api_base.clone(),
            config.instagram.access_token.clone(),
            config.facebook.access_token.clone(),
        ))),
        delivery: Some(Arc::new(PlatformDelivery::from_config(http, config))),
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    if config.admin_token.is_none() {
        warn!("ADMIN_API_TOKEN is not set; operator endpoints are open");
    }
    for channel in Channel::ALL {
        if let Some(settings) = config.channel(channel) {
            if settings.is_enabled() {
                info!("{channel} channel enabled for bot {}", settings.bot_id);
            }
        }
    }

    let store = open_store(&config).await?;
    let http = reqwest::Client::new();
    let service = ChatService::new(
        config.clone(),
        store,
        Arc::new(ConnectionHub::new()),
        collaborators(&config, http),
    );

    let housekeeping = service.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            ticker.tick().await;
            housekeeping.prune();
        }
    });

    let app = build_router(AppState::new(service));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("omnichat server running at http://localhost:{}", config.port);
    axum::serve(listener, app).await?;
    Ok(())
}
