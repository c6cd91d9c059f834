pub mod admin;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod delivery;
pub mod discord;
mod error;
pub mod formatting;
pub mod helpers;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod registry;
mod routes;
pub mod validation;

use axum::{Router, http::StatusCode, routing::get};
use kavex_db::Database;
use std::sync::Arc;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use admin::Admin;
use auth::TokenAuthenticator;
use bridge::{Bridge, BridgeSettings};
use config::Config;
use delivery::{Delivery, DeliveryConfig, WebhookApi};
use formatting::AvatarResolver;
use inbound::InboundRouter;
use outbound::OutboundRouter;
use registry::SessionRegistry;

/// Every long-lived service, constructed once at startup.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub registry: Arc<SessionRegistry>,
    pub delivery: Arc<Delivery>,
    pub bridge: Arc<Bridge>,
    pub outbound: OutboundRouter,
    pub admin: Admin,
}

impl AppState {
    pub fn new(config: Config, db: Database, webhooks: Arc<dyn WebhookApi>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let delivery = Arc::new(Delivery::new(
            webhooks,
            db.clone(),
            DeliveryConfig::from(&config),
        ));
        let inbound = Arc::new(InboundRouter::new(
            delivery.clone(),
            AvatarResolver::new(config.avatar_url_template.clone()),
        ));
        let bridge = Arc::new(Bridge::new(
            TokenAuthenticator::new(db.clone(), config.token_pepper.clone()),
            registry.clone(),
            inbound,
            db.clone(),
            BridgeSettings::from(&config),
        ));
        let outbound = OutboundRouter::new(registry.clone());
        let admin = Admin::new(
            db.clone(),
            registry.clone(),
            delivery.clone(),
            config.token_pepper.clone(),
        );

        Arc::new(Self {
            config,
            db,
            registry,
            delivery,
            bridge,
            outbound,
            admin,
        })
    }

    /// Start the heartbeat sweep. The task runs until aborted.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(
            self.bridge
                .clone()
                .run_sweeper(self.config.heartbeat_sweep_interval),
        )
    }
}

/// Create the application router over already-built services
pub fn create_app(state: Arc<AppState>) -> Router {
    let config = &state.config;

    // Socket upgrades are rare: a plugin connects once and then stays
    let upgrade_governor = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_upgrade_per_sec.max(1))
        .burst_size(config.rate_limit_upgrade_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("per_second and burst_size are non-zero");

    // General rate limit for other endpoints
    let general_governor = GovernorConfigBuilder::default()
        .per_second(config.rate_limit_general_per_sec.max(1))
        .burst_size(config.rate_limit_general_burst.max(1))
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("per_second and burst_size are non-zero");

    let socket_routes = Router::new()
        .route(&config.ws_path, get(routes::bridge_socket))
        .layer(GovernorLayer::new(upgrade_governor));

    let general_routes = Router::new()
        .route("/status", get(routes::status))
        .layer(GovernorLayer::new(general_governor));

    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(socket_routes)
        .merge(general_routes)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(RequestBodyLimitLayer::new(config.request_body_limit))
        .with_state(state)
}
