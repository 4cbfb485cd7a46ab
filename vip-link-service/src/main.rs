//! VIP Link Service — standalone binary reconciling chat, billing, and
//! game-server identities and extending VIP entitlement on paid pledges.
//!
//! Hosts the billing-platform webhook endpoint and a linking RPC API.
//! Default: http://127.0.0.1:9103/

mod accrual;
mod config;
mod crcon;
mod db;
mod error;
mod events;
mod handlers;
mod linking;
mod payload;
mod routes;

use config::Config;
use crcon::CrconClient;
use handlers::EventProcessor;
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    log::info!("Opening database at: {}", config.database_path);
    let database = Arc::new(db::Db::open(&config.database_path).expect("Failed to open database"));

    let vip_api = Arc::new(CrconClient::new(
        &config.crcon_url,
        &config.crcon_api_key,
        config.crcon_server_number,
    ));

    let processor = Arc::new(EventProcessor::new(database.clone(), vip_api));

    let state = Arc::new(AppState {
        db: database,
        processor,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route("/webhook/patreon", axum::routing::post(routes::patreon_webhook))
        .route("/rpc/link/primary", axum::routing::post(routes::link_primary))
        .route("/rpc/unlink/primary", axum::routing::post(routes::unlink_primary))
        .route("/rpc/link/sponsored", axum::routing::post(routes::link_sponsored))
        .route("/rpc/unlink/sponsored", axum::routing::post(routes::unlink_sponsored))
        .route("/rpc/link/billing", axum::routing::post(routes::link_billing))
        .route("/rpc/unlink/billing", axum::routing::post(routes::unlink_billing))
        .route("/rpc/stats", axum::routing::get(routes::stats))
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("VIP Link Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
