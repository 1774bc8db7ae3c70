//! Webhook update listener
//!
//! A small axum router that accepts Bot API updates pushed to
//! `POST /webhook` and feeds them into the dispatcher. Used when
//! `telegram.use_webhook` is set; long polling is the default.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::telegram::{into_update, TelegramUpdate};

pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/webhook", post(receive_update))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(dispatcher)
}

async fn receive_update(
    State(dispatcher): State<Dispatcher>,
    Json(raw): Json<TelegramUpdate>,
) -> StatusCode {
    match into_update(raw) {
        Some(update) => {
            debug!(user_id = %update.user_id, "webhook update received");
            dispatcher.dispatch(update);
        }
        None => debug!("webhook update without actionable payload"),
    }
    StatusCode::OK
}

/// Serve the webhook listener until the process shuts down.
pub async fn serve(dispatcher: Dispatcher, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook listener started");
    axum::serve(listener, router(dispatcher)).await
}
