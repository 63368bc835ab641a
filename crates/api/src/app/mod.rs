//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store/registry wiring and background resetters
//! - `routes/`: HTTP handlers (executor protocol, operator endpoints)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses
//! - `extract.rs`: JSON body extractor with JSON rejections

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;
use tracing::info;

use crate::middleware::{self, TokenAuth};

pub mod dto;
pub mod errors;
pub mod extract;
pub mod routes;
pub mod services;

pub use services::{AppServices, build_services};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let executor = routes::executor_router().layer(
        ServiceBuilder::new()
            .layer(Extension(services.clone()))
            .layer(axum::middleware::from_fn_with_state(
                TokenAuth::executor(services.executor_secret()),
                middleware::token_auth,
            )),
    );

    let mut app = Router::new()
        .route("/health", get(routes::system::health))
        .route(
            "/queues",
            get(routes::system::queues).layer(Extension(services.clone())),
        )
        .nest("/.executors/queue", executor);

    match services.admin_token() {
        Some(token) => {
            let admin = routes::admin_router().layer(
                ServiceBuilder::new()
                    .layer(Extension(services.clone()))
                    .layer(axum::middleware::from_fn_with_state(
                        TokenAuth::admin(token),
                        middleware::token_auth,
                    )),
            );
            app = app.nest("/admin", admin);
        }
        None => info!("EXECQ_ADMIN_TOKEN not set; admin routes disabled"),
    }

    app
}
