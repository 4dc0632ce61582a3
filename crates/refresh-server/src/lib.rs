pub mod error;
pub mod routes;
pub mod state;

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/pipeline/run", post(routes::pipeline::run_pipeline))
        .route(
            "/api/pipeline/steps/{step}/run",
            post(routes::pipeline::run_step),
        )
        .route("/api/pipeline/report", get(routes::pipeline::get_report))
        .route("/api/pipeline/status", get(routes::pipeline::get_status))
        .route("/api/pipeline/history", get(routes::pipeline::get_history))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the control surface on a pre-bound listener until `shutdown`
/// resolves.
///
/// Accepting a bound `TcpListener` lets the caller read the actual port
/// first (useful when `port = 0` and the OS picks a free port).
pub async fn serve_on<F>(
    app_state: AppState,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("refresh control surface listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
