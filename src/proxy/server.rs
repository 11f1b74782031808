use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::proxy::routes;
use crate::proxy::state::AppState;

// HTTP listener. The proxy accepts any path; everything that is not the
// health probe or the admin surface falls through to the forwarding
// engine. The accept loop is driven manually so shutdown can stop
// accepting while in-flight connections drain within the grace period.

async fn health_check_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
    .into_response()
}

pub async fn start(
    host: String,
    port: u16,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, String> {
    let max_body_size = state.config.app.read().await.server.max_body_size;

    let admin_routes = routes::admin_router().layer(CorsLayer::permissive());

    let app = Router::new()
        .route("/health", get(health_check_handler))
        .route("/healthz", get(health_check_handler))
        .nest("/admin", admin_routes)
        .fallback(crate::proxy::handlers::forward::handle_forward)
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Address {} binding failed: {}", addr, e))?;

    info!("Proxy server started at http://{}", addr);

    let handle = tokio::spawn(async move {
        use hyper_util::rt::{TokioExecutor, TokioIo};
        use hyper_util::server::conn::auto;
        use hyper_util::service::TowerToHyperService;
        use tower::ServiceExt;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Listener received shutdown signal, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let io = TokioIo::new(stream);

                            // Inject ConnectInfo so handlers can see the
                            // real client address.
                            use hyper::body::Incoming;
                            let app_with_info = app.clone().map_request(
                                move |mut req: axum::http::Request<Incoming>| {
                                    req.extensions_mut()
                                        .insert(axum::extract::ConnectInfo(remote_addr));
                                    req
                                },
                            );

                            let service = TowerToHyperService::new(app_with_info);

                            tokio::task::spawn(async move {
                                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!("Connection handling ended or failed: {:?}", err);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {:?}", e);
                        }
                    }
                }
            }
        }
    });

    Ok(handle)
}
