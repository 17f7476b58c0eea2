use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::info;

use crate::engine::Orchestrator;
use crate::web::{
    handlers::{
        chat_handler::{chat, chat_stream, clear_chat, reset_credential, stats},
        health_handler::{health_check, system_info},
    },
    middleware::cors::cors_layer,
};

pub struct WebServer {
    orchestrator: Arc<Orchestrator>,
}

impl WebServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        let app = create_app(Arc::clone(&self.orchestrator));

        info!(%addr, "Chat gateway listening");
        info!("Health check: http://{}/api/health", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

/// 组装路由
pub fn create_app(orchestrator: Arc<Orchestrator>) -> Router {
    let api_routes = Router::new()
        // 健康检查
        .route("/health", get(health_check))
        .route("/system", get(system_info))
        // 对话
        .route("/v1/chat-stream", post(chat_stream))
        .route("/v1/chat", post(chat))
        .route("/v1/clear-chat", post(clear_chat))
        // 运维
        .route("/v1/stats", get(stats))
        .route("/v1/credentials/:id/reset", post(reset_credential));

    Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(cors_layer()))
        .with_state(orchestrator)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
