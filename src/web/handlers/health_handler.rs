use axum::{extract::State, response::Json};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::engine::Orchestrator;

/// 健康检查端点
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "finchat-gateway"
    }))
}

/// 获取系统信息
pub async fn system_info(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Value> {
    let settings = orchestrator.settings();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": env!("CARGO_PKG_NAME"),
        "model_tiers": settings.model_tiers,
        "gate_capacity": orchestrator.gate().capacity(),
        "credentials": orchestrator.key_pool().len(),
        "max_tool_depth": settings.max_tool_depth,
    }))
}
