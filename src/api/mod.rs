//! APIルーター
//!
//! 認証必須のプロキシルート（/ollama/ /vllm/ /openai/）と、
//! 認証なしの補助エンドポイント（/health /internal/nodes）を同じ
//! TLSリスナー上に構成する。未定義パスは404。

pub mod nodes;
pub mod proxy;

use crate::{auth, AppState};
use axum::{
    middleware as axum_middleware,
    routing::{any, get},
    Router,
};

/// アプリケーションルーターを作成する
pub fn create_app(state: AppState) -> Router {
    let proxied = Router::new()
        .route("/ollama/", any(proxy::ollama))
        .route("/ollama/{*rest}", any(proxy::ollama))
        .route("/vllm/", any(proxy::vllm))
        .route("/vllm/{*rest}", any(proxy::vllm))
        .route("/openai/", any(proxy::openai))
        .route("/openai/{*rest}", any(proxy::openai))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::middleware,
        ));

    Router::new()
        .merge(proxied)
        .route("/health", get(health))
        .route("/internal/nodes", get(nodes::internal_nodes))
        .with_state(state)
}

/// GET /health - 生存確認（認証なし）
async fn health() -> &'static str {
    "OK"
}
