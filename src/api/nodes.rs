//! トポロジーエンドポイント
//!
//! GET /internal/nodes - このプロキシの識別情報と発見済みノードをJSONで返す。
//! 下流クライアントがネットワーク構成を把握するために使う（認証なし）。

use crate::common::ip;
use crate::registry::Node;
use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// /internal/nodes のレスポンス
#[derive(Debug, Serialize)]
pub struct NodesResponse {
    /// このプロキシの識別情報
    pub aiconnect: ProxyIdentity,
    /// 発見済みノード一覧
    pub discovered_nodes: Vec<Node>,
}

/// プロキシ自身のアドレス情報
#[derive(Debug, Serialize)]
pub struct ProxyIdentity {
    /// ローカルIPv4アドレス
    pub host: String,
    /// HTTPSリスナーのポート
    pub port: u16,
}

/// GET /internal/nodes - トポロジー情報
pub async fn internal_nodes(State(state): State<AppState>) -> Json<NodesResponse> {
    let discovered_nodes = state.registry.all().await;

    Json(NodesResponse {
        aiconnect: ProxyIdentity {
            host: ip::local_ipv4(),
            port: state.config.tls.port,
        },
        discovered_nodes,
    })
}
