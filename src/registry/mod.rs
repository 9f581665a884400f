//! ノード登録管理
//!
//! 発見されたバックエンドノードをメモリ内で管理する。
//! キーは `host:port`、書き込みはディスカバリーとヘルスチェッカーに限られる。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// バックエンドノードの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Ollamaバックエンド
    Ollama,
    /// vLLMバックエンド
    Vllm,
    /// OpenAI互換バックエンド
    Openai,
}

impl NodeType {
    /// 文字列表現を返す
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
            Self::Openai => "openai",
        }
    }
}

/// ノードの稼働状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// 直近のヘルスチェックに成功
    Healthy,
    /// 連続失敗で到達不能と判定
    Unreachable,
    /// まだ判定されていない
    Unknown,
}

impl NodeStatus {
    /// 文字列表現を返す
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unreachable => "unreachable",
            Self::Unknown => "unknown",
        }
    }
}

/// 発見されたバックエンドノード
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    /// サービスインスタンス名
    pub name: String,
    /// ノード種別
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// ホスト（IPv4優先、なければIPv6かホスト名）
    pub host: String,
    /// ポート
    pub port: u16,
    /// 稼働状態
    pub status: NodeStatus,
    /// 最終確認時刻
    pub last_seen: DateTime<Utc>,
    /// 連続ヘルスチェック失敗回数（内部管理用）
    #[serde(skip)]
    pub(crate) error_count: u32,
}

impl Node {
    /// 新しいノードを作成する（状態はUnknown）
    pub fn new(name: impl Into<String>, node_type: NodeType, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            node_type,
            host: host.into(),
            port,
            status: NodeStatus::Unknown,
            last_seen: Utc::now(),
            error_count: 0,
        }
    }

    /// レジストリ内の識別キー
    pub fn key(&self) -> String {
        node_key(&self.host, self.port)
    }
}

fn node_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// レジストリイベントの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// 新しいノードが登録された
    NodeDiscovered,
    /// ノードがレジストリから削除された
    NodeLost,
    /// ノードがhealthyに遷移した
    HealthOk,
    /// ノードがunreachableに遷移した
    HealthFail,
}

/// レジストリイベント
#[derive(Debug, Clone)]
pub struct Event {
    /// イベント種別
    pub kind: EventKind,
    /// イベント時点のノードのコピー
    pub node: Node,
    /// イベント発生時刻
    pub timestamp: DateTime<Utc>,
}

/// イベントコールバック
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// ノードレジストリ
///
/// `host:port` につきノードは1つ。クエリは防御的コピーを返す。
/// イベントコールバックはロック外で個別タスクにディスパッチされるため、
/// コールバック内からレジストリを再操作してもデッドロックしない。
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, Node>>>,
    callbacks: Arc<RwLock<Vec<EventCallback>>>,
}

impl NodeRegistry {
    /// 新しいレジストリを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// イベントコールバックを登録する
    pub async fn on_event(&self, callback: impl Fn(Event) + Send + Sync + 'static) {
        let mut callbacks = self.callbacks.write().await;
        callbacks.push(Arc::new(callback));
    }

    /// イベントを全コールバックに配信する
    ///
    /// コールバックのスライスをロック下でコピーし、各コールバックを独立タスクで
    /// 実行する。panicしたコールバックは自タスクだけを落とす。
    async fn emit(&self, kind: EventKind, node: Node) {
        let callbacks = {
            let guard = self.callbacks.read().await;
            guard.clone()
        };
        let event = Event {
            kind,
            node,
            timestamp: Utc::now(),
        };
        for callback in callbacks {
            let event = event.clone();
            tokio::spawn(async move {
                callback(event);
            });
        }
    }

    /// ノードを登録または更新する
    ///
    /// `last_seen` は常に現在時刻に更新される。
    /// 新規キーの場合のみ `NodeDiscovered` を配信する。
    pub async fn add(&self, mut node: Node) {
        node.last_seen = Utc::now();
        let key = node.key();

        let discovered = {
            let mut nodes = self.nodes.write().await;
            let existed = nodes.contains_key(&key);
            nodes.insert(key, node.clone());
            !existed
        };

        if discovered {
            debug!(
                name = %node.name,
                host = %node.host,
                port = node.port,
                node_type = %node.node_type.as_str(),
                "Node added to registry"
            );
            self.emit(EventKind::NodeDiscovered, node).await;
        }
    }

    /// ノードを削除する
    ///
    /// 存在した場合のみ `NodeLost` を配信する。
    pub async fn remove(&self, host: &str, port: u16) {
        let removed = {
            let mut nodes = self.nodes.write().await;
            nodes.remove(&node_key(host, port))
        };

        if let Some(node) = removed {
            self.emit(EventKind::NodeLost, node).await;
        }
    }

    /// ノードの稼働状態を更新する
    ///
    /// healthyへの遷移は `error_count` をリセットし、直前がhealthyでなかった
    /// 場合のみ `HealthOk` を配信する。healthy→unreachableは `HealthFail` を
    /// 配信する。
    pub async fn set_status(&self, host: &str, port: u16, status: NodeStatus) {
        let event = {
            let mut nodes = self.nodes.write().await;
            let Some(node) = nodes.get_mut(&node_key(host, port)) else {
                return;
            };
            let old_status = node.status;
            node.status = status;
            node.last_seen = Utc::now();

            if status == NodeStatus::Healthy && old_status != NodeStatus::Healthy {
                node.error_count = 0;
                Some((EventKind::HealthOk, node.clone()))
            } else if status == NodeStatus::Healthy {
                node.error_count = 0;
                None
            } else if status == NodeStatus::Unreachable && old_status == NodeStatus::Healthy {
                Some((EventKind::HealthFail, node.clone()))
            } else {
                None
            }
        };

        if let Some((kind, node)) = event {
            self.emit(kind, node).await;
        }
    }

    /// ノードの連続失敗回数を加算する
    ///
    /// `max` に達した時点でunreachableにし `HealthFail` を配信してtrueを返す。
    pub async fn increment_error(&self, host: &str, port: u16, max: u32) -> bool {
        let event = {
            let mut nodes = self.nodes.write().await;
            let Some(node) = nodes.get_mut(&node_key(host, port)) else {
                return false;
            };
            node.error_count += 1;
            if node.error_count >= max {
                node.status = NodeStatus::Unreachable;
                Some(node.clone())
            } else {
                None
            }
        };

        if let Some(node) = event {
            self.emit(EventKind::HealthFail, node).await;
            true
        } else {
            false
        }
    }

    /// ノードを取得する（コピー）
    pub async fn get(&self, host: &str, port: u16) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes.get(&node_key(host, port)).cloned()
    }

    /// 全ノードを取得する（コピー）
    pub async fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes.values().cloned().collect()
    }

    /// 指定種別のノードを取得する（コピー）
    pub async fn by_type(&self, node_type: NodeType) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .cloned()
            .collect()
    }

    /// healthyなノードを取得する（コピー）
    pub async fn healthy(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy)
            .cloned()
            .collect()
    }

    /// 指定種別のhealthyなノードを取得する（コピー）
    pub async fn healthy_by_type(&self, node_type: NodeType) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.node_type == node_type && n.status == NodeStatus::Healthy)
            .cloned()
            .collect()
    }

    /// 登録ノード数を返す
    pub async fn count(&self) -> usize {
        let nodes = self.nodes.read().await;
        nodes.len()
    }

    /// 全ノードを削除する（イベントなし）
    pub async fn clear(&self) {
        let mut nodes = self.nodes.write().await;
        nodes.clear();
    }
}
