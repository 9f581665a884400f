//! ヘルスチェック監視
//!
//! レジストリの全ノードを定期的にプローブし、稼働状態を書き戻す。
//! プローブURLはノード種別ごとに異なる。

use crate::registry::{Node, NodeRegistry, NodeStatus, NodeType};
use crate::shutdown::ShutdownController;
use reqwest::Client;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

/// プローブ1回あたりのタイムアウト（秒）
const HEALTH_CHECK_TIMEOUT_SECS: u64 = 2;

/// デフォルトのチェック間隔（秒）
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;

/// unreachable判定までの連続失敗回数
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// ノードヘルスチェッカー
#[derive(Clone)]
pub struct HealthChecker {
    registry: NodeRegistry,
    client: Client,
    check_interval_secs: u64,
    check_timeout: Duration,
    max_errors: u32,
}

impl HealthChecker {
    /// 新しいヘルスチェッカーを作成する
    pub fn new(registry: NodeRegistry) -> Self {
        // グローバルタイムアウトは設定せず、プローブごとの期限で打ち切る
        let client = Client::builder()
            .build()
            .expect("failed to create HTTP client");

        Self {
            registry,
            client,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            check_timeout: Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS),
            max_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }

    /// チェック間隔を設定する
    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.check_interval_secs = interval_secs;
        self
    }

    /// バックグラウンドで監視を開始する
    pub fn start(self, shutdown: ShutdownController) {
        tokio::spawn(async move {
            self.check_all().await;

            info!(
                interval_secs = self.check_interval_secs,
                "Health checker started"
            );

            let mut timer = interval(Duration::from_secs(self.check_interval_secs));
            // 起動時チェック済みのため、即時発火する最初のtickを消費する
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        info!("Health checker stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        self.check_all().await;
                    }
                }
            }
        });
    }

    /// 全ノードを並列にチェックする
    pub async fn check_all(&self) {
        let nodes = self.registry.all().await;
        if nodes.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let checker = self.clone();
            handles.push(tokio::spawn(async move {
                checker.check_node(&node).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// 1ノードをチェックする
    async fn check_node(&self, node: &Node) {
        let url = probe_url(node);

        match self.probe(&url).await {
            Ok(()) => {
                self.registry
                    .set_status(&node.host, node.port, NodeStatus::Healthy)
                    .await;
                debug!(
                    name = %node.name,
                    host = %node.host,
                    port = node.port,
                    node_type = %node.node_type.as_str(),
                    "Node health check passed"
                );
            }
            Err(error) => {
                self.registry
                    .increment_error(&node.host, node.port, self.max_errors)
                    .await;
                debug!(
                    name = %node.name,
                    host = %node.host,
                    port = node.port,
                    node_type = %node.node_type.as_str(),
                    error = %error,
                    "Node health check failed"
                );
            }
        }
    }

    /// HTTP GETで生存確認する（2xxで成功）
    async fn probe(&self, url: &str) -> Result<(), String> {
        let request = self.client.get(url).send();
        let response = tokio::time::timeout(self.check_timeout, request)
            .await
            .map_err(|_| format!("health check timed out after {:?}", self.check_timeout))?
            .map_err(|e| format!("health check request failed: {}", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("health check returned status {}", response.status()))
        }
    }
}

/// ノード種別ごとのプローブURLを返す
fn probe_url(node: &Node) -> String {
    match node.node_type {
        NodeType::Ollama => format!("http://{}:{}/api/tags", node.host, node.port),
        NodeType::Vllm => format!("http://{}:{}/v1/models", node.host, node.port),
        NodeType::Openai => format!("https://{}:{}/v1/models", node.host, node.port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_url_is_type_specific() {
        let ollama = Node::new("o", NodeType::Ollama, "10.0.0.1", 11434);
        assert_eq!(probe_url(&ollama), "http://10.0.0.1:11434/api/tags");

        let vllm = Node::new("v", NodeType::Vllm, "10.0.0.2", 8000);
        assert_eq!(probe_url(&vllm), "http://10.0.0.2:8000/v1/models");

        let openai = Node::new("g", NodeType::Openai, "gw.example.org", 443);
        assert_eq!(probe_url(&openai), "https://gw.example.org:443/v1/models");
    }

    #[tokio::test]
    async fn checker_defaults() {
        let checker = HealthChecker::new(NodeRegistry::new());
        assert_eq!(checker.check_interval_secs, DEFAULT_CHECK_INTERVAL_SECS);
        assert_eq!(checker.max_errors, MAX_CONSECUTIVE_ERRORS);
    }

    #[tokio::test]
    async fn with_interval_overrides_default() {
        let checker = HealthChecker::new(NodeRegistry::new()).with_interval(60);
        assert_eq!(checker.check_interval_secs, 60);
    }

    #[tokio::test]
    async fn unreachable_probe_increments_error_count() {
        let registry = NodeRegistry::new();
        // 接続先のないポートを使う
        registry
            .add(Node::new("dead", NodeType::Vllm, "127.0.0.1", 1))
            .await;

        let checker = HealthChecker::new(registry.clone());
        checker.check_all().await;

        let node = registry.get("127.0.0.1", 1).await.unwrap();
        assert_eq!(node.error_count, 1);
        assert_eq!(node.status, NodeStatus::Unknown);

        checker.check_all().await;
        checker.check_all().await;

        let node = registry.get("127.0.0.1", 1).await.unwrap();
        assert_eq!(node.status, NodeStatus::Unreachable);
    }

    #[tokio::test]
    async fn check_all_with_empty_registry_is_noop() {
        let checker = HealthChecker::new(NodeRegistry::new());
        checker.check_all().await;
    }
}
