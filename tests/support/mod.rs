//! テスト用ユーティリティ
//!
//! AppStateの組み立てと、実ポートにバインドするテストサーバー

use aiconnect::balancer::{LoadBalancer, ProbeKind};
use aiconnect::config::Config;
use aiconnect::metrics::Manager;
use aiconnect::registry::NodeRegistry;
use aiconnect::shutdown::ShutdownController;
use aiconnect::AppState;
use axum::Router;
use std::sync::Arc;
use std::{io, net::SocketAddr};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

/// テスト用のAppStateを組み立てる
///
/// バックグラウンドループは開始しない。ポーリングが必要なテストは
/// ロードバランサーの `sweep()` を明示的に呼ぶ。
#[allow(dead_code)]
pub fn build_state(config: Config) -> AppState {
    let config = Arc::new(config);
    let metrics = Arc::new(Manager::new());

    let ollama_lb = LoadBalancer::new(
        ProbeKind::Ollama,
        config.backends.ollama.clone(),
        config.monitoring.health_check_interval_s,
        metrics.clone(),
    );
    let vllm_lb = LoadBalancer::new(
        ProbeKind::Vllm,
        config.backends.vllm.clone(),
        config.monitoring.health_check_interval_s,
        metrics.clone(),
    );

    AppState {
        config,
        registry: NodeRegistry::new(),
        ollama_lb,
        vllm_lb,
        metrics,
        http_client: reqwest::Client::new(),
        shutdown: ShutdownController::default(),
    }
}

/// 認証無効のベース設定を作る
#[allow(dead_code)]
pub fn auth_disabled_config() -> Config {
    let mut config = Config::default();
    config.auth.enabled = false;
    config
}

/// 汎用的にテスト用のHTTPサーバーを起動するためのユーティリティ
#[allow(dead_code)]
pub struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), io::Error>>,
}

#[allow(dead_code)]
impl TestServer {
    /// サーバーがバインドしているアドレスを返す
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// ベースURLを返す
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// サーバーを停止し、バックグラウンドタスクの終了を待つ
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// ルーターを実ポートにバインドして起動する
#[allow(dead_code)]
pub async fn spawn_app(router: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = rx.await;
        })
        .await
    });

    TestServer {
        addr,
        shutdown: Some(tx),
        handle,
    }
}
