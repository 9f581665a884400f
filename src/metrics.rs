//! Prometheusメトリクス収集・公開
//!
//! 型付きカウンター/ヒストグラム/ゲージを専用レジストリに登録し、
//! 別ポートのプレーンHTTPで `/metrics` を公開する。

use crate::shutdown::ShutdownController;
use axum::{extract::State, routing::get, Router};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// メトリクスマネージャー
///
/// 全メトリクスは `aiconnect_` プレフィックス付きで専用レジストリに登録される。
pub struct Manager {
    registry: Registry,
    auth_attempts: IntCounterVec,
    auth_failures: IntCounterVec,
    proxy_requests: IntCounterVec,
    proxy_errors: IntCounterVec,
    proxy_latency: HistogramVec,
    backend_health: GaugeVec,
}

impl Manager {
    /// 新しいメトリクスマネージャーを作成する
    pub fn new() -> Self {
        let registry = Registry::new();

        let auth_attempts = IntCounterVec::new(
            Opts::new(
                "aiconnect_auth_attempts_total",
                "Total number of authentication attempts",
            ),
            &["result"],
        )
        .expect("failed to create auth_attempts metric");

        let auth_failures = IntCounterVec::new(
            Opts::new(
                "aiconnect_auth_failures_total",
                "Total number of failed authentications",
            ),
            &["reason"],
        )
        .expect("failed to create auth_failures metric");

        let proxy_requests = IntCounterVec::new(
            Opts::new(
                "aiconnect_proxy_requests_total",
                "Total number of proxied requests",
            ),
            &["backend"],
        )
        .expect("failed to create proxy_requests metric");

        let proxy_errors = IntCounterVec::new(
            Opts::new(
                "aiconnect_proxy_errors_total",
                "Total number of proxy errors",
            ),
            &["backend"],
        )
        .expect("failed to create proxy_errors metric");

        let proxy_latency = HistogramVec::new(
            HistogramOpts::new(
                "aiconnect_proxy_latency_seconds",
                "Proxy request latency in seconds",
            ),
            &["backend"],
        )
        .expect("failed to create proxy_latency metric");

        let backend_health = GaugeVec::new(
            Opts::new(
                "aiconnect_backend_health",
                "Backend health status (1=healthy, 0=unhealthy)",
            ),
            &["backend", "server"],
        )
        .expect("failed to create backend_health metric");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(auth_attempts.clone()),
            Box::new(auth_failures.clone()),
            Box::new(proxy_requests.clone()),
            Box::new(proxy_errors.clone()),
            Box::new(proxy_latency.clone()),
            Box::new(backend_health.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("failed to register metric");
        }

        Self {
            registry,
            auth_attempts,
            auth_failures,
            proxy_requests,
            proxy_errors,
            proxy_latency,
            backend_health,
        }
    }

    /// 認証試行を記録する
    pub fn inc_auth_attempts(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.auth_attempts.with_label_values(&[result]).inc();
    }

    /// 認証失敗を理由別に記録する
    pub fn inc_auth_failures(&self, reason: &str) {
        self.auth_failures.with_label_values(&[reason]).inc();
    }

    /// プロキシリクエストを記録する
    pub fn inc_proxy_requests(&self, backend: &str) {
        self.proxy_requests.with_label_values(&[backend]).inc();
    }

    /// プロキシエラーを記録する
    pub fn inc_proxy_errors(&self, backend: &str) {
        self.proxy_errors.with_label_values(&[backend]).inc();
    }

    /// レイテンシタイマーを開始する
    ///
    /// 返されたタイマーのDrop時点でヒストグラムに記録される。
    /// ストリーミングレスポンスの完了（またはクライアント切断）まで計測するために使う。
    pub fn latency_timer(&self, backend: &str) -> LatencyTimer {
        LatencyTimer {
            histogram: self.proxy_latency.with_label_values(&[backend]),
            started: Instant::now(),
        }
    }

    /// バックエンドの稼働状態ゲージを更新する
    pub fn set_backend_health(&self, backend: &str, server: &str, healthy: bool) {
        let value = if healthy { 1.0 } else { 0.0 };
        self.backend_health
            .with_label_values(&[backend, server])
            .set(value);
    }

    /// 登録済みメトリクスをPrometheusテキスト形式で出力する
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// メトリクス公開サーバーをバックグラウンドで開始する
    pub fn start_server(self: &Arc<Self>, port: u16, shutdown: ShutdownController) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(render_handler))
                .with_state(manager);

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(port = port, error = %e, "Failed to bind metrics server");
                    return;
                }
            };

            info!(address = %addr, "Metrics server listening");

            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown.wait().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Metrics server error");
            }
        });
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

async fn render_handler(State(manager): State<Arc<Manager>>) -> String {
    manager.render()
}

/// Drop時にヒストグラムへ経過秒数を記録するタイマー
pub struct LatencyTimer {
    histogram: Histogram,
    started: Instant,
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_all_metric_families() {
        let manager = Manager::new();
        manager.inc_auth_attempts(true);
        manager.inc_auth_failures("directory");
        manager.inc_proxy_requests("ollama");
        manager.inc_proxy_errors("vllm");
        manager.set_backend_health("ollama", "http://10.0.0.1:11434", true);
        drop(manager.latency_timer("ollama"));

        let output = manager.render();
        assert!(output.contains("aiconnect_auth_attempts_total"));
        assert!(output.contains("aiconnect_auth_failures_total"));
        assert!(output.contains("aiconnect_proxy_requests_total"));
        assert!(output.contains("aiconnect_proxy_errors_total"));
        assert!(output.contains("aiconnect_proxy_latency_seconds"));
        assert!(output.contains("aiconnect_backend_health"));
    }

    #[test]
    fn auth_attempts_are_labelled_by_result() {
        let manager = Manager::new();
        manager.inc_auth_attempts(true);
        manager.inc_auth_attempts(false);
        manager.inc_auth_attempts(false);

        let output = manager.render();
        assert!(output.contains("result=\"success\"} 1"));
        assert!(output.contains("result=\"failure\"} 2"));
    }

    #[test]
    fn backend_health_gauge_tracks_transitions() {
        let manager = Manager::new();
        manager.set_backend_health("ollama", "http://10.0.0.1:11434", true);
        assert!(manager.render().contains("aiconnect_backend_health"));

        manager.set_backend_health("ollama", "http://10.0.0.1:11434", false);
        let output = manager.render();
        assert!(output.contains("server=\"http://10.0.0.1:11434\"} 0"));
    }

    #[test]
    fn latency_timer_records_on_drop() {
        let manager = Manager::new();
        {
            let _timer = manager.latency_timer("openai");
        }
        let output = manager.render();
        assert!(output.contains("aiconnect_proxy_latency_seconds_count{backend=\"openai\"} 1"));
    }
}
