//! ロードバランサー
//!
//! バックエンドファミリーごとに1インスタンス。各サーバーのメトリクスエンドポイントを
//! 定期ポーリングして負荷ウェイトを維持し、リクエストごとに最小負荷のサーバーを選択する。
//! メトリクス未取得の間はラウンドロビンにフォールバックする。
//!
//! 2つのバリアントは同一スケルトンを共有する:
//! - Ollama: `/metrics` のJSONドキュメントが必須。取得・解析失敗はエラー扱い。
//! - vLLM: `/health` の生存確認が必須で、`/metrics` はベストエフォート。
//!   メトリクスが取れなくてもサーバーはavailableのまま。

use crate::common::error::{ProxyError, ProxyResult};
use crate::metrics::Manager;
use crate::shutdown::ShutdownController;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// メトリクスポーリングのHTTPタイムアウト（秒）
const POLL_TIMEOUT_SECS: u64 = 5;

/// unavailable判定までの連続失敗回数
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// ポーリング方式（バックエンドファミリーごと）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// `/metrics` 必須
    Ollama,
    /// `/health` 必須、`/metrics` はベストエフォート
    Vllm,
}

impl ProbeKind {
    /// メトリクスラベルに使うファミリー名
    pub fn family(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
        }
    }
}

/// バックエンドエージェントが返すメトリクスドキュメント
///
/// GPUフィールドが欠けている場合はゼロとして扱う。
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AgentMetrics {
    /// CPU使用率（%）
    #[serde(default)]
    pub cpu_percent: f64,
    /// RAM使用率（%）
    #[serde(default)]
    pub ram_percent: f64,
    /// GPUデバイス数
    #[serde(default)]
    pub gpu_count: u32,
    /// GPU平均使用率（%）
    #[serde(default, rename = "gpu_avg_utilization_percent")]
    pub gpu_avg_util: f64,
    /// GPU平均メモリ使用率（%）
    #[serde(default, rename = "gpu_avg_memory_percent")]
    pub gpu_avg_memory: f64,
}

impl AgentMetrics {
    /// 負荷ウェイトを計算する
    ///
    /// GPUは推論負荷への寄与が大きいため1.5倍で重み付けする。
    /// GPU非搭載（gpu_count=0）の場合はCPU+RAMのみ。
    pub fn total_weight(&self) -> f64 {
        let gpu_weight = if self.gpu_count > 0 {
            self.gpu_avg_util * 1.5 + self.gpu_avg_memory * 1.5
        } else {
            0.0
        };
        self.cpu_percent + self.ram_percent + gpu_weight
    }
}

/// サーバー1台分のロードバランサー状態
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    /// ベースURL
    pub url: String,
    /// CPU使用率（%）
    pub cpu_percent: f64,
    /// RAM使用率（%）
    pub ram_percent: f64,
    /// GPUデバイス数
    pub gpu_count: u32,
    /// GPU平均使用率（%）
    pub gpu_avg_util: f64,
    /// GPU平均メモリ使用率（%）
    pub gpu_avg_memory: f64,
    /// 負荷ウェイト（小さいほど選択されやすい）
    pub total_weight: f64,
    /// 選択候補に入るか
    pub available: bool,
    /// 最後にポーリングした時刻（未ポーリングはNone）
    pub last_check: Option<DateTime<Utc>>,
    /// 連続失敗回数
    pub error_count: u32,
}

impl ServerMetrics {
    fn initial(url: String) -> Self {
        Self {
            url,
            cpu_percent: 0.0,
            ram_percent: 0.0,
            gpu_count: 0,
            gpu_avg_util: 0.0,
            gpu_avg_memory: 0.0,
            total_weight: 0.0,
            available: true,
            last_check: None,
            error_count: 0,
        }
    }
}

/// ファミリー単位のロードバランサー
#[derive(Clone)]
pub struct LoadBalancer {
    probe: ProbeKind,
    servers: Arc<Vec<String>>,
    metrics: Arc<RwLock<HashMap<String, ServerMetrics>>>,
    round_robin: Arc<AtomicUsize>,
    client: reqwest::Client,
    check_interval: Duration,
    max_consec_errors: u32,
    facade: Arc<Manager>,
}

impl LoadBalancer {
    /// 新しいロードバランサーを作成する
    ///
    /// 全サーバーはavailable・メトリクスゼロ・未ポーリングで初期化される。
    pub fn new(
        probe: ProbeKind,
        servers: Vec<String>,
        check_interval_secs: u64,
        facade: Arc<Manager>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");

        let mut initial = HashMap::new();
        for server in &servers {
            initial.insert(server.clone(), ServerMetrics::initial(server.clone()));
        }

        Self {
            probe,
            servers: Arc::new(servers),
            metrics: Arc::new(RwLock::new(initial)),
            round_robin: Arc::new(AtomicUsize::new(0)),
            client,
            check_interval: Duration::from_secs(check_interval_secs),
            max_consec_errors: MAX_CONSECUTIVE_ERRORS,
            facade,
        }
    }

    /// ポーリングループをバックグラウンドで開始する
    ///
    /// 起動直後に1回スイープし、以降は設定間隔で繰り返す。
    pub fn start(&self, shutdown: ShutdownController) {
        if self.servers.is_empty() {
            return;
        }

        let lb = self.clone();
        tokio::spawn(async move {
            lb.sweep().await;

            info!(
                family = lb.probe.family(),
                servers = lb.servers.len(),
                interval_secs = lb.check_interval.as_secs(),
                "Load balancer started"
            );

            let mut timer = interval(lb.check_interval);
            // 最初のtickは即時発火するため、起動時スイープ済みのここで1回消費する
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        info!(family = lb.probe.family(), "Load balancer stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        lb.sweep().await;
                    }
                }
            }
        });
    }

    /// 全サーバーを並列にポーリングする
    pub async fn sweep(&self) {
        let mut handles = Vec::with_capacity(self.servers.len());
        for server in self.servers.iter() {
            let lb = self.clone();
            let url = server.clone();
            handles.push(tokio::spawn(async move {
                lb.check_server(&url).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// 1サーバーをポーリングする
    async fn check_server(&self, url: &str) {
        match self.probe {
            ProbeKind::Ollama => self.check_ollama(url).await,
            ProbeKind::Vllm => self.check_vllm(url).await,
        }
    }

    /// Ollamaバリアント: `/metrics` のJSONが必須
    async fn check_ollama(&self, url: &str) {
        let metrics_url = format!("{}/metrics", url.trim_end_matches('/'));

        let response = match self.client.get(&metrics_url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(url, &e.to_string()).await;
                return;
            }
        };
        if !response.status().is_success() {
            self.record_failure(url, &format!("status code: {}", response.status()))
                .await;
            return;
        }

        match response.json::<AgentMetrics>().await {
            Ok(doc) => self.record_success(url, Some(doc)).await,
            Err(e) => self.record_failure(url, &e.to_string()).await,
        }
    }

    /// vLLMバリアント: `/health` 必須、`/metrics` はベストエフォート
    async fn check_vllm(&self, url: &str) {
        let health_url = format!("{}/health", url.trim_end_matches('/'));

        let response = match self.client.get(&health_url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(url, &e.to_string()).await;
                return;
            }
        };
        if !response.status().is_success() {
            self.record_failure(url, &format!("status code: {}", response.status()))
                .await;
            return;
        }

        // 生存確認は通った。メトリクスが取れなくてもavailableのまま。
        let metrics_url = format!("{}/metrics", url.trim_end_matches('/'));
        let doc = match self.client.get(&metrics_url).send().await {
            Ok(r) if r.status().is_success() => r.json::<AgentMetrics>().await.ok(),
            _ => None,
        };
        self.record_success(url, doc).await;
    }

    /// ポーリング成功を記録する
    ///
    /// ドキュメントがあればメトリクスとウェイトを上書きし、
    /// なければ既存のメトリクスを保持する。
    async fn record_success(&self, url: &str, doc: Option<AgentMetrics>) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics
            .entry(url.to_string())
            .or_insert_with(|| ServerMetrics::initial(url.to_string()));

        if let Some(doc) = doc {
            entry.cpu_percent = doc.cpu_percent;
            entry.ram_percent = doc.ram_percent;
            entry.gpu_count = doc.gpu_count;
            entry.gpu_avg_util = doc.gpu_avg_util;
            entry.gpu_avg_memory = doc.gpu_avg_memory;
            entry.total_weight = doc.total_weight();
        }
        entry.available = true;
        entry.last_check = Some(Utc::now());
        entry.error_count = 0;

        debug!(
            family = self.probe.family(),
            server = url,
            weight = entry.total_weight,
            "Server metrics updated"
        );
        drop(metrics);

        self.facade
            .set_backend_health(self.probe.family(), url, true);
    }

    /// ポーリング失敗を記録する
    ///
    /// 連続失敗がしきい値に達するとavailableを落とす。
    async fn record_failure(&self, url: &str, error: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics
            .entry(url.to_string())
            .or_insert_with(|| ServerMetrics::initial(url.to_string()));

        entry.error_count += 1;
        entry.last_check = Some(Utc::now());

        let degraded = entry.error_count >= self.max_consec_errors;
        if degraded {
            entry.available = false;
            warn!(
                family = self.probe.family(),
                server = url,
                error_count = entry.error_count,
                error = error,
                "Server marked unavailable"
            );
        } else {
            debug!(
                family = self.probe.family(),
                server = url,
                error_count = entry.error_count,
                error = error,
                "Server poll failed"
            );
        }
        drop(metrics);

        if degraded {
            self.facade
                .set_backend_health(self.probe.family(), url, false);
        }
    }

    /// リクエスト転送先のサーバーを選択する
    ///
    /// availableな候補のうちポーリング済みのものがあれば最小ウェイト
    /// （同値は設定順の先勝ち）、1つもなければ全available集合の
    /// ラウンドロビン。I/Oは行わず、候補数に対してO(n)。
    pub async fn select(&self) -> ProxyResult<String> {
        let metrics = self.metrics.read().await;

        // 設定順で候補を走査し、同値タイを安定させる
        let available: Vec<&ServerMetrics> = self
            .servers
            .iter()
            .filter_map(|s| metrics.get(s))
            .filter(|m| m.available)
            .collect();

        if available.is_empty() {
            return Err(ProxyError::NoBackendAvailable(self.probe.family()));
        }

        let qualifies = |m: &ServerMetrics| {
            m.last_check.is_some() && (self.probe != ProbeKind::Vllm || m.total_weight > 0.0)
        };

        let mut selected: Option<&ServerMetrics> = None;
        for candidate in &available {
            if !qualifies(candidate) {
                continue;
            }
            match selected {
                Some(current) if candidate.total_weight >= current.total_weight => {}
                _ => selected = Some(candidate),
            }
        }

        if let Some(server) = selected {
            debug!(
                family = self.probe.family(),
                server = %server.url,
                weight = server.total_weight,
                "Server selected (weighted least-load)"
            );
            return Ok(server.url.clone());
        }

        // フォールバック: ラウンドロビン
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst);
        let server = available[index % available.len()];
        debug!(
            family = self.probe.family(),
            server = %server.url,
            "Server selected (round-robin fallback)"
        );
        Ok(server.url.clone())
    }

    /// 現在のメトリクスを取得する（コピー）
    pub async fn metrics(&self) -> HashMap<String, ServerMetrics> {
        let metrics = self.metrics.read().await;
        metrics.clone()
    }

    /// テスト用: サーバー状態を直接書き換える
    #[cfg(test)]
    pub(crate) async fn inject<F>(&self, url: &str, mutate: F)
    where
        F: FnOnce(&mut ServerMetrics),
    {
        let mut metrics = self.metrics.write().await;
        let entry = metrics
            .entry(url.to_string())
            .or_insert_with(|| ServerMetrics::initial(url.to_string()));
        mutate(entry);
    }
}
