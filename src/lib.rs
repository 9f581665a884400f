//! AIConnect Server
//!
//! AI推論バックエンド（Ollama / vLLM / OpenAI互換）を束ねる認証付きリバースプロキシ

#![warn(missing_docs)]

/// 共通型定義（エラー型・IPユーティリティ）
pub mod common;

/// REST API・プロキシハンドラー
pub mod api;

/// 認証・認可（HTTP Basic + LDAPディレクトリ）
pub mod auth;

/// ロードバランサー（メトリクスベース + ラウンドロビンフォールバック）
pub mod balancer;

/// mDNSディスカバリー（バックエンド探索・自己アドバタイズ）
pub mod discovery;

/// ヘルスチェック監視
pub mod health;

/// ノード登録管理
pub mod registry;

/// 設定管理（YAMLスナップショット）
pub mod config;

/// ロギング初期化ユーティリティ
pub mod logging;

/// Prometheusメトリクス収集・公開
pub mod metrics;

/// TLSリスナー（証明書ファイル / ACME）
pub mod tls;

/// Shutdown controller (signal + cooperative)
pub mod shutdown;

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    /// 起動時に確定した設定スナップショット
    pub config: std::sync::Arc<config::Config>,
    /// ノードレジストリ
    pub registry: registry::NodeRegistry,
    /// Ollamaバックエンド用ロードバランサー
    pub ollama_lb: balancer::LoadBalancer,
    /// vLLMバックエンド用ロードバランサー
    pub vllm_lb: balancer::LoadBalancer,
    /// メトリクスマネージャー
    pub metrics: std::sync::Arc<metrics::Manager>,
    /// 共有HTTPクライアント（接続プーリング有効）
    pub http_client: reqwest::Client,
    /// Cooperative shutdown controller
    pub shutdown: shutdown::ShutdownController,
}
