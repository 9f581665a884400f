//! AIConnect Server Entry Point

use aiconnect::balancer::{LoadBalancer, ProbeKind};
use aiconnect::config::Config;
use aiconnect::discovery::{Advertiser, Discovery};
use aiconnect::health::HealthChecker;
use aiconnect::registry::NodeRegistry;
use aiconnect::shutdown::ShutdownController;
use aiconnect::{api, config, logging, metrics, tls, AppState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 認証付きAIバックエンドリバースプロキシ
#[derive(Parser)]
#[command(name = "aiconnect", version, about)]
struct Cli {
    /// 設定ファイルパス（未指定ならCONFIG_PATH、さらに/etc/aiconnect/config.yaml）
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_path);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    logging::init(&config.logging).expect("failed to initialize logging");

    info!("AIConnect v{} starting", env!("CARGO_PKG_VERSION"));

    run_server(config).await;
}

async fn run_server(config: Config) {
    let config = Arc::new(config);
    let shutdown = ShutdownController::default();

    // メトリクスサーバーは別ポートで先に立ち上げる
    let metrics = Arc::new(metrics::Manager::new());
    metrics.start_server(config.monitoring.metrics_port, shutdown.clone());

    // ノードレジストリとイベントログ
    let registry = NodeRegistry::new();
    registry
        .on_event(|event| {
            info!(
                event = ?event.kind,
                node = %event.node.name,
                host = %event.node.host,
                port = event.node.port,
                node_type = %event.node.node_type.as_str(),
                "Registry event"
            );
        })
        .await;

    // mDNSディスカバリー + ヘルスチェッカー
    let mut advertiser = None;
    if config.discovery.enabled {
        match Advertiser::start(&config.discovery.advertised_name, config.tls.port) {
            Ok(a) => advertiser = Some(a),
            Err(e) => warn!(error = %e, "Failed to start mDNS advertiser"),
        }

        Discovery::new(&config.discovery, registry.clone()).start(shutdown.clone());

        HealthChecker::new(registry.clone())
            .with_interval(config.monitoring.health_check_interval_s)
            .start(shutdown.clone());
    }

    // 共有HTTPクライアント（接続プーリング有効）
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(std::time::Duration::from_secs(60))
        .tcp_keepalive(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to create HTTP client");

    // ファミリーごとのロードバランサー
    let ollama_lb = LoadBalancer::new(
        ProbeKind::Ollama,
        config.backends.ollama.clone(),
        config.monitoring.health_check_interval_s,
        metrics.clone(),
    );
    ollama_lb.start(shutdown.clone());

    let vllm_lb = LoadBalancer::new(
        ProbeKind::Vllm,
        config.backends.vllm.clone(),
        config.monitoring.health_check_interval_s,
        metrics.clone(),
    );
    vllm_lb.start(shutdown.clone());

    let state = AppState {
        config: config.clone(),
        registry,
        ollama_lb,
        vllm_lb,
        metrics,
        http_client,
        shutdown: shutdown.clone(),
    };

    let app = api::create_app(state);

    // OSシグナルをシャットダウン要求に変換する
    tokio::spawn(forward_signals(shutdown.clone()));

    if let Err(e) = tls::serve(app, &config.tls, shutdown.clone()).await {
        // 証明書やリスナーの失敗は起動時fatal
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Some(advertiser) = advertiser {
        advertiser.stop();
    }

    info!("Server shutdown complete");
}

/// シャットダウンシグナルを待機して要求に変換する
async fn forward_signals(shutdown: ShutdownController) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown.request_shutdown();
}
