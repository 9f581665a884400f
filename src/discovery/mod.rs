//! mDNSディスカバリー
//!
//! ローカルネットワーク上のバックエンドサービスを定期スキャンして
//! レジストリに書き込む。ノードの削除は行わない（ヘルスチェッカーの責務）。
//! あわせて自分自身を `_aiconnect._tcp` としてアドバタイズする。

use crate::config::DiscoveryConfig;
use crate::registry::{Node, NodeRegistry, NodeType};
use crate::shutdown::ShutdownController;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// OllamaバックエンドのmDNSサービスタイプ
pub const OLLAMA_SERVICE_TYPE: &str = "_ollama._tcp";
/// OpenAI互換バックエンドのmDNSサービスタイプ
pub const OPENAI_SERVICE_TYPE: &str = "_openai._tcp";
/// vLLMバックエンドのmDNSサービスタイプ
pub const VLLM_SERVICE_TYPE: &str = "_vllm._tcp";
/// AIConnect自身のmDNSサービスタイプ
pub const AICONNECT_SERVICE_TYPE: &str = "_aiconnect._tcp";

/// mDNSサービスタイプをノード種別に変換する
pub fn service_type_to_node_type(service_type: &str) -> Option<NodeType> {
    match service_type {
        OLLAMA_SERVICE_TYPE => Some(NodeType::Ollama),
        OPENAI_SERVICE_TYPE => Some(NodeType::Openai),
        VLLM_SERVICE_TYPE => Some(NodeType::Vllm),
        _ => None,
    }
}

/// mDNSディスカバリー
#[derive(Clone)]
pub struct Discovery {
    service_types: Vec<String>,
    scan_interval: Duration,
    scan_timeout: Duration,
    registry: NodeRegistry,
}

impl Discovery {
    /// 新しいディスカバリーを作成する
    pub fn new(config: &DiscoveryConfig, registry: NodeRegistry) -> Self {
        Self {
            service_types: config.service_types.clone(),
            scan_interval: Duration::from_secs(config.interval_s),
            scan_timeout: Duration::from_secs(config.timeout_s),
            registry,
        }
    }

    /// バックグラウンドで定期スキャンを開始する
    pub fn start(self, shutdown: ShutdownController) {
        tokio::spawn(async move {
            self.scan().await;

            info!(
                services = ?self.service_types,
                interval_secs = self.scan_interval.as_secs(),
                "mDNS discovery started"
            );

            let mut timer = interval(self.scan_interval);
            // 起動時スキャン済みのため、即時発火する最初のtickを消費する
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => {
                        info!("mDNS discovery stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        self.scan().await;
                    }
                }
            }
        });
    }

    /// 設定された全サービスタイプを1回ずつスキャンする
    pub async fn scan(&self) {
        for service_type in &self.service_types {
            self.browse_service(service_type).await;
        }
    }

    /// 1サービスタイプをスキャンする
    async fn browse_service(&self, service_type: &str) {
        let Some(node_type) = service_type_to_node_type(service_type) else {
            warn!(service = service_type, "Unknown service type");
            return;
        };

        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                error!(service = service_type, error = %e, "Failed to create mDNS daemon");
                return;
            }
        };

        let full_type = format!("{}.local.", service_type);
        let receiver = match daemon.browse(&full_type) {
            Ok(r) => r,
            Err(e) => {
                debug!(service = service_type, error = %e, "mDNS browse error");
                let _ = daemon.shutdown();
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    self.process_entry(node_type, service_type, &info).await;
                }
                Ok(Ok(_)) => {}
                // チャネルが閉じた、またはスキャン予算を使い切った
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let _ = daemon.stop_browse(&full_type);
        let _ = daemon.shutdown();
    }

    /// 解決済みエントリをレジストリに登録する
    async fn process_entry(&self, node_type: NodeType, service_type: &str, info: &ServiceInfo) {
        let Some(host) = pick_host(info) else {
            warn!(
                instance = info.get_fullname(),
                "No address found for discovered service"
            );
            return;
        };

        let name = instance_name(info.get_fullname(), service_type);
        let node = Node::new(name, node_type, host, info.get_port());

        debug!(
            name = %node.name,
            node_type = %node.node_type.as_str(),
            host = %node.host,
            port = node.port,
            service = service_type,
            "Discovered backend via mDNS"
        );

        self.registry.add(node).await;
    }
}

/// アドレスを選択する: IPv4優先、なければIPv6、それもなければホスト名
fn pick_host(info: &ServiceInfo) -> Option<String> {
    let addresses = info.get_addresses();
    if let Some(v4) = addresses.iter().find(|a| matches!(a, IpAddr::V4(_))) {
        return Some(v4.to_string());
    }
    if let Some(v6) = addresses.iter().find(|a| matches!(a, IpAddr::V6(_))) {
        return Some(v6.to_string());
    }
    let hostname = info.get_hostname().trim_end_matches('.');
    if hostname.is_empty() {
        None
    } else {
        Some(hostname.to_string())
    }
}

/// フルネームからインスタンス名を取り出す
///
/// `my-ollama._ollama._tcp.local.` → `my-ollama`
fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}.local.", service_type);
    fullname
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .to_string()
}

/// mDNSアドバタイザー
///
/// AIConnect自身をローカルネットワークに告知する。
pub struct Advertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertiser {
    /// アドバタイズを開始する
    pub fn start(name: &str, port: u16) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let host = format!(
            "{}.local.",
            name.to_lowercase().replace(|c: char| !c.is_ascii_alphanumeric(), "-")
        );
        let properties = [
            ("version", env!("CARGO_PKG_VERSION")),
            ("capabilities", "ollama,vllm,openai"),
        ];
        let service_type = format!("{}.local.", AICONNECT_SERVICE_TYPE);
        let info = ServiceInfo::new(&service_type, name, &host, "", port, &properties[..])?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        daemon.register(info)?;

        info!(name = name, port = port, "mDNS advertiser started");

        Ok(Self { daemon, fullname })
    }

    /// アドバタイズを停止する
    pub fn stop(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
        info!("mDNS advertiser stopped");
    }
}
