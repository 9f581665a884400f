//! 設定管理
//!
//! 起動時に一度だけ読み込むYAML設定スナップショット。
//! 読み込み後は変更されない（frozen）。

use crate::common::error::{CommonError, CommonResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// デフォルトの設定ファイルパス
pub const DEFAULT_CONFIG_PATH: &str = "/etc/aiconnect/config.yaml";

/// 設定ファイルパスを解決する
///
/// 環境変数 `CONFIG_PATH` が設定されていればそれを、
/// なければ `/etc/aiconnect/config.yaml` を返す。
pub fn default_path() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// アプリケーション設定（スナップショット）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// 認証・認可設定
    #[serde(default)]
    pub auth: AuthConfig,
    /// バックエンド設定
    #[serde(default)]
    pub backends: BackendsConfig,
    /// TLSリスナー設定
    #[serde(default)]
    pub tls: TlsConfig,
    /// 監視設定
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// ロギング設定
    #[serde(default)]
    pub logging: LoggingConfig,
    /// mDNSディスカバリー設定
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// 認証・認可設定
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// 認証の有効/無効（デフォルト: 有効）
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// LDAPディレクトリURL（ldap:// または ldaps://）
    #[serde(default)]
    pub directory_url: String,
    /// サービスアカウントのバインドDN
    #[serde(default)]
    pub service_bind_dn: String,
    /// サービスアカウントのバインドシークレット
    #[serde(default)]
    pub service_bind_secret: String,
    /// ユーザー検索のベースDN
    #[serde(default)]
    pub search_base: String,
    /// 許可するグループ識別子の集合
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    /// 認証をバイパスするパスパターン（順序付き）
    #[serde(default)]
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory_url: String::new(),
            service_bind_dn: String::new(),
            service_bind_secret: String::new(),
            search_base: String::new(),
            allowed_groups: Vec::new(),
            public_paths: Vec::new(),
        }
    }
}

/// バックエンド設定
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendsConfig {
    /// OllamaバックエンドのベースURLリスト
    #[serde(default)]
    pub ollama: Vec<String>,
    /// vLLMバックエンドのベースURLリスト
    #[serde(default)]
    pub vllm: Vec<String>,
    /// OpenAI互換エンドポイント
    #[serde(default)]
    pub openai_endpoint: Option<String>,
    /// OpenAI互換エンドポイントへ送る共有キー
    #[serde(default)]
    pub openai_shared_key: Option<String>,
}

/// TLSリスナー設定
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// ACMEモードのドメイン名
    #[serde(default)]
    pub domain: Option<String>,
    /// ACME証明書キャッシュディレクトリ
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// 証明書ファイル（key_fileとペアで指定）
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// 秘密鍵ファイル（cert_fileとペアで指定）
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// HTTPSリスナーのポート（デフォルト: 443）
    #[serde(default = "default_tls_port")]
    pub port: u16,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            domain: None,
            cache_dir: None,
            cert_file: None,
            key_file: None,
            port: default_tls_port(),
        }
    }
}

/// 監視設定
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    /// ヘルスチェック・メトリクスポーリング間隔（秒、デフォルト: 30）
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_s: u64,
    /// メトリクス公開ポート（デフォルト: 9090）
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_s: default_health_check_interval(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// ログ出力フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// 構造化JSON出力
    Json,
    /// 人間可読テキスト出力
    Text,
}

/// ロギング設定
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// ログレベル（trace/debug/info/warn/error、デフォルト: info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 出力フォーマット（デフォルト: json）
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// mDNSディスカバリー設定
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// ディスカバリーの有効/無効（デフォルト: 無効）
    #[serde(default)]
    pub enabled: bool,
    /// 自己アドバタイズするサービス名
    #[serde(default = "default_advertised_name")]
    pub advertised_name: String,
    /// 探索するサービスタイプ
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// スキャン間隔（秒、デフォルト: 30）
    #[serde(default = "default_discovery_interval")]
    pub interval_s: u64,
    /// スキャン1回あたりのタイムアウト（秒、デフォルト: 5）
    #[serde(default = "default_discovery_timeout")]
    pub timeout_s: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            advertised_name: default_advertised_name(),
            service_types: default_service_types(),
            interval_s: default_discovery_interval(),
            timeout_s: default_discovery_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tls_port() -> u16 {
    443
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_advertised_name() -> String {
    "AIConnect Orchestrator".to_string()
}

fn default_service_types() -> Vec<String> {
    vec![
        "_ollama._tcp".to_string(),
        "_openai._tcp".to_string(),
        "_vllm._tcp".to_string(),
    ]
}

fn default_discovery_interval() -> u64 {
    30
}

fn default_discovery_timeout() -> u64 {
    5
}

impl Config {
    /// 設定ファイルを読み込む
    pub fn load(path: &Path) -> CommonResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            CommonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    /// 設定を検証する
    ///
    /// 起動時に呼び出し、失敗はfatal扱い。
    pub fn validate(&self) -> CommonResult<()> {
        self.tls.validate()?;

        if self.auth.enabled {
            if self.auth.directory_url.trim().is_empty() {
                return Err(CommonError::Config(
                    "auth.directory_url is required when auth is enabled".into(),
                ));
            }
            if self.auth.search_base.trim().is_empty() {
                return Err(CommonError::Config(
                    "auth.search_base is required when auth is enabled".into(),
                ));
            }
            if self.auth.allowed_groups.is_empty() {
                return Err(CommonError::Config(
                    "auth.allowed_groups is required when auth is enabled".into(),
                ));
            }
        }

        let has_openai = self
            .backends
            .openai_endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        if self.backends.ollama.is_empty() && self.backends.vllm.is_empty() && !has_openai {
            return Err(CommonError::Config(
                "at least one backend must be configured (backends.ollama, backends.vllm or backends.openai_endpoint)".into(),
            ));
        }
        if has_openai
            && self
                .backends
                .openai_shared_key
                .as_deref()
                .is_none_or(|k| k.trim().is_empty())
        {
            return Err(CommonError::Config(
                "backends.openai_shared_key is required when backends.openai_endpoint is set".into(),
            ));
        }

        Ok(())
    }
}

impl TlsConfig {
    /// TLSモードの整合性を検証する
    ///
    /// 証明書ファイルペアとACMEドメインのどちらか一方だけが設定されていること。
    /// 片方のファイルだけの指定はエラー。
    pub fn validate(&self) -> CommonResult<()> {
        let has_domain = self.domain.as_deref().is_some_and(|d| !d.trim().is_empty());
        let has_cert = self.cert_file.is_some();
        let has_key = self.key_file.is_some();

        if has_cert != has_key {
            return Err(CommonError::Config(
                "tls.cert_file and tls.key_file must both be set".into(),
            ));
        }
        let has_files = has_cert && has_key;

        match (has_files, has_domain) {
            (true, true) => Err(CommonError::Config(
                "tls: configure either cert_file/key_file or domain, not both".into(),
            )),
            (false, false) => Err(CommonError::Config(
                "tls: either cert_file/key_file or domain is required".into(),
            )),
            _ => {
                if has_domain
                    && self
                        .cache_dir
                        .as_deref()
                        .is_none_or(|d| d.as_os_str().is_empty())
                {
                    return Err(CommonError::Config(
                        "tls.cache_dir is required in ACME mode".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(yaml.as_bytes())
            .expect("failed to write config");
        file
    }

    fn minimal_yaml() -> &'static str {
        r#"
auth:
  enabled: false
backends:
  ollama:
    - http://10.0.0.1:11434
tls:
  domain: proxy.example.org
  cache_dir: /var/cache/aiconnect
"#
    }

    #[test]
    fn load_applies_defaults() {
        let file = write_config(minimal_yaml());
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.tls.port, 443);
        assert_eq!(config.monitoring.health_check_interval_s, 30);
        assert_eq!(config.monitoring.metrics_port, 9090);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.interval_s, 30);
        assert_eq!(config.discovery.timeout_s, 5);
        assert_eq!(
            config.discovery.service_types,
            vec!["_ollama._tcp", "_openai._tcp", "_vllm._tcp"]
        );
    }

    #[test]
    fn auth_enabled_defaults_to_true() {
        let yaml = r#"
backends:
  ollama: [http://10.0.0.1:11434]
tls:
  cert_file: /etc/ssl/proxy.crt
  key_file: /etc/ssl/proxy.key
"#;
        let file = write_config(yaml);
        let config = Config::load(file.path()).unwrap();
        assert!(config.auth.enabled);
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let file = write_config(minimal_yaml());
        let config = Config::load(file.path()).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn validate_requires_directory_when_auth_enabled() {
        let yaml = r#"
auth:
  enabled: true
backends:
  ollama: [http://10.0.0.1:11434]
tls:
  domain: proxy.example.org
  cache_dir: /var/cache/aiconnect
"#;
        let file = write_config(yaml);
        let config = Config::load(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth.directory_url"));
    }

    #[test]
    fn validate_requires_some_backend() {
        let yaml = r#"
auth:
  enabled: false
tls:
  domain: proxy.example.org
  cache_dir: /var/cache/aiconnect
"#;
        let file = write_config(yaml);
        let config = Config::load(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one backend"));
    }

    #[test]
    fn validate_requires_shared_key_with_openai_endpoint() {
        let yaml = r#"
auth:
  enabled: false
backends:
  openai_endpoint: https://api.openai.example
tls:
  domain: proxy.example.org
  cache_dir: /var/cache/aiconnect
"#;
        let file = write_config(yaml);
        let config = Config::load(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("openai_shared_key"));
    }

    #[test]
    fn tls_rejects_partial_file_pair() {
        let tls = TlsConfig {
            cert_file: Some(PathBuf::from("/etc/ssl/proxy.crt")),
            ..TlsConfig::default()
        };
        let err = tls.validate().unwrap_err();
        assert!(err.to_string().contains("must both be set"));
    }

    #[test]
    fn tls_rejects_both_modes() {
        let tls = TlsConfig {
            domain: Some("proxy.example.org".into()),
            cache_dir: Some(PathBuf::from("/var/cache/aiconnect")),
            cert_file: Some(PathBuf::from("/etc/ssl/proxy.crt")),
            key_file: Some(PathBuf::from("/etc/ssl/proxy.key")),
            ..TlsConfig::default()
        };
        let err = tls.validate().unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn tls_rejects_neither_mode() {
        let tls = TlsConfig::default();
        assert!(tls.validate().is_err());
    }

    #[test]
    fn tls_acme_requires_cache_dir() {
        let tls = TlsConfig {
            domain: Some("proxy.example.org".into()),
            ..TlsConfig::default()
        };
        let err = tls.validate().unwrap_err();
        assert!(err.to_string().contains("cache_dir"));
    }

    #[test]
    fn tls_accepts_file_pair() {
        let tls = TlsConfig {
            cert_file: Some(PathBuf::from("/etc/ssl/proxy.crt")),
            key_file: Some(PathBuf::from("/etc/ssl/proxy.key")),
            ..TlsConfig::default()
        };
        tls.validate().unwrap();
    }

    #[test]
    #[serial]
    fn default_path_honors_config_path_env() {
        std::env::set_var("CONFIG_PATH", "/tmp/custom.yaml");
        assert_eq!(default_path(), PathBuf::from("/tmp/custom.yaml"));
        std::env::remove_var("CONFIG_PATH");
        assert_eq!(default_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Path::new("/nonexistent/aiconnect.yaml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
