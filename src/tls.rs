//! TLSリスナー
//!
//! 起動時にTLSモードを1つだけ選択する:
//! - 証明書ファイルモード: cert_file/key_file のペアを読み込む（不整合はfatal）
//! - ACMEモード: domain をキーに自動取得し cache_dir（0700）にキャッシュする

use crate::common::error::{CommonResult, ProxyError, ProxyResult};
use crate::config::TlsConfig;
use crate::shutdown::ShutdownController;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures::StreamExt;
use rustls_acme::{caches::DirCache, AcmeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// グレースフルシャットダウンの猶予
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 選択されたTLSモード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// 明示的な証明書・鍵ファイル
    Files {
        /// 証明書ファイル
        cert: PathBuf,
        /// 秘密鍵ファイル
        key: PathBuf,
    },
    /// ACMEプロバイダによる自動取得
    Acme {
        /// 証明書を取得するドメイン
        domain: String,
        /// 証明書キャッシュディレクトリ
        cache_dir: PathBuf,
    },
}

impl TlsMode {
    /// 設定からTLSモードを決定する
    pub fn from_config(tls: &TlsConfig) -> CommonResult<Self> {
        tls.validate()?;

        if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
            return Ok(Self::Files {
                cert: cert.clone(),
                key: key.clone(),
            });
        }

        // validate()が通っていればdomainとcache_dirは揃っている
        Ok(Self::Acme {
            domain: tls.domain.clone().unwrap_or_default(),
            cache_dir: tls.cache_dir.clone().unwrap_or_default(),
        })
    }
}

/// HTTPSリスナーを起動し、シャットダウン要求まで処理し続ける
pub async fn serve(app: Router, tls: &TlsConfig, shutdown: ShutdownController) -> ProxyResult<()> {
    let mode = TlsMode::from_config(tls)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], tls.port));

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match mode {
        TlsMode::Files { cert, key } => {
            let config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(|e| ProxyError::Tls(format!("failed to load certificate pair: {}", e)))?;

            info!(address = %addr, cert = %cert.display(), "HTTPS server starting (certificate files)");

            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(make_service)
                .await
                .map_err(|e| ProxyError::Tls(e.to_string()))
        }
        TlsMode::Acme { domain, cache_dir } => {
            prepare_cache_dir(&cache_dir)?;

            let mut state = AcmeConfig::new([domain.clone()])
                .cache(DirCache::new(cache_dir))
                .directory_lets_encrypt(true)
                .state();
            let rustls_config = state.default_rustls_config();
            let acceptor = state.axum_acceptor(rustls_config);

            tokio::spawn(async move {
                loop {
                    match state.next().await {
                        Some(Ok(event)) => info!(event = ?event, "ACME event"),
                        Some(Err(e)) => error!(error = %e, "ACME error"),
                        None => break,
                    }
                }
            });

            info!(address = %addr, domain = %domain, "HTTPS server starting (ACME)");

            axum_server::bind(addr)
                .acceptor(acceptor)
                .handle(handle)
                .serve(make_service)
                .await
                .map_err(|e| ProxyError::Tls(e.to_string()))
        }
    }
}

/// ACMEキャッシュディレクトリを0700で用意する
fn prepare_cache_dir(cache_dir: &PathBuf) -> ProxyResult<()> {
    std::fs::create_dir_all(cache_dir)
        .map_err(|e| ProxyError::Tls(format!("failed to create cache dir: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(cache_dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| ProxyError::Tls(format!("failed to set cache dir permissions: {}", e)))?;
    }

    Ok(())
}
