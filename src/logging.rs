//! ロギング初期化
//!
//! tracing-subscriberをプロセスにつき一度だけ初期化する。
//! レベルとフォーマットは設定ファイルの `logging` セクションに従う。

use crate::common::error::{CommonError, CommonResult};
use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// ロガーを初期化する
///
/// `RUST_LOG` が設定されていればそちらを優先し、
/// なければ `logging.level` をグローバルフィルターとして使う。
pub fn init(config: &LoggingConfig) -> CommonResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| CommonError::Config(format!("failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_failure() {
        // 2回目の初期化はグローバル既定があるためエラーになるが、panicしない
        let config = LoggingConfig::default();
        let first = init(&config);
        let second = init(&config);
        assert!(first.is_ok() || second.is_err());
    }
}
