//! LDAPディレクトリ認証
//!
//! サービスアカウントでバインドしてユーザーDNを検索し、ユーザー本人の
//! 資格情報で再バインドして認証する。認可は `memberOf` と許可グループの
//! 大文字小文字を無視した部分一致で判定する。

use crate::config::AuthConfig;
use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// ディレクトリ操作1回あたりのタイムアウト
const DIRECTORY_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// ディレクトリ認証のエラー
///
/// クライアントへはどのバリアントも403として返る。内訳はログとメトリクスのみ。
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// ディレクトリへの接続失敗
    #[error("directory connection failed: {0}")]
    Connect(String),

    /// サービスアカウントのバインド失敗
    #[error("service account bind failed: {0}")]
    ServiceBind(String),

    /// ユーザー検索の失敗
    #[error("user search failed: {0}")]
    Search(String),

    /// ユーザーが見つからない
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// ユーザー資格情報が不正
    #[error("invalid credentials for user {0}")]
    InvalidCredentials(String),

    /// 許可グループに所属していない
    #[error("user {0} is not a member of any allowed group")]
    NotAuthorized(String),
}

/// ユーザーのグループが許可リストに含まれるか判定する
///
/// `memberOf` の各値に対し、許可グループ識別子が大文字小文字を無視した
/// 部分文字列として含まれていれば許可。
pub(crate) fn is_authorized(allowed_groups: &[String], member_of: &[String]) -> bool {
    allowed_groups.iter().any(|allowed| {
        let allowed = allowed.to_lowercase();
        member_of
            .iter()
            .any(|group| group.to_lowercase().contains(&allowed))
    })
}

/// ディレクトリでユーザーを認証・認可する
///
/// 1. `directory_url` に接続
/// 2. サービスアカウントでバインド
/// 3. `search_base` 配下を `(sAMAccountName=<escaped>)` で検索し `dn` と `memberOf` を取得
/// 4. 取得したDNと提示パスワードで再バインド
/// 5. `memberOf` と許可グループの部分一致で認可
pub async fn authenticate_and_authorize(
    config: &AuthConfig,
    username: &str,
    password: &str,
) -> Result<(), DirectoryError> {
    let (conn, mut ldap) = LdapConnAsync::new(&config.directory_url)
        .await
        .map_err(|e| DirectoryError::Connect(e.to_string()))?;
    ldap3::drive!(conn);

    ldap.with_timeout(DIRECTORY_OP_TIMEOUT)
        .simple_bind(&config.service_bind_dn, &config.service_bind_secret)
        .await
        .map_err(|e| DirectoryError::ServiceBind(e.to_string()))?
        .success()
        .map_err(|e| DirectoryError::ServiceBind(e.to_string()))?;

    let filter = format!("(sAMAccountName={})", ldap_escape(username));
    let (entries, _result) = ldap
        .with_timeout(DIRECTORY_OP_TIMEOUT)
        .search(
            &config.search_base,
            Scope::Subtree,
            &filter,
            vec!["dn", "memberOf"],
        )
        .await
        .map_err(|e| DirectoryError::Search(e.to_string()))?
        .success()
        .map_err(|e| DirectoryError::Search(e.to_string()))?;

    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| DirectoryError::UserNotFound(username.to_string()))?;
    let entry = SearchEntry::construct(entry);
    let user_dn = entry.dn.clone();
    let member_of = entry
        .attrs
        .get("memberOf")
        .cloned()
        .unwrap_or_default();

    ldap.with_timeout(DIRECTORY_OP_TIMEOUT)
        .simple_bind(&user_dn, password)
        .await
        .map_err(|_| DirectoryError::InvalidCredentials(username.to_string()))?
        .success()
        .map_err(|_| DirectoryError::InvalidCredentials(username.to_string()))?;

    let _ = ldap.unbind().await;

    if is_authorized(&config.allowed_groups, &member_of) {
        debug!(username = username, "User authorized via group membership");
        Ok(())
    } else {
        Err(DirectoryError::NotAuthorized(username.to_string()))
    }
}
