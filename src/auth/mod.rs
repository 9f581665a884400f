//! 認証・認可ミドルウェア
//!
//! HTTP Basic認証の資格情報をLDAPディレクトリで検証し、許可グループへの
//! 所属を確認する。認証済みユーザー名は `X-Forwarded-User` で上流に伝搬する。
//! ディレクトリの検証結果はリクエストをまたいでキャッシュしない。

pub mod ldap;

use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

/// 認証済みユーザーを上流に伝えるヘッダー
pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

/// パスが公開パターンに一致するか判定する
///
/// パターンの意味:
/// - 末尾 `/*`: `*` を除いた（`/` で終わる）プレフィックスに前方一致
/// - 末尾 `/`: 同じ前方一致
/// - それ以外: 完全一致
///
/// `/x/*` は `/x/` と `/x/y` に一致するが `/x-admin/` には一致しない。
pub fn path_is_public(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            path.starts_with(prefix)
        } else if pattern.ends_with('/') {
            path.starts_with(pattern.as_str())
        } else {
            path == pattern
        }
    })
}

/// `Authorization: Basic …` ヘッダーから資格情報を取り出す
///
/// Basic以外のスキーム、base64の破損、コロン欠落はすべてNone。
fn parse_basic_credentials(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// LDAP認証ミドルウェア
///
/// チェック順序:
/// 1. 認証無効なら素通し
/// 2. 公開パスなら素通し
/// 3. Basic資格情報がなければ401
/// 4. ディレクトリ検証に失敗すれば403（理由はクライアントに開示しない）
/// 5. `X-Forwarded-User` を認証済みユーザーで上書きして転送
pub async fn middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_config = &state.config.auth;

    if !auth_config.enabled {
        return next.run(request).await;
    }

    if path_is_public(&auth_config.public_paths, request.uri().path()) {
        return next.run(request).await;
    }

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header_value) = header_value else {
        warn!("Request without Authorization header");
        state.metrics.inc_auth_failures("missing_credentials");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    if !header_value.starts_with("Basic ") {
        warn!("Unsupported authorization scheme");
        state.metrics.inc_auth_failures("missing_credentials");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let Some((username, password)) = parse_basic_credentials(header_value) else {
        warn!("Malformed Basic credentials");
        state.metrics.inc_auth_failures("invalid_header");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    match ldap::authenticate_and_authorize(auth_config, &username, &password).await {
        Ok(()) => {
            state.metrics.inc_auth_attempts(true);
        }
        Err(error) => {
            state.metrics.inc_auth_attempts(false);
            state.metrics.inc_auth_failures("directory");
            warn!(
                username = %username,
                error = %error,
                "Authentication or authorization failed"
            );
            // どの段階で失敗したかはクライアントに開示しない
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
    }

    // クライアントが付けてきた値は信用せず常に上書きする
    match header::HeaderValue::from_str(&username) {
        Ok(value) => {
            request.headers_mut().insert(FORWARDED_USER_HEADER, value);
        }
        Err(_) => {
            warn!(username = %username, "Username is not a valid header value");
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
    }

    info!(username = %username, "Authentication and authorization succeeded");

    next.run(request).await
}
