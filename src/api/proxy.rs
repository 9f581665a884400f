//! リバースプロキシハンドラー
//!
//! リクエストごとに転送先を解決し、ヘッダーを書き換えて上流に転送する。
//! リクエストボディもレスポンスボディも無変更でストリームする。
//!
//! ヘッダー書き換えの規則:
//! - クライアントの `Authorization` は常に除去する
//! - `/openai/` では共有キーの `Authorization: Bearer …` を付け直す
//! - 認証ミドルウェアが設定した `X-Forwarded-User` は保持する
//! - `X-Forwarded-For` はクライアントアドレス、`X-Forwarded-Proto` は https

use crate::common::error::ProxyError;
use crate::common::ip::normalize_socket_ip;
use crate::metrics::LatencyTimer;
use crate::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{Stream, TryStreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// プロキシ対象のバックエンドファミリー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Ollama,
    Vllm,
    Openai,
}

impl Backend {
    fn label(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
            Self::Openai => "openai",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Ollama => "/ollama",
            Self::Vllm => "/vllm",
            Self::Openai => "/openai",
        }
    }
}

/// /ollama/ 配下のプロキシハンドラー
pub async fn ollama(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    handle(Backend::Ollama, state, addr, request).await
}

/// /vllm/ 配下のプロキシハンドラー
pub async fn vllm(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    handle(Backend::Vllm, state, addr, request).await
}

/// /openai/ 配下のプロキシハンドラー
pub async fn openai(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    handle(Backend::Openai, state, addr, request).await
}

async fn handle(
    backend: Backend,
    state: AppState,
    addr: SocketAddr,
    request: Request,
) -> Response {
    state.metrics.inc_proxy_requests(backend.label());
    // レスポンスストリーム完了（またはクライアント切断）までを計測する
    let timer = state.metrics.latency_timer(backend.label());

    let target = match resolve_target(backend, &state).await {
        Ok(url) => url,
        Err(e) => {
            warn!(backend = backend.label(), error = %e, "No backend available");
            state.metrics.inc_proxy_errors(backend.label());
            drop(timer);
            return (e.status_code(), e.external_message()).into_response();
        }
    };

    let path = request.uri().path();
    let mut outbound_path = path
        .strip_prefix(backend.prefix())
        .unwrap_or(path)
        .to_string();
    if outbound_path.is_empty() {
        outbound_path = "/".to_string();
    }
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let url = format!("{}{}{}", target.trim_end_matches('/'), outbound_path, query);

    let (parts, body) = request.into_parts();
    let headers = build_outbound_headers(backend, &state, &parts.headers, &addr);

    debug!(
        backend = backend.label(),
        server = %target,
        path = %outbound_path,
        method = %parts.method,
        user = headers
            .get(crate::auth::FORWARDED_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
        "Proxying request"
    );

    let outbound = state
        .http_client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    match outbound.send().await {
        Ok(upstream) => stream_response(upstream, timer),
        Err(e) => {
            error!(
                backend = backend.label(),
                server = %target,
                error = %e,
                "Proxy error"
            );
            state.metrics.inc_proxy_errors(backend.label());
            drop(timer);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

/// 転送先URLを解決する
///
/// ollama/vllmはロードバランサーの選択、openaiは固定エンドポイント。
async fn resolve_target(backend: Backend, state: &AppState) -> Result<String, ProxyError> {
    match backend {
        Backend::Ollama => state.ollama_lb.select().await,
        Backend::Vllm => state.vllm_lb.select().await,
        Backend::Openai => state
            .config
            .backends
            .openai_endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or(ProxyError::NoBackendAvailable("openai")),
    }
}

/// 上流へ送るヘッダーを構築する
fn build_outbound_headers(
    backend: Backend,
    state: &AppState,
    inbound: &HeaderMap,
    addr: &SocketAddr,
) -> HeaderMap {
    let mut headers = inbound.clone();

    // クライアントの資格情報は上流に渡さない。Hostは上流のものをreqwestが設定する。
    headers.remove(header::AUTHORIZATION);
    headers.remove(header::HOST);
    // hop-by-hopヘッダーと、ストリーム転送で再計算されるフレーミングヘッダー
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "content-length",
    ] {
        headers.remove(name);
    }

    if backend == Backend::Openai {
        if let Some(key) = state.config.backends.openai_shared_key.as_deref() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key)) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
    }

    let client_ip = normalize_socket_ip(addr).to_string();
    if let Ok(value) = HeaderValue::from_str(&client_ip) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));

    headers
}

/// 上流レスポンスをそのままストリームで返す
fn stream_response(upstream: reqwest::Response, timer: LatencyTimer) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // フレーミングはhyperが付け直す
    headers.remove("connection");
    headers.remove("transfer-encoding");

    let stream = upstream.bytes_stream().map_err(io::Error::other);
    let body = Body::from_stream(TimedBody {
        inner: Box::pin(stream),
        _timer: timer,
    });

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// レイテンシタイマーを完了まで保持するボディストリーム
///
/// ストリームのDrop（完了またはクライアント切断）でタイマーが落ち、
/// ヒストグラムに記録される。
struct TimedBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>,
    _timer: LatencyTimer,
}

impl Stream for TimedBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_labels_and_prefixes() {
        assert_eq!(Backend::Ollama.label(), "ollama");
        assert_eq!(Backend::Vllm.prefix(), "/vllm");
        assert_eq!(Backend::Openai.prefix(), "/openai");
    }

    #[test]
    fn prefix_stripping_yields_root_for_bare_prefix() {
        let path = "/ollama/";
        let stripped = path.strip_prefix(Backend::Ollama.prefix()).unwrap();
        assert_eq!(stripped, "/");

        let path = "/openai/chat/completions";
        let stripped = path.strip_prefix(Backend::Openai.prefix()).unwrap();
        assert_eq!(stripped, "/chat/completions");
    }
}
