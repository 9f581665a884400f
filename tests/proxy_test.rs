//! プロキシ統合テスト
//!
//! ルーティング、ヘッダー書き換え、ボディのストリーム転送、
//! エラーステータスのマッピングを実サーバー+モックバックエンドで検証する。

mod support;

use aiconnect::api;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{auth_disabled_config, build_state, spawn_app};

/// 認証無効時、リクエストがそのまま上流に届きレスポンスがそのまま返る。
/// 上流には Authorization も X-Forwarded-User も渡らない。
#[tokio::test]
async fn passthrough_without_auth_strips_authorization() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"models":[]}"#))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"models":[]}"#);

    let received = mock.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let upstream = &received[0];
    assert!(!upstream.headers.contains_key("authorization"));
    assert!(!upstream.headers.contains_key("x-forwarded-user"));
    assert_eq!(
        upstream.headers.get("x-forwarded-proto").unwrap(),
        "https"
    );
    assert!(upstream.headers.contains_key("x-forwarded-for"));

    server.stop().await;
}

/// クライアントがAuthorizationを送っても上流には渡らない
#[tokio::test]
async fn client_authorization_never_reaches_upstream() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .send()
        .await
        .unwrap();

    let received = mock.received_requests().await.unwrap();
    assert!(!received[0].headers.contains_key("authorization"));

    server.stop().await;
}

/// /openai/ では共有キーのBearerに必ず差し替えられ、プレフィックスが剥がれる
#[tokio::test]
async fn openai_requests_carry_shared_key() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string(r#"{"model":"gpt-4"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.openai_endpoint = Some(mock.uri());
    config.backends.openai_shared_key = Some("shared-secret".to_string());
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .post(server.url("/openai/chat/completions"))
        .header("Authorization", "Basic dXNlcjpwYXNz")
        .body(r#"{"model":"gpt-4"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");

    // クライアントが何を送っていても上流のAuthorizationは共有キー
    let received = mock.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("authorization").unwrap(),
        "Bearer shared-secret"
    );

    server.stop().await;
}

/// クエリ文字列は維持される
#[tokio::test]
async fn query_string_is_preserved() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    reqwest::Client::new()
        .get(server.url("/ollama/api/generate?stream=true"))
        .send()
        .await
        .unwrap();

    let received = mock.received_requests().await.unwrap();
    assert_eq!(received[0].url.path(), "/api/generate");
    assert_eq!(received[0].url.query(), Some("stream=true"));

    server.stop().await;
}

/// 未知のパスは404
#[tokio::test]
async fn unknown_route_returns_404() {
    let state = build_state(auth_disabled_config());
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/unknown/path"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.stop().await;
}

/// バックエンド未設定なら503とエラーメトリクス
#[tokio::test]
async fn no_backend_returns_503() {
    let state = build_state(auth_disabled_config());
    let metrics = state.metrics.clone();
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let output = metrics.render();
    assert!(output.contains("aiconnect_proxy_errors_total{backend=\"ollama\"} 1"));
    assert!(output.contains("aiconnect_proxy_requests_total{backend=\"ollama\"} 1"));

    server.stop().await;
}

/// 上流のトランスポート障害は502
#[tokio::test]
async fn upstream_failure_returns_502() {
    let mut config = auth_disabled_config();
    // 何も listen していないポート
    config.backends.ollama = vec!["http://127.0.0.1:9".to_string()];
    let state = build_state(config);
    let metrics = state.metrics.clone();
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let output = metrics.render();
    assert!(output.contains("aiconnect_proxy_errors_total{backend=\"ollama\"} 1"));

    server.stop().await;
}

/// 上流のエラーステータスはそのままクライアントに返る（リトライしない）
#[tokio::test]
async fn upstream_status_is_forwarded_verbatim() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.text().await.unwrap(), "teapot");

    // 上流へのリクエストは1回だけ
    assert_eq!(mock.received_requests().await.unwrap().len(), 1);

    server.stop().await;
}

/// リクエストボディは無変更で上流に届く
#[tokio::test]
async fn request_body_streams_unmodified() {
    let payload = "x".repeat(64 * 1024);

    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_string(payload.clone()))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .post(server.url("/ollama/api/generate"))
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.stop().await;
}

/// レイテンシヒストグラムはレスポンス完了後に記録される
#[tokio::test]
async fn latency_is_recorded_per_backend() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock)
        .await;

    let mut config = auth_disabled_config();
    config.backends.ollama = vec![mock.uri()];
    let state = build_state(config);
    let metrics = state.metrics.clone();
    let server = spawn_app(api::create_app(state)).await;

    let response = reqwest::Client::new()
        .get(server.url("/ollama/api/tags"))
        .send()
        .await
        .unwrap();
    let _ = response.text().await.unwrap();

    // ボディ完了後にタイマーがDropされるまで少し待つ
    for _ in 0..50 {
        if metrics
            .render()
            .contains("aiconnect_proxy_latency_seconds_count{backend=\"ollama\"} 1")
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(metrics
        .render()
        .contains("aiconnect_proxy_latency_seconds_count{backend=\"ollama\"} 1"));

    server.stop().await;
}
