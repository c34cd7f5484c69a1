use std::time::Duration;

use axum::http::{self, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use http_body_util::BodyExt;
use mock_server::{app, app_with, Couch, ADMIN_PASSWORD, ADMIN_USER};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn basic() -> String {
    format!("Basic {}", STANDARD.encode(format!("{ADMIN_USER}:{ADMIN_PASSWORD}")))
}

fn authed(method: &str, uri: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::AUTHORIZATION, basic())
        .body(String::new())
        .unwrap()
}

fn login_request(name: &str, password: &str) -> Request<String> {
    Request::builder()
        .method("POST")
        .uri("/_session")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(json!({ "name": name, "password": password }).to_string())
        .unwrap()
}

fn set_cookie_token(response: &axum::response::Response) -> String {
    let cookie = response.headers()[http::header::SET_COOKIE].to_str().unwrap();
    let pair = cookie.split(';').next().unwrap();
    pair.strip_prefix("AuthSession=").unwrap().to_string()
}

// --- session ---

#[tokio::test]
async fn login_sets_session_cookie() {
    let couch = Couch::new();
    let resp = app_with(couch.clone())
        .oneshot(login_request(ADMIN_USER, ADMIN_PASSWORD))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp.headers()[http::header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(cookie.starts_with("AuthSession="));
    assert!(cookie.ends_with("; Version=1; Path=/; HttpOnly"));
    assert_eq!(couch.login_count(), 1);
}

#[tokio::test]
async fn wrong_password_is_401() {
    let couch = Couch::new();
    let resp = app_with(couch.clone())
        .oneshot(login_request(ADMIN_USER, "wrong"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "unauthorized");
    assert_eq!(couch.login_count(), 0);
}

#[tokio::test]
async fn rejected_logins_count_as_attempts() {
    let couch = Couch::new();
    let app = app_with(couch.clone());
    app.clone().oneshot(login_request(ADMIN_USER, "wrong")).await.unwrap();
    app.oneshot(login_request(ADMIN_USER, ADMIN_PASSWORD)).await.unwrap();

    assert_eq!(couch.login_attempts(), 2);
    assert_eq!(couch.login_count(), 1);
}

#[tokio::test]
async fn login_delay_holds_the_answer() {
    let couch = Couch::new();
    couch.set_login_delay(Duration::from_millis(100));
    let started = tokio::time::Instant::now();
    let resp = app_with(couch)
        .oneshot(login_request(ADMIN_USER, ADMIN_PASSWORD))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn session_reports_cookie_user_until_expired() {
    use tower::Service;

    let couch = Couch::new();
    let mut app = app_with(couch.clone()).into_service();

    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(login_request(ADMIN_USER, ADMIN_PASSWORD))
        .await
        .unwrap();
    let token = set_cookie_token(&resp);

    let probe = || {
        Request::builder()
            .uri("/_session")
            .header(http::header::COOKIE, format!("AuthSession={token}"))
            .body(String::new())
            .unwrap()
    };

    let resp = ServiceExt::ready(&mut app).await.unwrap().call(probe()).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["userCtx"]["name"], ADMIN_USER);
    assert_eq!(body["userCtx"]["roles"], json!(["_admin"]));

    couch.expire_sessions();
    let resp = ServiceExt::ready(&mut app).await.unwrap().call(probe()).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["userCtx"]["name"], Value::Null);
}

#[tokio::test]
async fn impersonation_changes_reported_name() {
    let couch = Couch::new();
    couch.impersonate(Some("bob"));
    let resp = app_with(couch).oneshot(authed("GET", "/_session")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["userCtx"]["name"], "bob");
}

// --- databases and documents ---

#[tokio::test]
async fn anonymous_database_access_is_401() {
    let resp = app()
        .oneshot(Request::builder().uri("/db").body(String::new()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn locked_database_rejects_valid_credentials() {
    let couch = Couch::new();
    couch.create_database("vault");
    couch.lock_database("vault");
    let resp = app_with(couch).oneshot(authed("GET", "/vault")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_database_is_404() {
    let resp = app().oneshot(authed("GET", "/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp).await;
    assert_eq!(body, json!({ "error": "not_found", "reason": "Database does not exist." }));
}

#[tokio::test]
async fn creating_existing_database_is_412() {
    let couch = Couch::new();
    couch.create_database("db");
    let resp = app_with(couch).oneshot(authed("PUT", "/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "file_exists");
}

#[tokio::test]
async fn document_lifecycle() {
    use tower::Service;

    let couch = Couch::new();
    couch.create_database("db");
    let mut app = app_with(couch).into_service();

    // create
    let put = Request::builder()
        .method("PUT")
        .uri("/db/doc1")
        .header(http::header::AUTHORIZATION, basic())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(r#"{"title":"hello"}"#.to_string())
        .unwrap();
    let resp = ServiceExt::ready(&mut app).await.unwrap().call(put).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let rev = created["rev"].as_str().unwrap().to_string();
    assert!(rev.starts_with("1-"));

    // get, with an ETag naming the revision
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(authed("GET", "/db/doc1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[http::header::ETAG], format!("\"{rev}\"").as_str());
    let doc = body_json(resp).await;
    assert_eq!(doc["_id"], "doc1");
    assert_eq!(doc["title"], "hello");

    // conditional get
    let mut conditional = authed("GET", "/db/doc1");
    conditional
        .headers_mut()
        .insert(http::header::IF_NONE_MATCH, format!("\"{rev}\"").parse().unwrap());
    let resp = ServiceExt::ready(&mut app).await.unwrap().call(conditional).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(resp).await.is_empty());

    // stale update
    let stale = Request::builder()
        .method("PUT")
        .uri("/db/doc1")
        .header(http::header::AUTHORIZATION, basic())
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(r#"{"title":"again"}"#.to_string())
        .unwrap();
    let resp = ServiceExt::ready(&mut app).await.unwrap().call(stale).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // delete, then 404 with reason "deleted"
    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(authed("DELETE", &format!("/db/doc1?rev={rev}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = ServiceExt::ready(&mut app)
        .await
        .unwrap()
        .call(authed("GET", "/db/doc1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["reason"], "deleted");
}

// --- changes ---

#[tokio::test]
async fn normal_changes_feed() {
    let couch = Couch::new();
    couch.put_document("db", "a", json!({ "n": 1 }));
    couch.put_document("db", "b", json!({ "n": 2 }));
    let resp = app_with(couch).oneshot(authed("GET", "/db/_changes?limit=1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"][0]["id"], "a");
    assert_eq!(body["last_seq"], "1-g1AAAAB");
    assert_eq!(body["pending"], 1);
}

#[tokio::test]
async fn continuous_changes_feed_is_line_delimited() {
    let couch = Couch::new();
    couch.put_document("db", "a", json!({}));
    couch.put_document("db", "b", json!({}));
    let resp = app_with(couch)
        .oneshot(authed("GET", "/db/_changes?feed=continuous&since=1&include_docs=true"))
        .await
        .unwrap();

    let bytes = body_bytes(resp).await;
    let lines: Vec<Value> = std::str::from_utf8(&bytes)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], "b");
    assert_eq!(lines[0]["doc"]["_id"], "b");
    assert_eq!(lines[1]["last_seq"], "2-g1AAAAB");
}

#[tokio::test]
async fn continuous_feed_with_timeout_holds_the_summary_back() {
    let couch = Couch::new();
    couch.put_document("db", "a", json!({}));
    let resp = app_with(couch)
        .oneshot(authed("GET", "/db/_changes?feed=continuous&timeout=200"))
        .await
        .unwrap();
    let mut body = resp.into_body();

    let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&first).unwrap()["id"], "a");

    let started = tokio::time::Instant::now();
    let last = body.frame().await.unwrap().unwrap().into_data().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(serde_json::from_slice::<Value>(&last).unwrap()["last_seq"], "1-g1AAAAB");
    assert!(body.frame().await.is_none());
}

// --- helpers ---

#[tokio::test]
async fn echo_reflects_request() {
    let req = Request::builder()
        .method("PATCH")
        .uri("/_echo?x=1&y=two")
        .header("X-Couch-Full-Commit", "true")
        .body("payload".to_string())
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["method"], "PATCH");
    assert_eq!(body["query"], "x=1&y=two");
    assert_eq!(body["headers"]["x-couch-full-commit"], "true");
    assert_eq!(body["body"], "payload");
}
