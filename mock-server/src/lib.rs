//! In-memory CouchDB look-alike for exercising the transport over real HTTP.
//!
//! Implements just enough of the server to drive authentication, error
//! classification and streaming: `/_session`, database and document
//! endpoints, `_changes` in normal and continuous form, plus two test-only
//! helpers (`/_echo` and `/_slow`). A `Couch` handle shares state with the
//! running router so tests can expire sessions or count logins.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    convert::Infallible,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use futures_core::Stream;
use tokio::{net::TcpListener, sync::mpsc};
use uuid::Uuid;

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "abc123";
const SESSION_COOKIE: &str = "AuthSession";

#[derive(Debug, Deserialize)]
pub struct Login {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCtx {
    pub name: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
struct Doc {
    rev: String,
    body: Map<String, Value>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct Database {
    docs: BTreeMap<String, Doc>,
    update_seq: u64,
    /// Latest sequence per document id.
    changes: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct AuthState {
    users: HashMap<String, String>,
    sessions: HashMap<String, String>,
    impersonate: Option<String>,
    locked: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    auth: Mutex<AuthState>,
    dbs: Mutex<HashMap<String, Database>>,
    logins: AtomicUsize,
    login_attempts: AtomicUsize,
    login_delay_ms: AtomicU64,
}

/// Shared server state. Clones refer to the same server.
#[derive(Debug, Clone)]
pub struct Couch {
    inner: Arc<Inner>,
}

impl Default for Couch {
    fn default() -> Self {
        Self::new()
    }
}

impl Couch {
    /// A server with one admin user and no databases.
    pub fn new() -> Self {
        let couch = Self {
            inner: Arc::new(Inner::default()),
        };
        couch.set_password(ADMIN_USER, ADMIN_PASSWORD);
        couch
    }

    fn auth(&self) -> MutexGuard<'_, AuthState> {
        self.inner.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dbs(&self) -> MutexGuard<'_, HashMap<String, Database>> {
        self.inner.dbs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update a user.
    pub fn set_password(&self, user: &str, password: &str) {
        self.auth().users.insert(user.to_string(), password.to_string());
    }

    /// Forget every issued session token, as if they had all timed out.
    pub fn expire_sessions(&self) {
        self.auth().sessions.clear();
    }

    /// Number of successful `POST /_session` calls so far.
    pub fn login_count(&self) -> usize {
        self.inner.logins.load(Ordering::SeqCst)
    }

    /// Number of `POST /_session` calls so far, including rejected ones.
    pub fn login_attempts(&self) -> usize {
        self.inner.login_attempts.load(Ordering::SeqCst)
    }

    /// Hold every `POST /_session` for `delay` before answering.
    pub fn set_login_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.login_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Report `name` from `GET /_session` regardless of who logged in.
    pub fn impersonate(&self, name: Option<&str>) {
        self.auth().impersonate = name.map(str::to_string);
    }

    /// Reject every request to `db` with 401, even with valid credentials.
    pub fn lock_database(&self, db: &str) {
        self.auth().locked.insert(db.to_string());
    }

    pub fn create_database(&self, db: &str) -> bool {
        let mut dbs = self.dbs();
        if dbs.contains_key(db) {
            return false;
        }
        dbs.insert(db.to_string(), Database::default());
        true
    }

    /// Store `body` as the next revision of `id`, creating the database if
    /// needed. Returns the new revision.
    pub fn put_document(&self, db: &str, id: &str, body: Value) -> String {
        let mut dbs = self.dbs();
        let database = dbs.entry(db.to_string()).or_default();
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        database.write(id, body, false)
    }

    pub fn delete_document(&self, db: &str, id: &str) -> Option<String> {
        let mut dbs = self.dbs();
        let database = dbs.get_mut(db)?;
        database.docs.get(id).filter(|d| !d.deleted)?;
        Some(database.write(id, Map::new(), true))
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<String> {
        let auth = self.auth();
        if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            let (user, password) = basic_credentials(value)?;
            return (auth.users.get(&user) == Some(&password)).then_some(user);
        }
        let token = session_cookie(headers)?;
        auth.sessions.get(&token).cloned()
    }

    fn require_user(&self, headers: &HeaderMap, db: &str) -> Result<String, Response> {
        if self.auth().locked.contains(db) {
            return Err(couch_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "You are not authorized to access this db.",
            ));
        }
        self.user_for(headers).ok_or_else(|| {
            couch_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "You are not authorized to access this db.",
            )
        })
    }
}

impl Database {
    fn write(&mut self, id: &str, mut body: Map<String, Value>, deleted: bool) -> String {
        let generation = self
            .docs
            .get(id)
            .and_then(|d| d.rev.split_once('-'))
            .and_then(|(n, _)| n.parse::<u64>().ok())
            .unwrap_or(0);
        let rev = format!("{}-{}", generation + 1, Uuid::new_v4().simple());
        body.remove("_id");
        body.remove("_rev");

        self.update_seq += 1;
        self.changes.retain(|_, doc| doc != id);
        self.changes.insert(self.update_seq, id.to_string());
        self.docs.insert(
            id.to_string(),
            Doc {
                rev: rev.clone(),
                body,
                deleted,
            },
        );
        rev
    }

    fn doc_json(&self, id: &str) -> Option<Value> {
        let doc = self.docs.get(id)?;
        let mut body = doc.body.clone();
        body.insert("_id".into(), json!(id));
        body.insert("_rev".into(), json!(doc.rev));
        if doc.deleted {
            body.insert("_deleted".into(), json!(true));
        }
        Some(Value::Object(body))
    }

    fn doc_count(&self) -> usize {
        self.docs.values().filter(|d| !d.deleted).count()
    }
}

pub fn app() -> Router {
    app_with(Couch::new())
}

pub fn app_with(couch: Couch) -> Router {
    Router::new()
        .route("/_session", get(get_session).post(post_session).delete(delete_session))
        .route("/_echo", any(echo))
        .route("/_slow", get(slow))
        .route("/{db}", get(db_info).put(create_db))
        .route("/{db}/_changes", get(changes))
        .route("/{db}/{doc}", get(get_doc).put(put_doc).delete(delete_doc))
        .with_state(couch)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    serve(listener, Couch::new()).await
}

pub async fn serve(listener: TcpListener, couch: Couch) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(couch)).await
}

/// Run `couch` on an ephemeral local port in a background thread.
pub fn spawn(couch: Couch) -> Result<SocketAddr, std::io::Error> {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = std_listener.local_addr()?;
    std_listener.set_nonblocking(true)?;
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    std::thread::spawn(move || {
        let result = rt.block_on(async {
            let listener = TcpListener::from_std(std_listener)?;
            serve(listener, couch).await
        });
        if let Err(e) = result {
            eprintln!("mock server stopped: {e}");
        }
    });
    Ok(addr)
}

fn couch_error(status: StatusCode, error: &str, reason: &str) -> Response {
    (status, Json(json!({ "error": error, "reason": reason }))).into_response()
}

fn not_found(reason: &str) -> Response {
    couch_error(StatusCode::NOT_FOUND, "not_found", reason)
}

fn basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn roles_for(user: &str) -> Vec<String> {
    if user == ADMIN_USER {
        vec!["_admin".to_string()]
    } else {
        Vec::new()
    }
}

fn etag(rev: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("\"{rev}\"")).unwrap_or_else(|_| HeaderValue::from_static("\"\""))
}

fn seq_id(seq: u64) -> String {
    format!("{seq}-g1AAAAB")
}

fn parse_seq(since: &str) -> u64 {
    if since == "now" {
        return u64::MAX;
    }
    since.split('-').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

async fn post_session(State(couch): State<Couch>, Json(login): Json<Login>) -> Response {
    couch.inner.login_attempts.fetch_add(1, Ordering::SeqCst);
    let delay = couch.inner.login_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let known = couch.auth().users.get(&login.name) == Some(&login.password);
    if !known {
        return couch_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Name or password is incorrect.",
        );
    }

    let token = Uuid::new_v4().simple().to_string();
    couch.auth().sessions.insert(token.clone(), login.name.clone());
    couch.inner.logins.fetch_add(1, Ordering::SeqCst);

    let cookie = format!("{SESSION_COOKIE}={token}; Version=1; Path=/; HttpOnly");
    let body = json!({ "ok": true, "name": login.name, "roles": roles_for(&login.name) });
    ([(header::SET_COOKIE, cookie)], Json(body)).into_response()
}

async fn get_session(State(couch): State<Couch>, headers: HeaderMap) -> Response {
    let user = couch.user_for(&headers);
    let name = match (&user, couch.auth().impersonate.clone()) {
        (Some(_), Some(other)) => Some(other),
        (user, _) => user.clone(),
    };
    let roles = user.as_deref().map(roles_for).unwrap_or_default();
    let ctx = UserCtx { name, roles };
    Json(json!({ "ok": true, "userCtx": ctx })).into_response()
}

async fn delete_session(State(couch): State<Couch>, headers: HeaderMap) -> Response {
    if let Some(token) = session_cookie(&headers) {
        couch.auth().sessions.remove(&token);
    }
    let cookie = format!("{SESSION_COOKIE}=; Version=1; Path=/; HttpOnly");
    ([(header::SET_COOKIE, cookie)], Json(json!({ "ok": true }))).into_response()
}

async fn echo(method: Method, RawQuery(query): RawQuery, headers: HeaderMap, body: String) -> Json<Value> {
    let mut seen = Map::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        seen.insert(name.as_str().to_string(), json!(values.join(", ")));
    }
    Json(json!({
        "method": method.as_str(),
        "query": query.unwrap_or_default(),
        "headers": seen,
        "body": body,
    }))
}

/// Waits `ms` before answering. With `stage=body` the headers and the start
/// of the body go out at once and the wait happens mid-body.
async fn slow(Query(params): Query<HashMap<String, String>>) -> Response {
    let ms = params.get("ms").and_then(|v| v.parse().ok()).unwrap_or(1_000);
    let hold = Duration::from_millis(ms);
    if params.get("stage").is_some_and(|v| v == "body") {
        return held_body(vec![r#"{"ok":"#.to_string()], "true}".to_string(), hold);
    }
    tokio::time::sleep(hold).await;
    Json(json!({ "ok": true })).into_response()
}

async fn db_info(State(couch): State<Couch>, Path(db): Path<String>, headers: HeaderMap) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    let dbs = couch.dbs();
    match dbs.get(&db) {
        Some(database) => Json(json!({
            "db_name": db,
            "doc_count": database.doc_count(),
            "update_seq": seq_id(database.update_seq),
        }))
        .into_response(),
        None => not_found("Database does not exist."),
    }
}

async fn create_db(State(couch): State<Couch>, Path(db): Path<String>, headers: HeaderMap) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    if !couch.create_database(&db) {
        return couch_error(
            StatusCode::PRECONDITION_FAILED,
            "file_exists",
            "The database could not be created, the file already exists.",
        );
    }
    (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response()
}

async fn get_doc(
    State(couch): State<Couch>,
    Path((db, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    let dbs = couch.dbs();
    let Some(database) = dbs.get(&db) else {
        return not_found("Database does not exist.");
    };
    let Some(doc) = database.docs.get(&id) else {
        return not_found("missing");
    };
    if doc.deleted {
        return not_found("deleted");
    }

    let tag = etag(&doc.rev);
    if headers.get(header::IF_NONE_MATCH) == Some(&tag) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, tag)]).into_response();
    }
    let body = database.doc_json(&id).unwrap_or(Value::Null);
    ([(header::ETAG, tag)], Json(body)).into_response()
}

async fn put_doc(
    State(couch): State<Couch>,
    Path((db, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    let Value::Object(body) = body else {
        return couch_error(StatusCode::BAD_REQUEST, "bad_request", "Document must be a JSON object.");
    };
    let mut dbs = couch.dbs();
    let Some(database) = dbs.get_mut(&db) else {
        return not_found("Database does not exist.");
    };

    let current = database.docs.get(&id).filter(|d| !d.deleted).map(|d| d.rev.clone());
    let given = body.get("_rev").and_then(Value::as_str).map(str::to_string);
    if current != given {
        return couch_error(StatusCode::CONFLICT, "conflict", "Document update conflict.");
    }

    let rev = database.write(&id, body, false);
    (
        StatusCode::CREATED,
        [(header::ETAG, etag(&rev))],
        Json(json!({ "ok": true, "id": id, "rev": rev })),
    )
        .into_response()
}

async fn delete_doc(
    State(couch): State<Couch>,
    Path((db, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    let mut dbs = couch.dbs();
    let Some(database) = dbs.get_mut(&db) else {
        return not_found("Database does not exist.");
    };
    let Some(current) = database.docs.get(&id).filter(|d| !d.deleted).map(|d| d.rev.clone()) else {
        return not_found("missing");
    };
    if params.get("rev") != Some(&current) {
        return couch_error(StatusCode::CONFLICT, "conflict", "Document update conflict.");
    }
    let rev = database.write(&id, Map::new(), true);
    Json(json!({ "ok": true, "id": id, "rev": rev })).into_response()
}

async fn changes(
    State(couch): State<Couch>,
    Path(db): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = couch.require_user(&headers, &db) {
        return denied;
    }
    let dbs = couch.dbs();
    let Some(database) = dbs.get(&db) else {
        return not_found("Database does not exist.");
    };

    let since = params.get("since").map(|s| parse_seq(s)).unwrap_or(0);
    let limit = params.get("limit").and_then(|v| v.parse::<usize>().ok());
    let include_docs = params.get("include_docs").is_some_and(|v| v == "true");
    let feed = params.get("feed").map(String::as_str).unwrap_or("normal");

    let matching: Vec<(u64, &String)> = database.changes.range(since.saturating_add(1)..).map(|(s, id)| (*s, id)).collect();
    let taken = limit.unwrap_or(matching.len()).min(matching.len());
    let pending = matching.len() - taken;
    let last_seq = matching[..taken]
        .last()
        .map(|(s, _)| *s)
        .unwrap_or(since.min(database.update_seq));

    let rows: Vec<Value> = matching[..taken]
        .iter()
        .filter_map(|(seq, id)| {
            let doc = database.docs.get(*id)?;
            let mut row = json!({
                "seq": seq_id(*seq),
                "id": id,
                "changes": [{ "rev": doc.rev }],
            });
            if doc.deleted {
                row["deleted"] = json!(true);
            }
            if include_docs {
                row["doc"] = database.doc_json(id).unwrap_or(Value::Null);
            }
            Some(row)
        })
        .collect();

    match feed {
        "continuous" => {
            let mut lines = Vec::with_capacity(rows.len() + 2);
            for (i, row) in rows.iter().enumerate() {
                lines.push(format!("{row}\n"));
                if i == 0 && params.contains_key("heartbeat") {
                    lines.push("\n".to_string());
                }
            }
            let summary = format!("{}\n", json!({ "last_seq": seq_id(last_seq), "pending": pending }));
            match params.get("timeout").and_then(|v| v.parse::<u64>().ok()) {
                Some(millis) => held_body(lines, summary, Duration::from_millis(millis)),
                None => {
                    lines.push(summary);
                    ([(header::CONTENT_TYPE, "application/json")], lines.concat()).into_response()
                }
            }
        }
        "normal" | "longpoll" => Json(json!({
            "results": rows,
            "last_seq": seq_id(last_seq),
            "pending": pending,
        }))
        .into_response(),
        other => couch_error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            &format!("Supported `feed` types: normal, continuous, longpoll; got {other}"),
        ),
    }
}

/// JSON body whose `head` chunks go out straight away, followed by `tail`
/// after `hold` of silence, like a feed waiting for new changes.
fn held_body(head: Vec<String>, tail: String, hold: Duration) -> Response {
    let (tx, rx) = mpsc::channel(head.len() + 1);
    tokio::spawn(async move {
        for chunk in head {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
        tokio::time::sleep(hold).await;
        let _ = tx.send(tail).await;
    });
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(Chunks(rx)),
    )
        .into_response()
}

/// Body chunks fed from a channel.
struct Chunks(mpsc::Receiver<String>);

impl Stream for Chunks {
    type Item = Result<String, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx).map(|line| line.map(Ok))
    }
}
