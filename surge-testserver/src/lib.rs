use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

pub const PATH_HEALTH: &str = "/health";
pub const PATH_USERS: &str = "/api/users";
pub const PATH_PRODUCTS: &str = "/api/products";
pub const PATH_LOGIN: &str = "/api/auth/login";
pub const PATH_LOGOUT: &str = "/api/auth/logout";
pub const PATH_VERIFY: &str = "/api/auth/verify";
pub const PATH_ECHO: &str = "/echo";
pub const PATH_STATUS: &str = "/status/{code}";

/// Latency the list endpoints simulate.
pub const USERS_DELAY: Duration = Duration::from_millis(50);
pub const PRODUCTS_DELAY: Duration = Duration::from_millis(30);

const CREDENTIALS: [(&str, &str); 3] = [("admin", "admin123"), ("user", "user123"), ("test", "test123")];

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    requests_total: Arc<AtomicU64>,
    logins: Arc<AtomicU64>,
    rejected_auth: Arc<AtomicU64>,
}

impl TestServerStats {
    fn inc_requests_total(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn rejected_auth(&self) -> u64 {
        self.rejected_auth.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
struct AppState {
    stats: TestServerStats,
    next_token: Arc<AtomicU64>,
    // token -> username; revoked tokens are removed.
    sessions: Arc<Mutex<HashMap<String, String>>>,
}

impl AppState {
    fn authenticate(&self, headers: &HeaderMap) -> Result<(String, String), Response> {
        let reject = |message: &str| {
            self.stats.rejected_auth.fetch_add(1, Ordering::Relaxed);
            error_response(StatusCode::UNAUTHORIZED, message)
        };

        let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
            return Err(reject("missing authorization header"));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Err(reject("invalid authorization format"));
        };

        let sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(user) => Ok((token.to_string(), user.clone())),
            None => Err(reject("invalid token")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestServerUrls {
    pub base_url: String,
    pub health: String,
    pub users: String,
    pub products: String,
    pub login: String,
    pub logout: String,
    pub verify: String,
    pub echo: String,
}

impl TestServerUrls {
    pub fn new(base_url: String) -> Self {
        Self {
            health: format!("{base_url}{PATH_HEALTH}"),
            users: format!("{base_url}{PATH_USERS}"),
            products: format!("{base_url}{PATH_PRODUCTS}"),
            login: format!("{base_url}{PATH_LOGIN}"),
            logout: format!("{base_url}{PATH_LOGOUT}"),
            verify: format!("{base_url}{PATH_VERIFY}"),
            echo: format!("{base_url}{PATH_ECHO}"),
            base_url,
        }
    }

    pub fn status(&self, code: u16) -> String {
        format!("{}/status/{code}", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct User {
    id: u32,
    name: &'static str,
    email: &'static str,
}

#[derive(Debug, Serialize)]
struct Product {
    id: u32,
    name: &'static str,
    price: f64,
    stock: u32,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.stats.inc_requests_total();
    Json(json!({ "status": "ok" }))
}

async fn handle_users(State(state): State<AppState>) -> Json<Vec<User>> {
    state.stats.inc_requests_total();
    sleep(USERS_DELAY).await;
    Json(vec![
        User {
            id: 1,
            name: "Mario Rossi",
            email: "mario@example.com",
        },
        User {
            id: 2,
            name: "Laura Bianchi",
            email: "laura@example.com",
        },
        User {
            id: 3,
            name: "Giuseppe Verdi",
            email: "giuseppe@example.com",
        },
    ])
}

async fn handle_products(State(state): State<AppState>) -> Json<Vec<Product>> {
    state.stats.inc_requests_total();
    sleep(PRODUCTS_DELAY).await;
    Json(vec![
        Product {
            id: 1,
            name: "Laptop",
            price: 999.99,
            stock: 15,
        },
        Product {
            id: 2,
            name: "Mouse",
            price: 29.99,
            stock: 100,
        },
        Product {
            id: 3,
            name: "Keyboard",
            price: 79.99,
            stock: 50,
        },
        Product {
            id: 4,
            name: "Monitor",
            price: 299.99,
            stock: 25,
        },
    ])
}

async fn handle_login(State(state): State<AppState>, body: Bytes) -> Response {
    state.stats.inc_requests_total();

    let Ok(req) = serde_json::from_slice::<LoginRequest>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    };
    let known = CREDENTIALS
        .iter()
        .any(|(user, pass)| *user == req.username && *pass == req.password);
    if !known {
        return error_response(StatusCode::UNAUTHORIZED, "invalid credentials");
    }

    let n = state.next_token.fetch_add(1, Ordering::Relaxed);
    let token = format!("tok-{n}-{}", req.username);
    state
        .sessions
        .lock()
        .insert(token.clone(), req.username);
    state.stats.logins.fetch_add(1, Ordering::Relaxed);

    Json(LoginResponse {
        token,
        message: "login successful",
    })
    .into_response()
}

async fn handle_verify(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.stats.inc_requests_total();
    match state.authenticate(&headers) {
        Ok((_, username)) => Json(json!({
            "authenticated": true,
            "username": username,
        }))
        .into_response(),
        Err(res) => res,
    }
}

async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.stats.inc_requests_total();
    match state.authenticate(&headers) {
        Ok((token, _)) => {
            state
                .sessions
                .lock()
                .remove(&token);
            Json(json!({ "message": "logout successful" })).into_response()
        }
        Err(res) => res,
    }
}

async fn handle_echo(State(state): State<AppState>, body: Bytes) -> (StatusCode, Bytes) {
    state.stats.inc_requests_total();
    (StatusCode::OK, body)
}

async fn handle_status(State(state): State<AppState>, Path(code): Path<u16>) -> StatusCode {
    state.stats.inc_requests_total();
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(PATH_HEALTH, get(handle_health))
        .route(PATH_USERS, get(handle_users))
        .route(PATH_PRODUCTS, get(handle_products))
        .route(PATH_LOGIN, post(handle_login))
        .route(PATH_LOGOUT, post(handle_logout))
        .route(PATH_VERIFY, get(handle_verify))
        .route(PATH_ECHO, post(handle_echo))
        .route(PATH_STATUS, get(handle_status))
        .with_state(state)
}

/// In-process target service bound to an ephemeral localhost port.
pub struct TestServer {
    addr: SocketAddr,
    urls: TestServerUrls,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0".parse().map_err(std::io::Error::other)?).await
    }

    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let state = AppState::default();
        let stats = state.stats.clone();
        let app = router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            urls: TestServerUrls::new(format!("http://{addr}")),
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &str {
        &self.urls.base_url
    }

    pub fn urls(&self) -> &TestServerUrls {
        &self.urls
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Waits for Ctrl-C, then shuts down.
    pub async fn serve_until_ctrl_c(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        self.shutdown().await;
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
