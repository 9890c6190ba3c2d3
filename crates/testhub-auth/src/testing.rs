//! Test doubles for the auth API, the navigator and the HTTP server.
//!
//! Compiled for this crate's tests and, behind the `test-util` feature, for
//! downstream crates that drive a [`crate::SessionManager`] in their own tests.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::api::AuthApi;
use crate::error::AuthError;
use crate::navigator::Navigator;
use crate::session::{Credentials, LoginResponse, RefreshResponse, Registration, UserProfile};
use crate::Result;

/// Unsigned JWT carrying `claims`, good enough for [`crate::expiry_millis`].
pub fn encode_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

/// In-memory auth server. Issues JWT access tokens with a configurable
/// lifetime and tracks which refresh tokens are still valid.
pub struct FakeAuthApi {
    user: Mutex<UserProfile>,
    valid_refresh_tokens: Mutex<HashSet<String>>,
    sequence: AtomicU64,
    access_ttl_secs: AtomicI64,
    refresh_delay: Mutex<Duration>,
    profile_delay: Mutex<Duration>,
    opaque_tokens: AtomicBool,
    rotate_refresh: AtomicBool,
    reject_refresh: AtomicBool,
    reject_profile: AtomicBool,
    fail_logout: AtomicBool,
    transport_failure: AtomicBool,
    login_calls: AtomicUsize,
    register_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    current_user_calls: AtomicUsize,
}

impl FakeAuthApi {
    pub const PASSWORD: &'static str = "correct-horse";
    /// Accepted by a fresh fake, for sessions seeded straight into storage
    pub const INITIAL_REFRESH_TOKEN: &'static str = "refresh-0";

    pub fn new() -> Self {
        let mut user = UserProfile::new(1, "alice");
        user.email = Some("alice@example.com".to_string());

        Self {
            user: Mutex::new(user),
            valid_refresh_tokens: Mutex::new(HashSet::from([
                Self::INITIAL_REFRESH_TOKEN.to_string()
            ])),
            sequence: AtomicU64::new(0),
            access_ttl_secs: AtomicI64::new(30 * 60),
            refresh_delay: Mutex::new(Duration::ZERO),
            profile_delay: Mutex::new(Duration::ZERO),
            opaque_tokens: AtomicBool::new(false),
            rotate_refresh: AtomicBool::new(false),
            reject_refresh: AtomicBool::new(false),
            reject_profile: AtomicBool::new(false),
            fail_logout: AtomicBool::new(false),
            transport_failure: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            current_user_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_access_ttl(&self, ttl: Duration) {
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.access_ttl_secs.store(secs, Ordering::SeqCst);
    }

    /// Hold refresh requests for `delay` before the token is checked.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    /// Hold profile and `me` requests for `delay` before answering.
    pub fn set_profile_delay(&self, delay: Duration) {
        *self.profile_delay.lock() = delay;
    }

    /// Issue access tokens without a readable expiry claim.
    pub fn set_opaque_tokens(&self, opaque: bool) {
        self.opaque_tokens.store(opaque, Ordering::SeqCst);
    }

    pub fn set_rotate_refresh(&self, rotate: bool) {
        self.rotate_refresh.store(rotate, Ordering::SeqCst);
    }

    pub fn set_reject_refresh(&self, reject: bool) {
        self.reject_refresh.store(reject, Ordering::SeqCst);
    }

    pub fn set_reject_profile(&self, reject: bool) {
        self.reject_profile.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    /// Every call fails as if the server were unreachable.
    pub fn set_transport_failure(&self, fail: bool) {
        self.transport_failure.store(fail, Ordering::SeqCst);
    }

    pub fn set_user_email(&self, email: &str) {
        self.user.lock().email = Some(email.to_string());
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn current_user_calls(&self) -> usize {
        self.current_user_calls.load(Ordering::SeqCst)
    }

    /// Count the call and give other tasks a chance to run, as a real
    /// request would.
    async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.transport_failure.load(Ordering::SeqCst) {
            return Err(AuthError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn issue_access(&self) -> String {
        let id = self.next_id();
        if self.opaque_tokens.load(Ordering::SeqCst) {
            return format!("access-{}", id);
        }
        let exp = chrono::Utc::now().timestamp() + self.access_ttl_secs.load(Ordering::SeqCst);
        encode_jwt(&serde_json::json!({ "exp": exp, "jti": id, "user_id": 1 }))
    }

    fn issue_refresh(&self) -> String {
        let token = format!("refresh-{}", self.next_id());
        self.valid_refresh_tokens.lock().insert(token.clone());
        token
    }

    async fn pause(delay: &Mutex<Duration>) {
        let delay = *delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_access(&self, access_token: &str) -> Result<UserProfile> {
        if access_token.is_empty() || self.reject_profile.load(Ordering::SeqCst) {
            return Err(AuthError::Unauthorized);
        }
        Ok(self.user.lock().clone())
    }
}

impl Default for FakeAuthApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse> {
        self.enter(&self.login_calls).await?;

        let user = self.user.lock().clone();
        if credentials.username != user.username || credentials.password != Self::PASSWORD {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(LoginResponse {
            access: self.issue_access(),
            refresh: self.issue_refresh(),
            user,
        })
    }

    async fn register(&self, registration: &Registration) -> Result<UserProfile> {
        self.enter(&self.register_calls).await?;

        if registration.password != registration.password_confirm {
            return Err(AuthError::Rejected(
                r#"{"password_confirm":["Passwords do not match"]}"#.to_string(),
            ));
        }

        let id = i64::try_from(self.next_id()).unwrap_or(i64::MAX);
        let mut user = UserProfile::new(id, registration.username.clone());
        user.email = Some(registration.email.clone());
        Ok(user)
    }

    async fn logout(&self, _access_token: Option<&str>, refresh_token: &str) -> Result<()> {
        self.enter(&self.logout_calls).await?;

        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(AuthError::Server {
                status: 500,
                message: "logout failed".to_string(),
            });
        }
        self.valid_refresh_tokens.lock().remove(refresh_token);
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        self.enter(&self.refresh_calls).await?;
        Self::pause(&self.refresh_delay).await;

        if self.reject_refresh.load(Ordering::SeqCst)
            || !self.valid_refresh_tokens.lock().contains(refresh_token)
        {
            return Err(AuthError::RefreshRejected);
        }

        let refresh = self.rotate_refresh.load(Ordering::SeqCst).then(|| {
            self.valid_refresh_tokens.lock().remove(refresh_token);
            self.issue_refresh()
        });
        Ok(RefreshResponse {
            access: self.issue_access(),
            refresh,
        })
    }

    async fn profile(&self, access_token: &str) -> Result<UserProfile> {
        self.enter(&self.profile_calls).await?;
        Self::pause(&self.profile_delay).await;
        self.check_access(access_token)
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile> {
        self.enter(&self.current_user_calls).await?;
        Self::pause(&self.profile_delay).await;
        self.check_access(access_token)
    }
}

/// Counts redirects to the login surface.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    redirects: AtomicUsize,
}

impl RecordingNavigator {
    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl Navigator for RecordingNavigator {
    fn redirect_to_login(&self) {
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: String,
}

type Routes = HashMap<String, VecDeque<(u16, String)>>;

/// Minimal HTTP/1.1 server answering canned JSON responses.
///
/// Routes are keyed by `"METHOD /path"`. When a route is given several
/// responses they are served in order and the last one repeats.
pub struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl StubServer {
    pub async fn start(routes: Vec<(&str, u16, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub server");
        let addr = listener.local_addr().expect("stub server address");

        let mut table = Routes::new();
        for (route, status, body) in routes {
            table
                .entry(route.to_string())
                .or_default()
                .push_back((status, body.to_string()));
        }
        let routes = Arc::new(Mutex::new(table));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handle = tokio::spawn({
            let requests = requests.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve_connection(socket, routes, requests).await;
                    });
                }
            }
        });

        Self {
            addr,
            requests,
            handle,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    socket: TcpStream,
    routes: Arc<Mutex<Routes>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        let mut authorization = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.parse().unwrap_or(0);
                } else if name.eq_ignore_ascii_case("authorization") {
                    authorization = Some(value.to_string());
                }
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;

        let route = format!("{} {}", method, path);
        requests.lock().push(RecordedRequest {
            method,
            path,
            authorization,
            body: String::from_utf8_lossy(&body).into_owned(),
        });

        let (status, response_body) = {
            let mut routes = routes.lock();
            let next = routes.get_mut(&route).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            next.unwrap_or_else(|| (404, r#"{"detail":"Not found."}"#.to_string()))
        };

        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            reason_phrase(status),
            response_body.len(),
            response_body
        );
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
