//! Shared test doubles and fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::Method;

use crate::crypto::{normalize, PrivateKeySource};
use crate::github::app_jwt::AppIdentity;
use crate::github::clock::Clock;
use crate::github::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};

pub const APP_KEY_PKCS1_PEM: &str = include_str!("../tests/fixtures/app-key-pkcs1.pem");
pub const APP_KEY_PKCS8_PEM: &str = include_str!("../tests/fixtures/app-key-pkcs8.pem");
pub const OTHER_KEY_PKCS1_PEM: &str = include_str!("../tests/fixtures/other-key-pkcs1.pem");

pub const APP_ID: &str = "2244732";
pub const API: &str = "https://api.github.com";

pub fn app_identity() -> AppIdentity {
    let key = normalize(&PrivateKeySource::from_pem(APP_KEY_PKCS1_PEM).unwrap()).unwrap();
    AppIdentity::new(APP_ID, key)
}

/// 2024-05-01T12:00:00Z
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Clone)]
enum Reply {
    Response(ApiResponse),
    Error(TransportError),
}

/// Scripted transport that counts every request.
///
/// Replies are queued per `METHOD url`. The last queued reply for a route
/// repeats once the queue is down to one entry. Unknown routes get a 404.
#[derive(Default)]
pub struct StubTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
    delay: Option<Duration>,
    clock_step: Option<(Arc<ManualClock>, chrono::Duration)>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Move `clock` forward by `step` on every request.
    pub fn advancing(mut self, clock: Arc<ManualClock>, step: chrono::Duration) -> Self {
        self.clock_step = Some((clock, step));
        self
    }

    fn push(&self, method: Method, url: &str, reply: Reply) {
        self.routes
            .lock()
            .entry(route_key(&method, url))
            .or_default()
            .push_back(reply);
    }

    pub fn reply(&self, method: Method, url: &str, response: ApiResponse) {
        self.push(method, url, Reply::Response(response));
    }

    pub fn reply_json(&self, method: Method, url: &str, status: u16, body: serde_json::Value) {
        self.reply(method, url, ApiResponse::new(status, body.to_string()));
    }

    pub fn fail(&self, method: Method, url: &str, error: TransportError) {
        self.push(method, url, Reply::Error(error));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn calls_to(&self, method: Method, url: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method && request.url == url)
            .count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }
}

fn route_key(method: &Method, url: &str) -> String {
    format!("{} {}", method, url)
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let key = route_key(&request.method, &request.url);
        self.requests.lock().push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((clock, step)) = &self.clock_step {
            clock.advance(*step);
        }

        let reply = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Error(error)) => Err(error),
            None => Ok(ApiResponse::new(
                404,
                format!(r#"{{"message":"no stub for {}"}}"#, key),
            )),
        }
    }
}

/// Access token response body as GitHub returns it.
pub fn token_body(token: &str, expires_at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "token": token,
        "expires_at": expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "permissions": {"contents": "read", "security_events": "read"},
        "repository_selection": "all"
    })
}

pub fn token_url(installation_id: u64) -> String {
    format!("{}/app/installations/{}/access_tokens", API, installation_id)
}

pub fn installation_json(id: u64, login: &str, account_type: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "account": {"login": login, "id": id * 10, "type": account_type},
        "app_id": 2244732,
        "target_type": account_type
    })
}
