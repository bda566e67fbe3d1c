//! Request client for the mentor-matching backend.
//!
//! Every call returns an [`ApiResponse`] instead of failing on HTTP error
//! statuses. A response with status 0 means no HTTP response arrived at all.

use crate::cache::ResponseCache;
use crate::profile::{CreateProfileRequest, Profile, UpdateProfileRequest};
use crate::search::{SearchFilters, CACHE_PREFIX};
use crate::storage::{AuthStorage, AuthUser, Role, Session};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status reported when the request never got an HTTP response
pub const NETWORK_ERROR_STATUS: u16 = 0;

const PROFILE_CACHE_KEY: &str = "profile";

/// Error body sent by the backend (`{error, message?}`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    fn new(error: &str, message: Option<String>) -> Self {
        Self {
            error: error.to_string(),
            message,
        }
    }
}

/// Uniform result of a backend call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub status: u16,
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(status: u16, data: T) -> Self {
        Self {
            data: Some(data),
            status,
            error: None,
        }
    }

    pub fn failed(status: u16, error: ErrorBody) -> Self {
        Self {
            data: None,
            status,
            error: Some(error),
        }
    }

    pub fn network_error(cause: &str) -> Self {
        Self::failed(
            NETWORK_ERROR_STATUS,
            ErrorBody::new("Network Error", Some(cause.to_string())),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }

    pub fn is_network_error(&self) -> bool {
        self.status == NETWORK_ERROR_STATUS
    }

    /// The backend's message, or `fallback` when it sent none
    pub fn error_message(&self, fallback: &str) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Keep status and error, dropping any payload
    pub fn discard<U>(self) -> ApiResponse<U> {
        ApiResponse {
            data: None,
            status: self.status,
            error: self.error,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            data: self.data.map(f),
            status: self.status,
            error: self.error,
        }
    }
}

impl ApiResponse<Value> {
    /// Decode a successful JSON payload into `T`; failures keep their status and error
    pub fn decode<T: DeserializeOwned>(self) -> ApiResponse<T> {
        if !self.is_success() {
            return self.discard();
        }
        let data = self.data.unwrap_or(Value::Null);
        match serde_json::from_value(data) {
            Ok(value) => ApiResponse::ok(self.status, value),
            Err(e) => ApiResponse::failed(
                self.status,
                ErrorBody::new("Invalid Response", Some(e.to_string())),
            ),
        }
    }
}

/// Sign-in method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Email,
    Google,
    Apple,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Google => "google",
            Self::Apple => "apple",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `200` body of the verify and OAuth endpoints
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthResponse {
    pub user: AuthUser,
    pub token: String,
}

impl AuthResponse {
    pub fn into_session(self) -> Session {
        Session {
            user: self.user,
            token: self.token,
        }
    }
}

/// `202` body: the account does not exist yet and needs a role
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewUserResponse {
    #[serde(default)]
    pub is_new_user: bool,
    pub email: String,
    pub provider: Provider,
    #[serde(default)]
    pub temp_token: Option<String>,
}

/// The two verification outcomes the backend distinguishes by status
#[derive(Debug, Clone, PartialEq)]
pub enum AuthReply {
    Authenticated(AuthResponse),
    NewUser(NewUserResponse),
}

/// Sort a verify/OAuth response into its outcome by status code
pub fn classify_auth_reply(resp: ApiResponse<Value>) -> ApiResponse<AuthReply> {
    match resp.status {
        200 => resp.decode::<AuthResponse>().map(AuthReply::Authenticated),
        202 => resp.decode::<NewUserResponse>().map(AuthReply::NewUser),
        status if resp.is_success() => ApiResponse::failed(
            status,
            ErrorBody::new(
                "Unexpected Status",
                Some(format!("Unexpected response status {}", status)),
            ),
        ),
        _ => resp.discard(),
    }
}

/// Turn a raw HTTP outcome into the uniform shape
pub fn normalize(status: u16, body: &str) -> ApiResponse<Value> {
    let parsed: Result<Value, _> = if body.trim().is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_str(body)
    };

    if (200..300).contains(&status) {
        return match parsed {
            Ok(data) => ApiResponse::ok(status, data),
            Err(e) => ApiResponse::failed(
                status,
                ErrorBody::new("Invalid Response", Some(e.to_string())),
            ),
        };
    }

    let error = parsed
        .ok()
        .and_then(|v| serde_json::from_value::<ErrorBody>(v).ok())
        .unwrap_or_else(|| ErrorBody::new("API request failed", None));
    ApiResponse::failed(status, error)
}

/// Request payload for `POST /auth/email/verify`
#[derive(Debug, Serialize)]
struct VerifyCodeRequest<'a> {
    email: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
}

/// Request payload for `POST /auth/oauth/login`
#[derive(Debug, Serialize)]
struct OAuthLoginRequest<'a> {
    provider: Provider,
    id_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// One completed request, reported to the observer
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
}

type RequestObserver = Box<dyn Fn(&RequestRecord) + Send + Sync>;

type RawResponse = ApiResponse<Value>;

/// Backend client: bearer attachment, response normalisation and caching
pub struct ApiClient {
    base_url: String,
    prefix: String,
    agent: ureq::Agent,
    storage: Arc<AuthStorage>,
    cache: ResponseCache<RawResponse, RawResponse>,
    use_cache: bool,
    trace: bool,
    observer: Option<RequestObserver>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        prefix: &str,
        timeout: Duration,
        storage: Arc<AuthStorage>,
        cache: ResponseCache<RawResponse, RawResponse>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            prefix: format!("/{}", prefix.trim_matches('/')),
            agent,
            storage,
            cache,
            use_cache: true,
            trace: false,
            observer: None,
        }
    }

    /// Disable response caching; deduplication stays on
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Called after every request with its status and timing
    pub fn with_observer(mut self, observer: impl Fn(&RequestRecord) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cache(&self) -> &ResponseCache<RawResponse, RawResponse> {
        &self.cache
    }

    /// Drop every cached response (e.g. after logout)
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.prefix, path)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> RawResponse {
        self.send(method, &self.url(path), path, query, body)
    }

    fn send(
        &self,
        method: Method,
        url: &str,
        label: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> RawResponse {
        let started = Instant::now();

        let mut req = self
            .agent
            .request(method.as_str(), url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(token) = self.storage.token() {
            req = req.set("Authorization", &format!("Bearer {}", token));
        }
        for (key, value) in query {
            req = req.query(key, value);
        }

        let result = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        };

        let response = match result {
            Ok(r) => {
                let status = r.status();
                match r.into_string() {
                    Ok(text) => normalize(status, &text),
                    Err(e) => ApiResponse::network_error(&e.to_string()),
                }
            }
            Err(ureq::Error::Status(status, r)) => {
                let text = r.into_string().unwrap_or_default();
                normalize(status, &text)
            }
            Err(e) => ApiResponse::network_error(&e.to_string()),
        };

        let record = RequestRecord {
            method: method.as_str(),
            path: label.to_string(),
            status: response.status,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if self.trace {
            eprintln!(
                "[TRACE:HTTP] {} {} -> {} ({}ms)",
                record.method, record.path, record.status, record.duration_ms
            );
        }
        if let Some(observer) = &self.observer {
            observer(&record);
        }

        response
    }

    /// Run `producer` through the cache; non-2xx results are never stored
    fn cached(&self, key: &str, use_cache: bool, producer: impl FnOnce() -> RawResponse) -> RawResponse {
        let before = self.cache.stats();
        let outcome = self.cache.fetch(key, use_cache, || {
            let resp = producer();
            if resp.is_success() {
                Ok(resp)
            } else {
                Err(resp)
            }
        });
        if self.trace {
            let after = self.cache.stats();
            let how = if after.hits > before.hits {
                "hit"
            } else if after.joins > before.joins {
                "joined in-flight"
            } else {
                "miss"
            };
            eprintln!("[TRACE:CACHE] {} {}", key, how);
        }
        match outcome {
            Ok(resp) | Err(resp) => resp,
        }
    }

    fn invalidate_profile_reads(&self) {
        self.cache.invalidate(PROFILE_CACHE_KEY);
        self.cache.invalidate_prefix(CACHE_PREFIX);
    }

    pub fn send_verification_code(&self, email: &str) -> ApiResponse<Value> {
        self.request(
            Method::Post,
            "/auth/email/send-code",
            &[],
            Some(json!({ "email": email })),
        )
    }

    pub fn verify_code(&self, email: &str, code: &str, role: Option<Role>) -> ApiResponse<AuthReply> {
        let body = VerifyCodeRequest { email, code, role };
        let resp = match serde_json::to_value(&body) {
            Ok(body) => self.request(Method::Post, "/auth/email/verify", &[], Some(body)),
            Err(e) => ApiResponse::failed(
                NETWORK_ERROR_STATUS,
                ErrorBody::new("Encoding Error", Some(e.to_string())),
            ),
        };
        classify_auth_reply(resp)
    }

    pub fn oauth_login(
        &self,
        provider: Provider,
        id_token: &str,
        role: Option<Role>,
    ) -> ApiResponse<AuthReply> {
        let body = OAuthLoginRequest {
            provider,
            id_token,
            role,
        };
        let resp = match serde_json::to_value(&body) {
            Ok(body) => self.request(Method::Post, "/auth/oauth/login", &[], Some(body)),
            Err(e) => ApiResponse::failed(
                NETWORK_ERROR_STATUS,
                ErrorBody::new("Encoding Error", Some(e.to_string())),
            ),
        };
        classify_auth_reply(resp)
    }

    /// Current user's profile. Deduplicated, never cached.
    pub fn get_profile(&self) -> ApiResponse<Profile> {
        self.cached(PROFILE_CACHE_KEY, false, || {
            self.request(Method::Get, "/profiles", &[], None)
        })
        .decode()
    }

    pub fn create_profile(&self, profile: &CreateProfileRequest) -> ApiResponse<Profile> {
        let resp = match serde_json::to_value(profile) {
            Ok(body) => self.request(Method::Post, "/profiles", &[], Some(body)),
            Err(e) => ApiResponse::failed(
                NETWORK_ERROR_STATUS,
                ErrorBody::new("Encoding Error", Some(e.to_string())),
            ),
        };
        self.invalidate_profile_reads();
        resp.decode()
    }

    pub fn update_profile(&self, update: &UpdateProfileRequest) -> ApiResponse<Profile> {
        let resp = match serde_json::to_value(update) {
            Ok(body) => self.request(Method::Put, "/profiles", &[], Some(body)),
            Err(e) => ApiResponse::failed(
                NETWORK_ERROR_STATUS,
                ErrorBody::new("Encoding Error", Some(e.to_string())),
            ),
        };
        self.invalidate_profile_reads();
        resp.decode()
    }

    pub fn delete_profile(&self) -> ApiResponse<Value> {
        let resp = self.request(Method::Delete, "/profiles", &[], None);
        self.invalidate_profile_reads();
        resp
    }

    /// Public profiles matching `filters`, cached under the filter fingerprint
    pub fn search_profiles(&self, filters: &SearchFilters) -> ApiResponse<Vec<Profile>> {
        let query = filters.query_pairs();
        self.cached(&filters.fingerprint(), self.use_cache, || {
            self.request(Method::Get, "/profiles/public", &query, None)
        })
        .decode()
    }

    /// `GET /health`, served outside the API prefix
    pub fn health_check(&self) -> ApiResponse<Value> {
        let url = format!("{}/health", self.base_url);
        self.send(Method::Get, &url, "/health", &[], None)
    }
}
