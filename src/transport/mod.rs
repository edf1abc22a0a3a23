//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! ResilientClient / ClockSynchronizer
//!     → Dispatch::dispatch(ApiRequest)
//!         → http.rs (reqwest: URL join, identity header, Retry-After / Date parsing)
//!         or dispatch_fn (caller-supplied closure, used by tests and embedders)
//!     → ApiResponse
//!     → StatusClass (success / 5xx / 429 / other 4xx)
//!     → FlowError classification via ApiResponse::into_result
//! ```
//!
//! # Design Decisions
//! - `dispatch` returns `Err` only when no response arrived at all (connect
//!   failure, timeout); every HTTP status is an `Ok` response and is classified
//!   afterwards, so the clock probe can read the Date of any response
//! - A response with no status (status 0) is a transient failure

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};

pub use http::HttpDispatcher;

/// Header carrying the identity whose quota a request consumes.
pub const IDENTITY_HEADER: &str = "x-identity";

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest body excerpt carried in an error message.
const ERROR_BODY_LIMIT: usize = 256;

/// HTTP method subset used against the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub id: Uuid,
    pub method: Method,
    /// Path relative to the configured base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Identity whose bucket this request draws from. `None` for public data.
    pub identity: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            query: Vec::new(),
            identity: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::Head, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Same request under a fresh id, for a new attempt.
    pub fn reissue(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// Outcome classes that drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 5xx, or no status at all.
    ServerError,
    /// 429.
    RateLimited,
    /// Any other 4xx. Unexpected 1xx/3xx land here too.
    ClientError,
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            429 => StatusClass::RateLimited,
            0 | 500..=599 => StatusClass::ServerError,
            _ => StatusClass::ClientError,
        }
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After`, relative to receipt.
    pub retry_after: Option<Duration>,
    /// Parsed `Date` (second precision).
    pub server_date: Option<DateTime<Utc>>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            server_date: None,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_server_date(mut self, date: DateTime<Utc>) -> Self {
        self.server_date = Some(date);
        self
    }

    pub fn status_class(&self) -> StatusClass {
        StatusClass::from_status(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.status_class() == StatusClass::Success
    }

    /// Keep a success, turn anything else into its classified error.
    pub fn into_result(self) -> FlowResult<ApiResponse> {
        match self.status_class() {
            StatusClass::Success => Ok(self),
            StatusClass::RateLimited => Err(FlowError::RemoteRateLimited {
                retry_after: self.retry_after,
            }),
            StatusClass::ServerError => Err(FlowError::TransientRemoteFailure {
                status: self.status,
                message: excerpt(&self.body),
                retry_after: self.retry_after,
            }),
            StatusClass::ClientError => Err(FlowError::NonRetryableRemoteFailure {
                status: self.status,
                message: excerpt(&self.body),
            }),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> FlowResult<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| FlowError::Transport(format!("Invalid response body: {}", e)))
    }
}

fn excerpt(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_LIMIT {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        cut.push('…');
        cut
    }
}

/// Sends one request and returns whatever response came back.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// `Err` only when no response was received.
    async fn dispatch(&self, request: ApiRequest) -> FlowResult<ApiResponse>;
}

/// [`Dispatch`] backed by a closure.
pub struct FnDispatch<F> {
    f: F,
}

/// Wrap `f` as a dispatcher.
pub fn dispatch_fn<F, Fut>(f: F) -> FnDispatch<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = FlowResult<ApiResponse>> + Send + 'static,
{
    FnDispatch { f }
}

#[async_trait]
impl<F, Fut> Dispatch for FnDispatch<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = FlowResult<ApiResponse>> + Send + 'static,
{
    async fn dispatch(&self, request: ApiRequest) -> FlowResult<ApiResponse> {
        (self.f)(request).await
    }
}
