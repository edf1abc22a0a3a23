//! HTTP dispatcher over reqwest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, DATE, RETRY_AFTER};
use std::time::Duration;
use url::Url;

use crate::config::TransportConfig;
use crate::error::{FlowError, FlowResult};
use crate::resilience::timeouts::NO_STATUS;
use crate::transport::{ApiRequest, ApiResponse, Dispatch, Method, IDENTITY_HEADER, REQUEST_ID_HEADER};

/// Dispatches [`ApiRequest`]s to a fixed base URL.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDispatcher {
    pub fn new(config: &TransportConfig) -> FlowResult<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| FlowError::InvalidConfig(format!("transport.base_url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| FlowError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a request path under the base URL, keeping any base path prefix.
    pub fn url_for(&self, request: &ApiRequest) -> FlowResult<Url> {
        let mut url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| FlowError::Transport(format!("Invalid path '{}': {}", request.path, e)))?;

        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, request: ApiRequest) -> FlowResult<ApiResponse> {
        let url = self.url_for(&request)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        tracing::debug!(
            request_id = %request.id,
            method = request.method.as_str(),
            url = %url,
            "Dispatching request"
        );

        let mut builder = self
            .client
            .request(method, url)
            .header(REQUEST_ID_HEADER, request.id.to_string());
        if let Some(identity) = &request.identity {
            builder = builder.header(IDENTITY_HEADER, identity.as_str());
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let retry_after = retry_after_header(response.headers(), Utc::now());
        let server_date = date_header(response.headers());
        let body = response.text().await.map_err(map_reqwest_error)?;

        tracing::debug!(request_id = %request.id, status, "Response received");

        Ok(ApiResponse {
            status,
            retry_after,
            server_date,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FlowError {
    if err.is_builder() || err.is_decode() {
        return FlowError::Transport(err.to_string());
    }
    let message = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    };
    FlowError::TransientRemoteFailure {
        status: NO_STATUS,
        message,
        retry_after: None,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn retry_after_header(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    header_str(headers, RETRY_AFTER).and_then(|v| parse_retry_after(v, now))
}

fn date_header(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    header_str(headers, DATE).and_then(parse_http_date)
}

/// `Retry-After` as delta-seconds or an HTTP-date. A date in the past means "now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = parse_http_date(value)?;
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`) and other RFC 2822 forms.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
