//! Authenticated request pipeline
//!
//! Every API call goes through `ApiClient::send`:
//! 1. Read the access token from the store (never cached between calls)
//! 2. Dispatch with `Authorization: Bearer <token>` if one exists
//! 3. On 401 with a refresh token stored, capture the request as a
//!    `PendingRequest`, wait for the shared refresh and replay it once
//! 4. A replay that is rejected again is `AuthenticationRequired`; there is
//!    no third attempt
//!
//! Transport failures are returned as-is and never trigger a refresh.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use kms_auth::Authority;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::refresh::RefreshCoordinator;
use crate::state::SessionState;

/// Header carrying the per-call request id.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// A fully materialized API request: method, path relative to the API root,
/// headers and body.
///
/// Holding the body as `Bytes` keeps the request re-dispatchable.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a header. Invalid names or values are rejected.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::InvalidRequest(format!("cannot serialize body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Raw body bytes.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Immutable copy of a request that was rejected with 401, waiting for a
/// refreshed token. Consumed by exactly one replay.
#[derive(Debug)]
pub struct PendingRequest {
    request: ApiRequest,
}

impl PendingRequest {
    /// Capture `request` for replay, dropping any Authorization header.
    pub fn capture(mut request: ApiRequest) -> Self {
        request.headers.remove(AUTHORIZATION);
        Self { request }
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    fn into_request(self) -> ApiRequest {
        self.request
    }
}

/// The authenticated client handed to every API consumer.
///
/// Cheap to clone; clones share the session and the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    authority: Authority,
    session: Arc<SessionState>,
    coordinator: RefreshCoordinator,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        authority: Authority,
        session: Arc<SessionState>,
        coordinator: RefreshCoordinator,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            authority,
            session,
            coordinator,
            timeout,
        }
    }

    /// Send a request with the current bearer token, refreshing and
    /// replaying once on 401.
    ///
    /// Returns the response for any status except a 401 that survived a
    /// refresh. A 401 with no refresh token stored is returned as-is.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<reqwest::Response> {
        let access = self
            .session
            .store()
            .get()
            .await
            .map(|pair| pair.access_token);

        let response = self.dispatch(&request, access.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let has_refresh = self
            .session
            .store()
            .get()
            .await
            .is_some_and(|pair| pair.has_refresh_token());
        if !has_refresh {
            debug!("401 with no refresh token stored, returning response");
            return Ok(response);
        }

        let pending = PendingRequest::capture(request);
        let stale = access.as_ref().map(|token| token.expose().as_str());
        let pair = match self.coordinator.refresh_after(stale).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "refresh failed, request not replayed");
                return Err(Error::AuthenticationRequired(e.to_string()));
            }
        };

        debug!("replaying request with refreshed token");
        let replay = match self
            .dispatch(&pending.into_request(), Some(&pair.access_token))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::record_replay("error");
                return Err(e);
            }
        };

        if replay.status() == StatusCode::UNAUTHORIZED {
            warn!("replayed request rejected again, giving up");
            metrics::record_replay("unauthorized");
            return Err(Error::AuthenticationRequired(
                "request rejected after token refresh".into(),
            ));
        }
        metrics::record_replay("ok");
        Ok(replay)
    }

    /// Send a request and decode a 2xx JSON body.
    ///
    /// 401 → `AuthenticationRequired`; other non-2xx statuses map onto the
    /// authority error taxonomy.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| kms_auth::Error::from_reqwest("response read failed", e))?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthenticationRequired(kms_auth::error::detail(
                &String::from_utf8_lossy(&body),
            )));
        }
        if !status.is_success() {
            return Err(kms_auth::Error::from_status(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            )
            .into());
        }

        serde_json::from_slice(&body)
            .map_err(|e| kms_auth::Error::Decode(format!("{e}")).into())
    }

    /// `GET path` decoded as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    /// Build and dispatch one attempt. The bearer token, if any, replaces
    /// whatever Authorization header the request carried.
    async fn dispatch(
        &self,
        request: &ApiRequest,
        access: Option<&Secret<String>>,
    ) -> Result<reqwest::Response> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

        let mut headers = request.headers.clone();
        headers.remove(AUTHORIZATION);
        if let Some(token) = access {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|e| Error::InvalidRequest(format!("access token is not a valid header value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        let mut builder = self
            .http
            .request(request.method.clone(), self.authority.url(&request.path))
            .headers(headers)
            .timeout(self.timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(%request_id, error = %e, "request failed");
            kms_auth::Error::from_reqwest("request failed", e)
        })?;

        let status = response.status();
        debug!(%request_id, %status, authenticated = access.is_some(), "received response");
        metrics::record_request(status.as_u16());
        Ok(response)
    }
}
