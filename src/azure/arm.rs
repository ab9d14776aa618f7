//! Azure Resource Manager transport for scale sets
//!
//! [`ScaleSetApi`] is the seam between the scale-set client and the
//! network: read a scale set, submit an identity patch, and wait for the
//! resulting long-running operation. [`ArmScaleSetApi`] implements it over
//! HTTPS with `reqwest`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::model::{VirtualMachineScaleSet, VirtualMachineScaleSetUpdate};

/// Compute API version the scale-set documents are modeled on
pub const COMPUTE_API_VERSION: &str = "2019-12-01";

/// Delay between long-running operation polls when ARM gives no hint
pub const DEFAULT_POLLING_DELAY: Duration = Duration::from_secs(5);

/// Per-request timeout for ARM calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Errors returned by Azure Resource Manager or the transport to it
#[derive(Debug, Error)]
pub enum ArmError {
    /// Connection, TLS, timeout or body decoding failure
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// ARM answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// ARM error code (e.g., "ResourceNotFound")
        code: Option<String>,
        /// ARM error message, or the raw body
        message: String,
        /// Parsed `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// A long-running operation reached a failed terminal state
    #[error("operation {status}: {message}")]
    OperationFailed {
        /// Terminal status reported by ARM ("Failed", "Canceled")
        status: String,
        /// ARM error code, if reported
        code: Option<String>,
        /// ARM error message
        message: String,
    },

    /// No bearer token could be obtained
    #[error("authorization failed: {0}")]
    Authorization(String),
}

impl ArmError {
    /// Create an HTTP status error
    pub fn http(
        status: u16,
        code: Option<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::Http {
            status,
            code,
            message: message.into(),
            retry_after,
        }
    }

    /// HTTP status of the failed response, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether ARM asked the client to slow down (HTTP 429)
    pub fn is_throttled(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }

    /// Back-off requested by ARM, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::OperationFailed { .. } | Self::Authorization(_) => false,
        }
    }
}

/// Where to poll a long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollUrl {
    /// `Azure-AsyncOperation` status resource; body carries `status`
    AsyncOperation(String),
    /// `Location` URL; 202 while running
    Location(String),
}

/// Handle to a submitted scale-set update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingUpdate {
    /// Poll target; `None` when ARM completed the update synchronously
    pub poll: Option<PollUrl>,
    /// Delay ARM asked for before the first poll
    pub retry_after: Option<Duration>,
}

impl PendingUpdate {
    /// An update that needs no polling
    pub fn completed() -> Self {
        Self::default()
    }

    /// Build from the PATCH response status and headers
    pub fn from_response(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        if status != StatusCode::CREATED && status != StatusCode::ACCEPTED {
            return Self::completed();
        }
        let header = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let poll = header(AZURE_ASYNC_OPERATION)
            .map(PollUrl::AsyncOperation)
            .or_else(|| header("location").map(PollUrl::Location));
        Self {
            poll,
            retry_after: retry_after_from_headers(headers, now),
        }
    }
}

/// Control-plane operations on a single scale set
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleSetApi: Send + Sync {
    /// Read a scale set
    async fn get(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachineScaleSet, ArmError>;

    /// Submit a PATCH for a scale set
    async fn begin_update(
        &self,
        resource_group: &str,
        name: &str,
        update: VirtualMachineScaleSetUpdate,
    ) -> Result<PendingUpdate, ArmError>;

    /// Block until a submitted update reaches a terminal state
    async fn wait_for_completion(&self, pending: PendingUpdate) -> Result<(), ArmError>;
}

/// Source of ARM bearer tokens
///
/// Acquiring tokens from Azure AD is left to the embedding application.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Bearer token for the ARM audience
    async fn bearer_token(&self) -> Result<String, ArmError>;
}

/// A pre-acquired bearer token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl Authorizer for StaticToken {
    async fn bearer_token(&self) -> Result<String, ArmError> {
        if self.0.is_empty() {
            return Err(ArmError::Authorization("empty access token".into()));
        }
        Ok(self.0.clone())
    }
}

/// [`ScaleSetApi`] over HTTPS
pub struct ArmScaleSetApi {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    authorizer: Arc<dyn Authorizer>,
    polling_delay: Duration,
}

impl ArmScaleSetApi {
    /// Create a transport for one subscription
    pub fn new(
        endpoint: impl Into<String>,
        subscription_id: impl Into<String>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ArmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            subscription_id: subscription_id.into(),
            authorizer,
            polling_delay: DEFAULT_POLLING_DELAY,
        })
    }

    /// Override the long-running operation polling delay
    pub fn with_polling_delay(mut self, delay: Duration) -> Self {
        self.polling_delay = delay;
        self
    }

    /// Resource URL of a scale set, including the API version
    pub fn scale_set_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}?api-version={}",
            self.endpoint, self.subscription_id, resource_group, name, COMPUTE_API_VERSION
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ArmError> {
        let token = self.authorizer.bearer_token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let retry_after = retry_after_from_headers(response.headers(), Utc::now());
        let body = response.text().await.unwrap_or_default();
        Err(error_from_body(status, &body, retry_after))
    }

    async fn poll_once(&self, poll: &PollUrl) -> Result<(bool, Option<Duration>), ArmError> {
        match poll {
            PollUrl::AsyncOperation(url) => {
                let response = self.send(self.http.get(url)).await?;
                let retry_after = retry_after_from_headers(response.headers(), Utc::now());
                let operation: OperationStatus = response.json().await?;
                if operation.status.eq_ignore_ascii_case("Succeeded") {
                    return Ok((true, None));
                }
                if operation.status.eq_ignore_ascii_case("Failed")
                    || operation.status.eq_ignore_ascii_case("Canceled")
                {
                    let error = operation.error.unwrap_or_default();
                    return Err(ArmError::OperationFailed {
                        status: operation.status,
                        code: error.code,
                        message: error
                            .message
                            .unwrap_or_else(|| "no error details".to_string()),
                    });
                }
                debug!(status = %operation.status, "Operation still running");
                Ok((false, retry_after))
            }
            PollUrl::Location(url) => {
                let response = self.send(self.http.get(url)).await?;
                let done = response.status() != StatusCode::ACCEPTED;
                Ok((done, retry_after_from_headers(response.headers(), Utc::now())))
            }
        }
    }
}

#[async_trait]
impl ScaleSetApi for ArmScaleSetApi {
    async fn get(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachineScaleSet, ArmError> {
        let url = self.scale_set_url(resource_group, name);
        let response = self.send(self.http.get(url)).await?;
        Ok(response.json().await?)
    }

    async fn begin_update(
        &self,
        resource_group: &str,
        name: &str,
        update: VirtualMachineScaleSetUpdate,
    ) -> Result<PendingUpdate, ArmError> {
        let url = self.scale_set_url(resource_group, name);
        let response = self.send(self.http.patch(url).json(&update)).await?;
        Ok(PendingUpdate::from_response(
            response.status(),
            response.headers(),
            Utc::now(),
        ))
    }

    async fn wait_for_completion(&self, pending: PendingUpdate) -> Result<(), ArmError> {
        let Some(poll) = pending.poll else {
            return Ok(());
        };
        let mut delay = pending.retry_after.unwrap_or(self.polling_delay);
        loop {
            tokio::time::sleep(delay).await;
            let (done, retry_after) = self.poll_once(&poll).await?;
            if done {
                return Ok(());
            }
            delay = retry_after.unwrap_or(self.polling_delay);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CloudError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: CloudError,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<CloudError>,
}

/// Turn a failed ARM response body into an [`ArmError`]
///
/// Uses the `{"error": {"code", "message"}}` envelope when present and falls
/// back to the raw body.
fn error_from_body(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ArmError {
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (None, None),
    };
    let message = message
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    ArmError::http(status.as_u16(), code, message, retry_after)
}

/// Parse a `Retry-After` header (delta-seconds or HTTP-date)
///
/// A date in the past yields a zero delay; an unparsable value yields `None`.
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn headers(entries: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn retry_after_accepts_delta_seconds() {
        let h = headers(&[("retry-after", "30")]);
        assert_eq!(
            retry_after_from_headers(&h, Utc::now()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn retry_after_accepts_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let h = headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")]);
        assert_eq!(
            retry_after_from_headers(&h, now),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn retry_after_in_the_past_is_zero() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 8, 0, 0).unwrap();
        let h = headers(&[("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT")]);
        assert_eq!(retry_after_from_headers(&h, now), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_missing_or_garbage_is_none() {
        assert_eq!(retry_after_from_headers(&HeaderMap::new(), Utc::now()), None);
        let h = headers(&[("retry-after", "soon")]);
        assert_eq!(retry_after_from_headers(&h, Utc::now()), None);
    }

    #[test]
    fn arm_error_envelope_is_parsed() {
        let body = r#"{"error":{"code":"OperationNotAllowed","message":"quota exceeded"}}"#;
        let err = error_from_body(StatusCode::CONFLICT, body, None);

        match &err {
            ArmError::Http { status, code, message, .. } => {
                assert_eq!(*status, 409);
                assert_eq!(code.as_deref(), Some("OperationNotAllowed"));
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("Expected Http variant, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn throttling_response_keeps_retry_after() {
        let err = error_from_body(
            StatusCode::TOO_MANY_REQUESTS,
            "",
            Some(Duration::from_secs(17)),
        );
        assert!(err.is_throttled());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
        assert!(err.to_string().contains("Too Many Requests"));
    }

    #[test]
    fn non_json_error_body_is_kept_as_message() {
        let err = error_from_body(StatusCode::BAD_GATEWAY, "upstream unavailable\n", None);
        assert_eq!(err.to_string(), "HTTP 502: upstream unavailable");
        assert!(err.is_retryable());
    }

    #[test]
    fn accepted_patch_polls_async_operation_first() {
        let h = headers(&[
            ("azure-asyncoperation", "https://arm/operations/1"),
            ("location", "https://arm/results/1"),
            ("retry-after", "2"),
        ]);
        let pending = PendingUpdate::from_response(StatusCode::ACCEPTED, &h, Utc::now());
        assert_eq!(
            pending.poll,
            Some(PollUrl::AsyncOperation("https://arm/operations/1".into()))
        );
        assert_eq!(pending.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn accepted_patch_falls_back_to_location() {
        let h = headers(&[("location", "https://arm/results/1")]);
        let pending = PendingUpdate::from_response(StatusCode::CREATED, &h, Utc::now());
        assert_eq!(
            pending.poll,
            Some(PollUrl::Location("https://arm/results/1".into()))
        );
    }

    #[test]
    fn synchronous_patch_needs_no_polling() {
        let h = headers(&[("azure-asyncoperation", "https://arm/operations/1")]);
        let pending = PendingUpdate::from_response(StatusCode::OK, &h, Utc::now());
        assert_eq!(pending, PendingUpdate::completed());
    }

    #[test]
    fn scale_set_url_targets_compute_provider() {
        let api = ArmScaleSetApi::new(
            "https://management.azure.com/",
            "sub-1",
            Arc::new(StaticToken::new("t")),
        )
        .unwrap();

        assert_eq!(
            api.scale_set_url("rg-nodes", "pool"),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-nodes/providers/Microsoft.Compute/virtualMachineScaleSets/pool?api-version=2019-12-01"
        );
    }

    #[tokio::test]
    async fn empty_static_token_is_rejected() {
        let err = StaticToken::new("").bearer_token().await.unwrap_err();
        assert!(matches!(err, ArmError::Authorization(_)));
        assert_eq!(format!("{:?}", StaticToken::new("secret")), "StaticToken(<redacted>)");
    }
}
