//! Credential exchange with the analytics auth endpoint.
//!
//! The gateway holds a long-lived credential (`authToken`) that it trades for a short-lived Shared
//! Access Signature at `<authURL>/token`. Failures are classified so that callers can tell a
//! transient outage, which is retried, from a permanent misconfiguration, which disables
//! publishing.

use std::fmt;
use std::time::Duration;

use apk_statsd::metric;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use url::Url;

use crate::statsd::AnalyticsCounters;

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Tokens are refreshed once they are this many seconds from expiry.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Whether an auth failure is worth retrying.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthErrorKind {
    Recoverable,
    Unrecoverable,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("invalid auth endpoint `{endpoint}`")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("publisher temporarily revoked")]
    Revoked,
    #[error("auth endpoint unreachable")]
    Unreachable(#[source] reqwest::Error),
    #[error("unexpected status {0} from auth endpoint")]
    UnexpectedStatus(StatusCode),
    #[error("could not read auth response")]
    Response(#[source] reqwest::Error),
    #[error("auth response did not contain a token")]
    MissingToken,
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),
}

impl AuthError {
    /// Classifies the failure.
    ///
    /// Only a rejected credential and an unusable endpoint are permanent. Everything else,
    /// including revocation, may resolve itself and is retried.
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::InvalidCredential | Self::InvalidEndpoint { .. } => AuthErrorKind::Unrecoverable,
            Self::Revoked
            | Self::Unreachable(_)
            | Self::UnexpectedStatus(_)
            | Self::Response(_)
            | Self::MissingToken
            | Self::MalformedToken(_) => AuthErrorKind::Recoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind() == AuthErrorKind::Recoverable
    }

    /// Maps an unsuccessful response status to an error.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::InvalidCredential,
            StatusCode::FORBIDDEN => Self::Revoked,
            status => Self::UnexpectedStatus(status),
        }
    }
}

/// An opaque credential and the endpoint that issued it.
#[derive(Clone, Eq, PartialEq)]
pub struct AuthToken {
    token: String,
    endpoint: String,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"[redacted]")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Fetches publishing credentials.
#[derive(Clone, Debug)]
pub struct AuthClient {
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Trades `credential` for a token at `<endpoint>/token`.
    ///
    /// A request that takes longer than `timeout` fails as [`AuthError::Unreachable`].
    pub async fn get_token(
        &self,
        endpoint: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<AuthToken, AuthError> {
        let result = self.request_token(endpoint, credential, timeout).await;
        if let Err(ref error) = result {
            metric!(
                counter(AnalyticsCounters::AuthFailure) += 1,
                kind = error.kind().as_str()
            );
        }
        result
    }

    async fn request_token(
        &self,
        endpoint: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<AuthToken, AuthError> {
        let base = endpoint.trim().trim_end_matches('/');
        let url = Url::parse(&format!("{base}/token")).map_err(|source| {
            AuthError::InvalidEndpoint {
                endpoint: endpoint.to_owned(),
                source,
            }
        })?;

        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {credential}"))
            .timeout(timeout)
            .send()
            .await
            .map_err(AuthError::Unreachable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::from_status(status));
        }

        let body: TokenResponse = response.json().await.map_err(AuthError::Response)?;
        match body.token {
            Some(token) if !token.trim().is_empty() => Ok(AuthToken::new(token, base)),
            _ => Err(AuthError::MissingToken),
        }
    }
}

/// A parsed event hub Shared Access Signature.
#[derive(Clone, Eq, PartialEq)]
pub struct SasToken {
    authorization: String,
    namespace: String,
    hub: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SasToken {
    /// Parses `SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>&skn=<key>`.
    ///
    /// The resource has the form `sb://<namespace>/<hub>`. A token without `se` never expires.
    pub fn parse(token: &str) -> Result<Self, AuthError> {
        let token = token.trim();
        let query = token.strip_prefix(SAS_PREFIX).unwrap_or(token);
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
            .map_err(|_| AuthError::MalformedToken("not url encoded"))?;

        let mut resource = None;
        let mut expiry = None;
        for (key, value) in pairs {
            match key.as_str() {
                "sr" => resource = Some(value),
                "se" => expiry = Some(value),
                _ => (),
            }
        }

        let resource = resource.ok_or(AuthError::MalformedToken("missing resource"))?;
        let path = resource
            .split_once("://")
            .map_or(resource.as_str(), |(_, rest)| rest);
        let (namespace, hub) = path
            .split_once('/')
            .ok_or(AuthError::MalformedToken("resource without event hub"))?;
        let hub = hub.trim_matches('/');
        if namespace.is_empty() || hub.is_empty() {
            return Err(AuthError::MalformedToken("resource without event hub"));
        }

        let expires_at = match expiry {
            Some(expiry) => {
                let seconds: i64 = expiry
                    .parse()
                    .map_err(|_| AuthError::MalformedToken("invalid expiry"))?;
                Some(
                    DateTime::from_timestamp(seconds, 0)
                        .ok_or(AuthError::MalformedToken("invalid expiry"))?,
                )
            }
            None => None,
        };

        Ok(Self {
            authorization: format!("{SAS_PREFIX}{query}"),
            namespace: namespace.to_owned(),
            hub: hub.to_owned(),
            expires_at,
        })
    }

    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Returns `true` once the token is within a minute of expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - now <= TimeDelta::seconds(REFRESH_MARGIN_SECS))
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasToken")
            .field("namespace", &self.namespace)
            .field("hub", &self.hub)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
