//! Construction of the HTTP clients used by the sinks and the auth client.

use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io};

#[doc(inline)]
pub use reqwest::StatusCode;

/// Timeout for establishing connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("could not build the http client")]
    Reqwest(#[from] reqwest::Error),
    #[error("failed to read the CA bundle at {}", path.display())]
    CaBundle {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid proxy configuration for {url}")]
    Proxy {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Outbound proxy settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// `http` unless configured otherwise.
    pub protocol: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Returns the proxy URL without credentials.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Settings shared by every HTTP client of a reporter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HttpClientConfig {
    pub proxy: Option<ProxyConfig>,
    /// PEM file with additional trusted root certificates.
    pub ca_bundle: Option<PathBuf>,
    /// Total timeout of one request. `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
}

impl HttpClientConfig {
    /// Builds a client honoring the proxy and trust settings.
    pub fn build(&self) -> Result<reqwest::Client, HttpError> {
        let mut builder = reqwest::ClientBuilder::new().connect_timeout(CONNECT_TIMEOUT);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(ref proxy) = self.proxy {
            let url = proxy.url();
            let mut reqwest_proxy = reqwest::Proxy::all(&url).map_err(|source| HttpError::Proxy {
                url: url.clone(),
                source,
            })?;
            if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
                reqwest_proxy = reqwest_proxy.basic_auth(username, password);
            }
            apk_log::debug!("routing analytics requests through proxy {url}");
            builder = builder.proxy(reqwest_proxy);
        }

        if let Some(ref path) = self.ca_bundle {
            let pem = fs::read(path).map_err(|source| HttpError::CaBundle {
                path: path.clone(),
                source,
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_url() {
        let proxy = ProxyConfig {
            host: "proxy.internal".to_owned(),
            port: 3128,
            protocol: "http".to_owned(),
            username: Some("user".to_owned()),
            password: Some("secret".to_owned()),
        };
        assert_eq!(proxy.url(), "http://proxy.internal:3128");

        let config = HttpClientConfig {
            proxy: Some(proxy),
            ..Default::default()
        };
        assert!(config.build().is_ok());
    }

    #[test]
    fn test_missing_ca_bundle() {
        let config = HttpClientConfig {
            ca_bundle: Some(PathBuf::from("/nonexistent/analytics-ca.pem")),
            ..Default::default()
        };

        let error = config.build().unwrap_err();
        assert!(matches!(error, HttpError::CaBundle { .. }));
        assert_eq!(
            error.to_string(),
            "failed to read the CA bundle at /nonexistent/analytics-ca.pem"
        );
    }
}
