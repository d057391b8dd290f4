//! Delivery transport
//!
//! The [`Environment`] trait is the seam between the publisher and the
//! outside world: the asynchronous network write used during normal
//! operation, the beacon-style and blocking writes used at teardown, and the
//! user agent string stamped on events. [`HttpEnvironment`] is the production
//! implementation; tests use [`ScriptedEnvironment`](super::testing::ScriptedEnvironment).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};

use crate::config::PublisherConfig;
use crate::error::{Error, Result};

/// Capabilities the publisher needs from its host environment
#[async_trait]
pub trait Environment: Send + Sync {
    /// POST a JSON body to `endpoint`
    ///
    /// Returns `Ok` only for a 2xx response. Non-2xx statuses, transport
    /// errors and timeouts are all [`Error::Delivery`].
    async fn post_json(&self, endpoint: &str, body: String) -> Result<()>;

    /// Fire-and-forget delivery that survives immediate process exit
    ///
    /// Returns `None` when the environment has no such mechanism, otherwise
    /// whether the payload was accepted for delivery.
    fn send_beacon(&self, endpoint: &str, body: &str) -> Option<bool>;

    /// POST a JSON body and return only once the request has completed
    fn post_json_blocking(&self, endpoint: &str, body: &str) -> Result<()>;

    /// Environment description recorded on each event
    fn user_agent(&self) -> Option<String> {
        None
    }
}

/// Production environment backed by reqwest
///
/// Native processes have no beacon API, so teardown always takes the
/// blocking path.
pub struct HttpEnvironment {
    http_client: reqwest::Client,
    timeout: Duration,
    user_agent: String,
}

impl HttpEnvironment {
    /// Create an environment from publisher configuration
    pub fn new(config: &PublisherConfig) -> Result<Self> {
        let user_agent = default_user_agent();
        let timeout = Duration::from_secs(config.timeout_secs);

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers(&user_agent)?)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            timeout,
            user_agent,
        })
    }
}

#[async_trait]
impl Environment for HttpEnvironment {
    async fn post_json(&self, endpoint: &str, body: String) -> Result<()> {
        let response = self
            .http_client
            .post(endpoint)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Delivery(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }

    fn send_beacon(&self, _endpoint: &str, _body: &str) -> Option<bool> {
        None
    }

    fn post_json_blocking(&self, endpoint: &str, body: &str) -> Result<()> {
        // reqwest's blocking client owns a runtime of its own and must not be
        // created or dropped on an async worker thread.
        std::thread::scope(|scope| {
            scope
                .spawn(|| blocking_post(endpoint, body, self.timeout, &self.user_agent))
                .join()
                .unwrap_or_else(|_| {
                    Err(Error::Delivery("blocking sender thread panicked".to_string()))
                })
        })
    }

    fn user_agent(&self) -> Option<String> {
        Some(self.user_agent.clone())
    }
}

fn blocking_post(endpoint: &str, body: &str, timeout: Duration, user_agent: &str) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .default_headers(default_headers(user_agent)?)
        .build()
        .map_err(|e| Error::Delivery(format!("failed to create HTTP client: {}", e)))?;

    let response = client
        .post(endpoint)
        .body(body.to_string())
        .send()
        .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::Delivery(format!("API error ({})", status)))
    }
}

fn default_headers(user_agent: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|e| Error::Config(format!("invalid user agent: {}", e)))?,
    );
    Ok(headers)
}

/// `metricpost/<version> (<os>; <arch>)`
fn default_user_agent() -> String {
    format!(
        "metricpost/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
