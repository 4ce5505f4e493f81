//! Trigger for the downstream site rebuild.

use std::time::Duration;

use log::info;
use serde::Serialize;

use crate::error::{PulseError, Result};
use crate::options::RetryOptions;
use crate::retry::with_retry;

/// Payload understood by the rebuild hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub event_type: String,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            event_type: "webhook".to_string(),
        }
    }
}

/// Posts build requests to a fixed URL.
#[derive(Clone, Debug)]
pub struct BuildNotifier {
    url: String,
    client: reqwest::blocking::Client,
    retry: RetryOptions,
}

impl BuildNotifier {
    pub fn new(url: impl Into<String>, retry: RetryOptions) -> Result<Self> {
        let url = url.into();
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PulseError::Http {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        Ok(Self { url, client, retry })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one request, retrying transport errors and non-success statuses.
    pub fn send(&self, request: &BuildRequest) -> Result<u16> {
        let status = with_retry(&self.retry, "build request", |_| self.post(request)).map_err(
            |exhausted| PulseError::Http {
                url: self.url.clone(),
                reason: format!(
                    "{} after {} attempts",
                    exhausted.last, exhausted.attempts
                ),
            },
        )?;
        info!("build request accepted by {} with status {status}", self.url);
        Ok(status)
    }

    fn post(&self, request: &BuildRequest) -> Result<u16> {
        let http = |reason: String| PulseError::Http {
            url: self.url.clone(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .map_err(|err| http(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(http(format!("status {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn payload_is_a_webhook_event() {
        let body = serde_json::to_string(&BuildRequest::default()).unwrap();
        assert_eq!(body, r#"{"event_type":"webhook"}"#);
    }

    #[test]
    fn unreachable_hook_is_an_http_error() {
        let retry = RetryOptions::default()
            .with_max_attempts(2)
            .with_initial_backoff(Duration::ZERO);
        let notifier = BuildNotifier::new("http://127.0.0.1:9/hook", retry).unwrap();
        let err = notifier.send(&BuildRequest::default()).unwrap_err();
        assert!(matches!(err, PulseError::Http { .. }));
    }
}
