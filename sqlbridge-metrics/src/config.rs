use std::time::Duration;

use sqlbridge_util::retry::RetryPolicy;

/// Scrape cadence and retry discipline for the backend reader.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Interval between reader ticks.
    pub metrics_interval: Duration,
    /// Overall deadline for one HTTP request.
    pub metrics_timeout: Duration,
    pub dial_timeout: Duration,
    /// Retries for retryable transport errors, constant backoff.
    pub max_retries: usize,
    pub retry_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            metrics_interval: Duration::from_secs(10),
            metrics_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(3),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ReaderConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_interval)
    }

    pub(crate) fn build_http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .connect_timeout(self.dial_timeout)
            .timeout(self.metrics_timeout)
            .build()
            // Falls back to defaults only if the TLS backend is broken,
            // which cannot happen with a plain-HTTP build.
            .unwrap_or_default()
    }
}
