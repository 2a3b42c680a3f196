use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::SourceError;

/// Longest provider-requested wait we honor before retrying.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Request pacing and retry behavior for one provider.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub default_retry_delay: Duration,
    pub timeout: Duration,
}

impl RatePolicy {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
            max_retries: 1,
            default_retry_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    fn period(&self) -> Duration {
        if self.requests_per_second > 0.0 && self.requests_per_second.is_finite() {
            Duration::from_secs_f64(1.0 / self.requests_per_second)
        } else {
            Duration::from_secs(1)
        }
    }
}

/// HTTP client shared by every call to one provider: paces requests through a token
/// bucket and retries rate-limited requests after the provider-specified delay.
pub struct RateLimitedClient {
    provider: &'static str,
    http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    policy: RatePolicy,
}

impl RateLimitedClient {
    pub fn new(
        provider: &'static str,
        user_agent: &str,
        policy: RatePolicy,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(policy.timeout)
            .build()
            .map_err(|e| SourceError::http(provider, e))?;
        let quota = Quota::with_period(policy.period())
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Ok(Self {
            provider,
            http,
            limiter: RateLimiter::direct(quota),
            policy,
        })
    }

    /// Send a request built by `build`, waiting for a rate-limit slot first.
    ///
    /// A 404 is returned to the caller as a response; other non-success statuses become
    /// [`SourceError::Api`].
    pub async fn send<F>(&self, build: F) -> Result<Response, SourceError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            self.limiter.until_ready().await;
            let resp = build(&self.http)
                .send()
                .await
                .map_err(|e| SourceError::http(self.provider, e))?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let delay = retry_after(resp.headers())
                    .unwrap_or(self.policy.default_retry_delay)
                    .min(MAX_RETRY_DELAY);
                if attempt < self.policy.max_retries {
                    attempt += 1;
                    tracing::warn!(
                        provider = self.provider,
                        delay_ms = delay.as_millis() as u64,
                        attempt,
                        "Rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(SourceError::RateLimited {
                    provider: self.provider,
                    retry_after: delay,
                });
            }

            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(resp);
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                provider: self.provider,
                status: status.as_u16(),
                message: body.chars().take(300).collect(),
            });
        }
    }

    /// GET-style helper: `None` on 404, otherwise the decoded JSON body.
    pub async fn json<T, F>(&self, build: F) -> Result<Option<T>, SourceError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = self.send(build).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = resp
            .json::<T>()
            .await
            .map_err(|e| SourceError::http(self.provider, e))?;
        Ok(Some(value))
    }

    /// Like [`Self::json`] but returns the raw body text.
    pub async fn text<F>(&self, build: F) -> Result<Option<String>, SourceError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = self.send(build).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| SourceError::http(self.provider, e))?;
        Ok(Some(body))
    }
}

/// Delay requested by a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}
