//! HTTP fetcher with retry, backoff and proxy rotation.
//!
//! One retry loop covers everything the providers need: quadratic backoff
//! between attempts, proxy rotation on 429/403, and a scrape-refresh of the
//! pool when a block streak is about to exhaust the retries.

pub mod proxy;

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use tokio::time::sleep;
use tracing::{debug, warn};

use observer_common::NetworkError;

use crate::config::NetworkSettings;
use proxy::ProxyPool;

pub struct HttpFetcher {
    proxies: ProxyPool,
    /// Rebuilt whenever the active proxy changes
    client: Mutex<Client>,
    request_timeout: Duration,
    max_retries: u32,
    /// Enables proxy rotation and scrape-refresh
    proxying_enabled: bool,
}

impl HttpFetcher {
    pub fn new(settings: &NetworkSettings) -> Result<Self, NetworkError> {
        let proxies = if settings.enabled {
            ProxyPool::new(&settings.proxies)
        } else {
            ProxyPool::new(&[])
        };

        let request_timeout = Duration::from_secs(settings.request_timeout);
        let client = build_client(request_timeout, proxies.current().as_deref())?;

        Ok(Self {
            proxies,
            client: Mutex::new(client),
            request_timeout,
            max_retries: settings.max_retries,
            proxying_enabled: settings.enabled,
        })
    }

    /// GET with query params. Retries up to `max_retries` times with
    /// `attempt²`-second backoff; fails only after exhausting retries.
    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Bytes, NetworkError> {
        let mut last_error = NetworkError::RetriesExhausted("no attempt made".to_string());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(Duration::from_secs((attempt * attempt) as u64)).await;
                self.rotate_proxy();
            }

            let client = self.client.lock().unwrap().clone();
            let response = client
                .get(url)
                .query(params)
                .header(USER_AGENT, proxy::user_agent())
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    debug!(url, attempt, error = %e, "request failed");
                    last_error = NetworkError::Request(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                warn!(url, status = status.as_u16(), "request blocked, rotating proxy");
                last_error = NetworkError::Blocked(status.as_u16());

                // A block streak about to exhaust the retries: try to swap
                // the whole pool before the final attempt.
                if attempt + 1 == self.max_retries && self.proxying_enabled {
                    match self.refresh_proxies().await {
                        Ok(count) => {
                            debug!(count, "scraped fresh proxies, retrying");
                            self.rebuild_client();
                        }
                        Err(e) => warn!(error = %e, "proxy refresh failed"),
                    }
                }
                continue;
            }

            if !status.is_success() {
                debug!(url, status = status.as_u16(), "bad status");
                last_error = NetworkError::Status(status.as_u16());
                continue;
            }

            match response.bytes().await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    last_error = NetworkError::Body(e.to_string());
                    continue;
                }
            }
        }

        // Last-ditch refresh so the next caller starts with a fresh pool.
        if self.proxying_enabled {
            if let Err(e) = self.refresh_proxies().await {
                debug!(error = %e, "final proxy refresh failed");
            }
        }

        Err(NetworkError::RetriesExhausted(last_error.to_string()))
    }

    fn rotate_proxy(&self) {
        if !self.proxies.has_proxies() {
            return;
        }
        self.proxies.rotate();
        self.rebuild_client();
    }

    fn rebuild_client(&self) {
        match build_client(self.request_timeout, self.proxies.current().as_deref()) {
            Ok(client) => *self.client.lock().unwrap() = client,
            Err(e) => warn!(error = %e, "failed to rebuild http client, keeping previous"),
        }
    }

    async fn refresh_proxies(&self) -> Result<usize, NetworkError> {
        // The scrape goes through a plain client so a dead proxy cannot
        // block its own replacement.
        let plain = build_client(Duration::from_secs(10), None)?;
        self.proxies.refresh(&plain).await
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, NetworkError> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true);

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| NetworkError::InvalidProxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| NetworkError::ClientBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;

    fn settings() -> NetworkSettings {
        NetworkSettings {
            enabled: false,
            proxies: Vec::new(),
            request_timeout: 5,
            max_retries: 2,
            concurrent_requests: 4,
            user_agent: String::new(),
        }
    }

    #[test]
    fn test_fetcher_builds_without_proxies() {
        assert!(HttpFetcher::new(&settings()).is_ok());
    }

    #[test]
    fn test_fetcher_ignores_proxies_when_disabled() {
        let mut s = settings();
        s.proxies = vec!["1.2.3.4:8080".to_string()];
        let fetcher = HttpFetcher::new(&s).unwrap();
        assert!(!fetcher.proxies.has_proxies());
    }

    #[test]
    fn test_fetcher_uses_proxies_when_enabled() {
        let mut s = settings();
        s.enabled = true;
        s.proxies = vec!["1.2.3.4:8080".to_string()];
        let fetcher = HttpFetcher::new(&s).unwrap();
        assert!(fetcher.proxies.has_proxies());
    }

    #[test]
    fn test_build_client_rejects_bad_proxy() {
        let result = build_client(Duration::from_secs(1), Some("not a url"));
        assert!(matches!(result, Err(NetworkError::InvalidProxy(_))));
    }
}
