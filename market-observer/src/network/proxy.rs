//! Rotating proxy pool with scrape-based refresh.

use rand::seq::SliceRandom;
use rand::thread_rng;
use regex::Regex;
use tracing::{debug, info};

use observer_common::NetworkError;

/// Fixed pool of browser User-Agents, picked at random per request.
const USER_AGENTS: [&str; 10] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.212 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.212 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:88.0) Gecko/20100101 Firefox/88.0",
];

const SCRAPE_URL: &str = "https://www.sslproxies.org/";
const SCRAPE_PATTERN: &str =
    r"<tr><td>(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})</td><td>(\d+)</td>";
const MAX_SCRAPED_PROXIES: usize = 50;

/// Random User-Agent from the fixed pool.
pub fn user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Roughly valid proxy URL: http/https/socks5 scheme, or none (normalized
/// to http).
pub fn validate_proxy(proxy: &str) -> bool {
    if proxy.is_empty() {
        return false;
    }
    match proxy.split_once("://") {
        Some((scheme, rest)) => {
            matches!(scheme, "http" | "https" | "socks5") && !rest.is_empty()
        }
        None => true,
    }
}

/// Ensure the proxy carries a scheme.
pub fn format_proxy(proxy: &str) -> String {
    if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{}", proxy)
    }
}

struct PoolState {
    proxies: Vec<String>,
    index: usize,
}

/// Mutex-guarded proxy list; rotation and refresh are linearized.
pub struct ProxyPool {
    state: std::sync::Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(configured: &[String]) -> Self {
        let proxies: Vec<String> = configured
            .iter()
            .filter(|p| validate_proxy(p))
            .map(|p| format_proxy(p))
            .collect();

        Self {
            state: std::sync::Mutex::new(PoolState { proxies, index: 0 }),
        }
    }

    pub fn has_proxies(&self) -> bool {
        !self.state.lock().unwrap().proxies.is_empty()
    }

    pub fn current(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.proxies.get(state.index).cloned()
    }

    pub fn rotate(&self) {
        let mut state = self.state.lock().unwrap();
        if state.proxies.len() <= 1 {
            return;
        }
        state.index = (state.index + 1) % state.proxies.len();
        debug!(proxy = %state.proxies[state.index], "rotated proxy");
    }

    /// Scrape a fresh proxy list, shuffle it, and replace the pool
    /// (capped at 50 entries). Returns how many proxies were installed.
    pub async fn refresh(&self, client: &reqwest::Client) -> Result<usize, NetworkError> {
        info!(url = SCRAPE_URL, "refreshing proxies");

        let body = client
            .get(SCRAPE_URL)
            .header(reqwest::header::USER_AGENT, user_agent())
            .send()
            .await
            .map_err(|e| NetworkError::ProxyRefresh(e.to_string()))?
            .text()
            .await
            .map_err(|e| NetworkError::ProxyRefresh(e.to_string()))?;

        let installed = self.install_scraped(&body)?;
        info!(count = installed, "proxy pool refreshed");
        Ok(installed)
    }

    fn install_scraped(&self, body: &str) -> Result<usize, NetworkError> {
        let re = Regex::new(SCRAPE_PATTERN)
            .map_err(|e| NetworkError::ProxyRefresh(e.to_string()))?;

        let mut scraped: Vec<String> = re
            .captures_iter(body)
            .map(|cap| format!("http://{}:{}", &cap[1], &cap[2]))
            .collect();

        if scraped.is_empty() {
            return Err(NetworkError::ProxyRefresh(
                "no proxies found on page".to_string(),
            ));
        }

        scraped.shuffle(&mut thread_rng());
        scraped.truncate(MAX_SCRAPED_PROXIES);

        let count = scraped.len();
        let mut state = self.state.lock().unwrap();
        state.proxies = scraped;
        state.index = 0;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_proxy() {
        assert!(validate_proxy("http://1.2.3.4:8080"));
        assert!(validate_proxy("socks5://1.2.3.4:1080"));
        assert!(validate_proxy("1.2.3.4:8080"));
        assert!(!validate_proxy(""));
        assert!(!validate_proxy("ftp://1.2.3.4:21"));
    }

    #[test]
    fn test_format_proxy_adds_scheme() {
        assert_eq!(format_proxy("1.2.3.4:8080"), "http://1.2.3.4:8080");
        assert_eq!(format_proxy("https://x:1"), "https://x:1");
    }

    #[test]
    fn test_rotation_wraps() {
        let pool = ProxyPool::new(&[
            "1.1.1.1:80".to_string(),
            "2.2.2.2:80".to_string(),
        ]);

        let first = pool.current().unwrap();
        pool.rotate();
        let second = pool.current().unwrap();
        assert_ne!(first, second);
        pool.rotate();
        assert_eq!(pool.current().unwrap(), first);
    }

    #[test]
    fn test_rotation_noop_for_single_proxy() {
        let pool = ProxyPool::new(&["1.1.1.1:80".to_string()]);
        let first = pool.current().unwrap();
        pool.rotate();
        assert_eq!(pool.current().unwrap(), first);
    }

    #[test]
    fn test_invalid_proxies_filtered_on_init() {
        let pool = ProxyPool::new(&["ftp://bad:1".to_string(), "".to_string()]);
        assert!(!pool.has_proxies());
        assert!(pool.current().is_none());
    }

    #[test]
    fn test_install_scraped_parses_and_caps() {
        let pool = ProxyPool::new(&[]);

        let mut body = String::new();
        for i in 0..60 {
            body.push_str(&format!("<tr><td>10.0.0.{}</td><td>8080</td>", i));
        }

        let count = pool.install_scraped(&body).unwrap();
        assert_eq!(count, 50);
        assert!(pool.has_proxies());
        assert!(pool.current().unwrap().starts_with("http://10.0.0."));
    }

    #[test]
    fn test_install_scraped_empty_page_fails() {
        let pool = ProxyPool::new(&[]);
        assert!(pool.install_scraped("<html>nothing here</html>").is_err());
    }

    #[test]
    fn test_user_agent_from_pool() {
        let ua = user_agent();
        assert!(USER_AGENTS.contains(&ua));
    }
}
