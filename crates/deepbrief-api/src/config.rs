use std::env;
use std::time::Duration;

use anyhow::Result;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: String,
    pub max_concurrency: usize,
    pub auth_token: Option<String>,
    pub crawl_poll_attempts: usize,
    pub crawl_poll_interval: Duration,
}

impl AppConfig {
    const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";
    const DEFAULT_CRAWL_POLL_ATTEMPTS: usize = 10;
    const DEFAULT_CRAWL_POLL_MS: u64 = 1_000;

    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("DEEPBRIEF_LISTEN_ADDR")
            .unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_string());

        let max_concurrency = env::var("DEEPBRIEF_MAX_CONCURRENCY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|nz| nz.get())
                    .unwrap_or(4)
            });

        let auth_token = env::var("DEEPBRIEF_AUTH_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let crawl_poll_attempts = env::var("DEEPBRIEF_CRAWL_POLL_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(Self::DEFAULT_CRAWL_POLL_ATTEMPTS);

        let crawl_poll_interval = env::var("DEEPBRIEF_CRAWL_POLL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(Self::DEFAULT_CRAWL_POLL_MS));

        Ok(Self {
            listen_addr,
            max_concurrency,
            auth_token,
            crawl_poll_attempts,
            crawl_poll_interval,
        })
    }
}
