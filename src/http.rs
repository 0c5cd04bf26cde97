use reqwest::{Client, ClientBuilder, cookie::Jar};
use std::{sync::Arc, time::Duration};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

pub fn build_client() -> Client {
    base_builder()
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client that keeps cookies between requests, used to replay a provider session
/// without a browser.
pub fn build_session_client(jar: Arc<Jar>) -> Client {
    base_builder()
        .cookie_provider(jar)
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn base_builder() -> ClientBuilder {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 30);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
}

pub fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
