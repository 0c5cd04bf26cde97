use crate::poll::PollPolicy;
use once_cell::sync::Lazy;
use std::{env, time::Duration};

pub static AUTH_URL: Lazy<String> = Lazy::new(|| {
    env::var("CEBIA_AUTH_URL")
        .unwrap_or_else(|_| "https://app.cebia.com/api/Autotracer_test/token".to_string())
});

/// Base for the query endpoints, always with a trailing slash.
pub static API_URL: Lazy<String> = Lazy::new(|| {
    let raw = env::var("CEBIA_API_URL")
        .unwrap_or_else(|_| "https://app.cebia.com/api/Autotracer_test/v1/".to_string());
    if raw.ends_with('/') { raw } else { format!("{raw}/") }
});

#[derive(Debug, Clone)]
pub struct CebiaCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

impl CebiaCredentials {
    pub fn from_env() -> Self {
        Self {
            username: env::var("CEBIA_USERNAME").unwrap_or_default(),
            password: env::var("CEBIA_PASSWORD").unwrap_or_default(),
            client_id: env::var("CEBIA_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("CEBIA_CLIENT_SECRET").unwrap_or_default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty() && !self.client_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CebiaPolling {
    pub queue: PollPolicy,
    pub basic_info: PollPolicy,
    pub coupon: PollPolicy,
}

impl Default for CebiaPolling {
    fn default() -> Self {
        Self {
            queue: PollPolicy::new(Duration::from_millis(1000), 10),
            basic_info: PollPolicy::new(Duration::from_millis(3000), 20),
            coupon: PollPolicy::new(Duration::from_millis(2000), 10),
        }
    }
}

impl CebiaPolling {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let interval = |key: &str, fallback: Duration| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        let attempts = |key: &str, fallback: u32| {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(fallback)
        };
        Self {
            queue: PollPolicy::new(
                interval("CEBIA_QUEUE_INTERVAL_MS", defaults.queue.interval),
                attempts("CEBIA_QUEUE_ATTEMPTS", defaults.queue.max_attempts),
            ),
            basic_info: PollPolicy::new(
                interval("CEBIA_POLL_INTERVAL_MS", defaults.basic_info.interval),
                attempts("CEBIA_INFO_ATTEMPTS", defaults.basic_info.max_attempts),
            ),
            coupon: PollPolicy::new(
                interval("CEBIA_COUPON_INTERVAL_MS", defaults.coupon.interval),
                attempts("CEBIA_COUPON_ATTEMPTS", defaults.coupon.max_attempts),
            ),
        }
    }
}
