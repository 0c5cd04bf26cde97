use crate::http::{env_bool, env_secs};
use std::{env, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Browser,
    Http,
}

impl SessionMode {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "http" => SessionMode::Http,
            _ => SessionMode::Browser,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckCarVinConfig {
    pub origin: String,
    /// Wait after landing on the origin so the challenge page can clear.
    pub settle: Duration,
    pub login_settle: Duration,
    pub session_mode: SessionMode,
    pub daily_limit: i64,
    pub token_max_age_hours: i64,
    pub token_hard_fail: bool,
    pub report_dir: PathBuf,
}

impl Default for CheckCarVinConfig {
    fn default() -> Self {
        Self {
            origin: "https://api.checkcar.vin".to_string(),
            settle: Duration::from_secs(7),
            login_settle: Duration::from_secs(15),
            session_mode: SessionMode::Browser,
            daily_limit: 15,
            token_max_age_hours: 24,
            token_hard_fail: false,
            report_dir: PathBuf::from("var/data/uploads"),
        }
    }
}

impl CheckCarVinConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            origin: env::var("CHECKCARVIN_ORIGIN")
                .ok()
                .map(|v| v.trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.origin),
            settle: Duration::from_secs(env_secs("CHECKCARVIN_SETTLE_SECS", 7)),
            login_settle: Duration::from_secs(env_secs("CHECKCARVIN_LOGIN_SETTLE_SECS", 15)),
            session_mode: SessionMode::parse(env::var("CHECKCARVIN_SESSION").ok().as_deref()),
            daily_limit: env::var("CHECKCARVIN_DAILY_LIMIT")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.daily_limit),
            token_max_age_hours: env::var("CHECKCARVIN_TOKEN_MAX_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.token_max_age_hours),
            token_hard_fail: env_bool("CHECKCARVIN_TOKEN_HARD_FAIL"),
            report_dir: env::var("REPORT_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.report_dir),
        }
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.origin, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_mode_defaults_to_browser() {
        assert_eq!(SessionMode::parse(None), SessionMode::Browser);
        assert_eq!(SessionMode::parse(Some(" HTTP ")), SessionMode::Http);
        assert_eq!(SessionMode::parse(Some("chrome")), SessionMode::Browser);
    }

    #[test]
    fn relative_paths_resolve_against_origin() {
        let config = CheckCarVinConfig::default();
        assert_eq!(
            config.url("/api/v1/auth/login"),
            "https://api.checkcar.vin/api/v1/auth/login"
        );
        assert_eq!(config.url("https://other.test/x"), "https://other.test/x");
    }
}
