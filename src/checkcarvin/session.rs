//! Session-scoped authenticated fetch against checkcar.vin.
//!
//! The provider sits behind a JS challenge. A [`Session`] lands on the origin,
//! waits for the challenge to clear, then issues API calls from inside that
//! context so the challenge cookies ride along. Two backends exist: a headless
//! Chrome page (calls run as `fetch` inside the page) and a plain HTTP client
//! replaying the cookie jar.

use super::config::{CheckCarVinConfig, SessionMode};
use crate::http::{BROWSER_USER_AGENT, build_session_client};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    cdp::js_protocol::runtime::EvaluateParams,
};
use futures_util::StreamExt;
use reqwest::{
    Client, Method,
    cookie::{CookieStore, Jar},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("undecodable response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionResponse {
    pub status: u16,
    /// Parsed JSON body, or the raw text as a JSON string when it was not JSON.
    pub body: Value,
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn navigate_and_settle(&self, settle: Duration) -> Result<(), SessionError>;

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<SessionResponse, SessionError>;

    async fn request_bytes(
        &self,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<(u16, Vec<u8>), SessionError>;

    async fn cookie(&self, name: &str) -> Option<String>;

    async fn close(&mut self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Session>, SessionError>;
}

pub fn session_factory(config: &CheckCarVinConfig) -> Arc<dyn SessionFactory> {
    match config.session_mode {
        SessionMode::Browser => Arc::new(BrowserSessionFactory {
            config: config.clone(),
        }),
        SessionMode::Http => Arc::new(HttpSessionFactory {
            config: config.clone(),
        }),
    }
}

pub struct BrowserSessionFactory {
    config: CheckCarVinConfig,
}

#[async_trait]
impl SessionFactory for BrowserSessionFactory {
    async fn open(&self) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(BrowserSession::launch(self.config.clone()).await?))
    }
}

pub struct HttpSessionFactory {
    config: CheckCarVinConfig,
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(HttpSession::new(self.config.clone())))
    }
}

pub struct BrowserSession {
    config: CheckCarVinConfig,
    browser: Browser,
    page: chromiumoxide::Page,
    handler: JoinHandle<()>,
}

#[derive(Deserialize)]
struct PageFetch {
    status: u16,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    base64: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl BrowserSession {
    pub async fn launch(config: CheckCarVinConfig) -> Result<Self, SessionError> {
        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .build()
            .map_err(SessionError::Launch)?;
        let (browser, mut events) = Browser::launch(browser_config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        page.set_user_agent(BROWSER_USER_AGENT)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        Ok(Self {
            config,
            browser,
            page,
            handler,
        })
    }

    async fn fetch_in_page(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
        binary: bool,
    ) -> Result<PageFetch, SessionError> {
        let expression = fetch_script(&self.config.url(path), method, headers, body, binary);
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(SessionError::Request)?;
        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|err| SessionError::Request(err.to_string()))?;
        let fetched: PageFetch = result
            .into_value()
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        if let Some(error) = &fetched.error {
            return Err(SessionError::Request(error.clone()));
        }
        Ok(fetched)
    }
}

/// In-page `fetch` returning `{status, text}` or `{status, base64}`.
fn fetch_script(
    url: &str,
    method: &str,
    headers: &[(String, String)],
    body: Option<&Value>,
    binary: bool,
) -> String {
    let header_map: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let init = json!({
        "method": method,
        "headers": header_map,
        "body": body.map(Value::to_string),
    });
    let reader = if binary {
        "const buf = new Uint8Array(await res.arrayBuffer()); let bin = ''; \
         for (let i = 0; i < buf.length; i += 0x8000) { bin += String.fromCharCode.apply(null, buf.subarray(i, i + 0x8000)); } \
         return { status: res.status, base64: btoa(bin) };"
    } else {
        "return { status: res.status, text: await res.text() };"
    };
    format!(
        "(async () => {{ try {{ const init = {init}; if (init.body === null) delete init.body; \
         const res = await fetch({url}, init); {reader} }} \
         catch (err) {{ return {{ status: 0, error: String(err) }}; }} }})()",
        init = init,
        url = Value::String(url.to_string()),
    )
}

fn parse_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[async_trait]
impl Session for BrowserSession {
    async fn navigate_and_settle(&self, settle: Duration) -> Result<(), SessionError> {
        debug!(target = "vinrelay.checkcarvin", origin = %self.config.origin, "session_navigate");
        self.page
            .goto(self.config.origin.as_str())
            .await
            .map_err(|err| SessionError::Navigation(err.to_string()))?;
        sleep(settle).await;
        Ok(())
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<SessionResponse, SessionError> {
        let fetched = self
            .fetch_in_page(method.as_str(), path, headers, body, false)
            .await?;
        Ok(SessionResponse {
            status: fetched.status,
            body: parse_body(fetched.text.as_deref().unwrap_or_default()),
        })
    }

    async fn request_bytes(
        &self,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<(u16, Vec<u8>), SessionError> {
        let fetched = self.fetch_in_page("GET", path, headers, None, true).await?;
        let bytes = STANDARD
            .decode(fetched.base64.unwrap_or_default())
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        Ok((fetched.status, bytes))
    }

    async fn cookie(&self, name: &str) -> Option<String> {
        match self.page.get_cookies().await {
            Ok(cookies) => cookies
                .into_iter()
                .find(|cookie| cookie.name == name)
                .map(|cookie| cookie.value),
            Err(err) => {
                warn!(target = "vinrelay.checkcarvin", error = %err, "cookie_read_failed");
                None
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(target = "vinrelay.checkcarvin", error = %err, "browser_close_failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

pub struct HttpSession {
    config: CheckCarVinConfig,
    jar: Arc<Jar>,
    http: Client,
}

impl HttpSession {
    pub fn new(config: CheckCarVinConfig) -> Self {
        let jar = Arc::new(Jar::default());
        let http = build_session_client(jar.clone());
        Self { config, jar, http }
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn navigate_and_settle(&self, settle: Duration) -> Result<(), SessionError> {
        self.http
            .get(self.config.origin.as_str())
            .send()
            .await
            .map_err(|err| SessionError::Navigation(err.to_string()))?;
        sleep(settle).await;
        Ok(())
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<SessionResponse, SessionError> {
        let mut builder = Self::apply_headers(
            self.http.request(method, self.config.url(path)),
            headers,
        );
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| SessionError::Request(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        Ok(SessionResponse {
            status,
            body: parse_body(&text),
        })
    }

    async fn request_bytes(
        &self,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<(u16, Vec<u8>), SessionError> {
        let response = Self::apply_headers(self.http.get(self.config.url(path)), headers)
            .send()
            .await
            .map_err(|err| SessionError::Request(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        Ok((status, bytes.to_vec()))
    }

    async fn cookie(&self, name: &str) -> Option<String> {
        let url = self.config.origin.parse().ok()?;
        let header = self.jar.cookies(&url)?;
        header.to_str().ok()?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_script_embeds_escaped_arguments() {
        let script = fetch_script(
            "https://api.checkcar.vin/api/v1/auth/login",
            "POST",
            &[("x-xsrf-token".into(), "a\"b".into())],
            Some(&json!({"email": "pool@example.com"})),
            false,
        );
        assert!(script.contains("\"https://api.checkcar.vin/api/v1/auth/login\""));
        assert!(script.contains("a\\\"b"));
        assert!(script.contains("res.text()"));
        assert!(!script.contains("arrayBuffer"));
    }

    #[test]
    fn binary_fetch_reads_array_buffer() {
        let script = fetch_script("https://x.test/pdf", "GET", &[], None, true);
        assert!(script.contains("arrayBuffer"));
        assert!(script.contains("\"body\":null"));
    }

    #[test]
    fn non_json_bodies_are_kept_as_text() {
        assert_eq!(parse_body("{\"ok\":true}"), json!({"ok": true}));
        assert_eq!(parse_body("<html>challenge</html>"), json!("<html>challenge</html>"));
    }

    #[tokio::test]
    async fn http_session_reads_cookies_from_jar() {
        let session = HttpSession::new(CheckCarVinConfig::default());
        let url = "https://api.checkcar.vin".parse().unwrap();
        session
            .jar
            .add_cookie_str("XSRF-TOKEN=abc%3D; Path=/", &url);
        assert_eq!(session.cookie("XSRF-TOKEN").await.as_deref(), Some("abc%3D"));
        assert_eq!(session.cookie("missing").await, None);
    }
}
