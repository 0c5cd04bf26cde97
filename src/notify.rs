use crate::i18n::{Locale, message};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType, transport::smtp::authentication::Credentials,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("smtp transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("could not build message: {0}")]
    Build(String),
}

/// Delivery of the "report ready" email. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_report_ready(
        &self,
        email: &str,
        link: &str,
        locale: Locale,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|v| !v.is_empty())?;
        let user = std::env::var("SMTP_USER").ok();
        Some(Self {
            host,
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(465),
            from: std::env::var("SMTP_FROM")
                .ok()
                .or_else(|| user.clone())
                .unwrap_or_else(|| "reports@localhost".to_string()),
            user,
            password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

pub struct SmtpNotifier {
    config: SmtpConfig,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        // 465 is implicit TLS, anything else negotiates STARTTLS
        let mut builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        }
        .port(config.port);
        if let (Some(user), Some(pass)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(Self {
            mailer: builder.build(),
            config,
        })
    }
}

pub fn report_ready_html(link: &str, locale: Locale) -> String {
    let button = message("email_button", locale);
    let intro = match locale {
        Locale::En => "Thank you for your payment. Your vehicle report is ready.",
        Locale::Sq => "Faleminderit për pagesën. Raporti i automjetit tuaj është gati.",
    };
    format!(
        "<p>{intro}</p>\
         <p style=\"text-align:center;\"><a href=\"{link}\" style=\"display:inline-block;padding:12px 24px;\
         background-color:#e60023;color:#ffffff;text-decoration:none;border-radius:6px;font-weight:bold;\">{button}</a></p>\
         <p><a href=\"{link}\">{link}</a></p>"
    )
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_report_ready(
        &self,
        email: &str,
        link: &str,
        locale: Locale,
    ) -> Result<(), NotifyError> {
        let mail = Message::builder()
            .from(self.config.from.parse()?)
            .to(email.parse()?)
            .subject(message("email_subject", locale))
            .header(ContentType::TEXT_HTML)
            .body(report_ready_html(link, locale))
            .map_err(|err| NotifyError::Build(err.to_string()))?;
        self.mailer.send(mail).await?;
        info!(target = "vinrelay.notify", to = %email, locale = locale.code(), "report_email_sent");
        Ok(())
    }
}

/// Stand-in when SMTP is not configured: the link only goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_report_ready(
        &self,
        email: &str,
        link: &str,
        locale: Locale,
    ) -> Result<(), NotifyError> {
        info!(target = "vinrelay.notify", to = %email, link = %link, locale = locale.code(), "report_email_skipped");
        Ok(())
    }
}

pub fn notifier_from_env() -> Arc<dyn Notifier> {
    match SmtpConfig::from_env().map(SmtpNotifier::new) {
        Some(Ok(notifier)) => Arc::new(notifier),
        Some(Err(err)) => {
            tracing::warn!(target = "vinrelay.notify", error = %err, "smtp_setup_failed");
            Arc::new(LogNotifier)
        }
        None => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every send for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String, Locale)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_report_ready(
            &self,
            email: &str,
            link: &str,
            locale: Locale,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_string(), link.to_string(), locale));
            Ok(())
        }
    }
}
