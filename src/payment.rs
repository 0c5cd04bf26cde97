//! Payment collaborator: hosted checkout sessions, the encrypted inspection
//! token carried through the success redirect, and webhook verification.

use crate::http::build_client;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

const NONCE_LENGTH: usize = 12;
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment provider request failed: {0}")]
    Request(String),
    #[error("payment provider rejected the request: {0}")]
    Provider(String),
    #[error("payments are not configured")]
    NotConfigured,
    #[error("invalid redirect token")]
    InvalidToken,
    #[error("invalid webhook signature: {0}")]
    Signature(&'static str),
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub reference: String,
    pub email: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError>;
}

pub struct StripeGateway {
    http: Client,
    secret_key: String,
    base_url: String,
}

impl StripeGateway {
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            http: build_client(),
            secret_key,
            base_url: std::env::var("STRIPE_API_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
        })
    }
}

/// Where the hosted checkout sends the buyer back, and in which currency.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutSettings {
    pub fn from_env() -> Self {
        let var = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            currency: var("PAYMENT_CURRENCY", "eur"),
            success_url: var("PAYMENT_SUCCESS_URL", "http://localhost:3000/payment/success"),
            cancel_url: var("PAYMENT_CANCEL_URL", "http://localhost:3000/payment/cancel"),
        }
    }

    /// The redirect token rides on the success URL as `token=`.
    pub fn request_for(
        &self,
        reference: &str,
        email: &str,
        amount: f64,
        token: &str,
    ) -> CheckoutRequest {
        let separator = if self.success_url.contains('?') { '&' } else { '?' };
        CheckoutRequest {
            amount_cents: to_cents(amount),
            currency: self.currency.clone(),
            success_url: format!(
                "{}{separator}token={}",
                self.success_url,
                urlencoding::encode(token)
            ),
            cancel_url: self.cancel_url.clone(),
            reference: reference.to_string(),
            email: email.to_string(),
            description: format!("Vehicle history report {reference}"),
        }
    }
}

pub fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    [
        ("mode", "payment".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("client_reference_id", request.reference.clone()),
        ("customer_email", request.email.clone()),
        ("metadata[inspection_id]", request.reference.clone()),
        ("line_items[0][quantity]", "1".to_string()),
        ("line_items[0][price_data][currency]", request.currency.to_lowercase()),
        ("line_items[0][price_data][unit_amount]", request.amount_cents.to_string()),
        ("line_items[0][price_data][product_data][name]", request.description.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&checkout_form(request))
            .send()
            .await
            .map_err(|err| PaymentError::Request(err.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| PaymentError::Request(err.to_string()))?;
        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(PaymentError::Provider(format!("HTTP {status}: {message}")));
        }
        let field = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PaymentError::Provider(format!("missing `{key}`")))
        };
        let session = CheckoutSession {
            id: field("id")?,
            url: field("url")?,
        };
        info!(target = "vinrelay.api", reference = %request.reference, session_id = %session.id, "checkout_session_created");
        Ok(session)
    }
}

/// Encrypts inspection ids into URL-safe redirect tokens.
#[derive(Clone)]
pub struct RedirectCipher {
    key: [u8; 32],
}

impl RedirectCipher {
    /// 64 hex chars are taken as the raw key; any other secret is hashed.
    pub fn from_secret(secret: &str) -> Self {
        let key = hex::decode(secret.trim())
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .unwrap_or_else(|| Sha256::digest(secret.as_bytes()).into());
        Self { key }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("REDIRECT_TOKEN_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| Self::from_secret(&v))
    }

    pub fn encrypt(&self, inspection_id: &str) -> Result<String, PaymentError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, inspection_id.as_bytes())
            .map_err(|_| PaymentError::InvalidToken)?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, PaymentError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| PaymentError::InvalidToken)?;
        if sealed.len() <= NONCE_LENGTH {
            return Err(PaymentError::InvalidToken);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PaymentError::InvalidToken)?;
        String::from_utf8(plaintext).map_err(|_| PaymentError::InvalidToken)
    }
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>`) against the raw
/// body. Any matching `v1` entry within five minutes of `now` passes.
pub fn verify_stripe_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), PaymentError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(PaymentError::Signature("missing timestamp"))?;
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(PaymentError::Signature("timestamp outside tolerance"));
    }
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|_| PaymentError::Signature("unusable secret"))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(PaymentError::Signature("no matching signature"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCheckout {
    pub inspection_id: String,
    pub amount: Option<f64>,
}

/// Pulls the inspection reference and paid amount out of a
/// `checkout.session.completed` event; other events yield `None`.
pub fn completed_checkout(event: &Value) -> Option<CompletedCheckout> {
    if event.get("type").and_then(Value::as_str) != Some("checkout.session.completed") {
        return None;
    }
    let session = event.pointer("/data/object")?;
    let inspection_id = session
        .get("client_reference_id")
        .and_then(Value::as_str)
        .or_else(|| session.pointer("/metadata/inspection_id").and_then(Value::as_str))?
        .to_string();
    let amount = session
        .get("amount_total")
        .and_then(Value::as_i64)
        .map(|cents| cents as f64 / 100.0);
    Some(CompletedCheckout {
        inspection_id,
        amount,
    })
}

pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn redirect_token_round_trips_and_rejects_tampering() {
        let cipher = RedirectCipher::from_secret("not-a-hex-key");
        let token = cipher.encrypt("inspection-42").unwrap();
        assert!(!token.contains('+') && !token.contains('/'));
        assert_eq!(cipher.decrypt(&token).unwrap(), "inspection-42");

        let other = RedirectCipher::from_secret("another-secret");
        assert!(matches!(other.decrypt(&token), Err(PaymentError::InvalidToken)));
        assert!(cipher.decrypt("short").is_err());
    }

    #[test]
    fn stripe_signature_checks_mac_and_age() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_760_000_000;
        let header = format!("t={now},v1={}", sign("whsec_test", now, payload));
        assert!(verify_stripe_signature(payload, &header, "whsec_test", now + 10).is_ok());
        assert!(verify_stripe_signature(payload, &header, "whsec_other", now).is_err());
        assert!(verify_stripe_signature(payload, &header, "whsec_test", now + 301).is_err());
        assert!(verify_stripe_signature(b"{}", &header, "whsec_test", now).is_err());
    }

    #[test]
    fn completed_checkout_reads_reference_and_amount() {
        let event = json!({
            "type": "checkout.session.completed",
            "data": {"object": {"client_reference_id": "abc", "amount_total": 2499}}
        });
        assert_eq!(
            completed_checkout(&event),
            Some(CompletedCheckout { inspection_id: "abc".into(), amount: Some(24.99) })
        );
        assert!(completed_checkout(&json!({"type": "payment_intent.created"})).is_none());
    }

    #[test]
    fn success_url_carries_the_token() {
        let settings = CheckoutSettings {
            currency: "eur".into(),
            success_url: "https://shop.test/paid?src=web".into(),
            cancel_url: "https://shop.test/cancel".into(),
        };
        let request = settings.request_for("42", "a@b.c", 19.99, "tok-_x");
        assert_eq!(request.success_url, "https://shop.test/paid?src=web&token=tok-_x");
        assert_eq!(request.amount_cents, 1999);
    }

    #[test]
    fn checkout_form_uses_cents_and_reference() {
        let form = checkout_form(&CheckoutRequest {
            amount_cents: to_cents(24.99),
            currency: "EUR".into(),
            success_url: "https://x/ok".into(),
            cancel_url: "https://x/cancel".into(),
            reference: "42".into(),
            email: "a@b.c".into(),
            description: "Vehicle report".into(),
        });
        assert!(form.contains(&("line_items[0][price_data][unit_amount]".into(), "2499".into())));
        assert!(form.contains(&("line_items[0][price_data][currency]".into(), "eur".into())));
        assert!(form.contains(&("client_reference_id".into(), "42".into())));
    }
}
