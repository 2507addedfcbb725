use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::BillingConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Verifies `t=<unix>,v1=<hex hmac>` signatures over `"{t}.{body}"`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// None when no webhook secret is configured.
    pub fn from_config(config: &BillingConfig) -> Option<Self> {
        if config.webhook_secret.is_empty() {
            return None;
        }
        Some(Self::new(
            config.webhook_secret.clone(),
            config.signature_tolerance_secs,
        ))
    }

    fn mac(&self, timestamp: &str, payload: &[u8]) -> AppResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| AppError::Internal("HMAC key error".into()))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Header value for `payload` signed at `at`.
    pub fn sign(&self, payload: &[u8], at: DateTime<Utc>) -> AppResult<String> {
        let timestamp = at.timestamp().to_string();
        let sig = hex::encode(self.mac(&timestamp, payload)?.finalize().into_bytes());
        Ok(format!("t={timestamp},v1={sig}"))
    }

    pub fn verify(&self, payload: &[u8], header: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut timestamp = "";
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(v)) => timestamp = v,
                (Some("v1"), Some(v)) => signatures.push(v),
                _ => {}
            }
        }

        if timestamp.is_empty() || signatures.is_empty() {
            return Err(AppError::BadRequest("Invalid webhook signature header".into()));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid webhook timestamp".into()))?;
        if (now.timestamp() - ts).abs() > self.tolerance_secs {
            return Err(AppError::BadRequest("Webhook timestamp outside tolerance".into()));
        }

        // Several v1 entries are allowed while a secret is being rotated.
        let matched = signatures.iter().any(|sig| match hex::decode(sig) {
            Ok(bytes) => self
                .mac(timestamp, payload)
                .map(|mac| mac.verify_slice(&bytes).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        });
        if !matched {
            return Err(AppError::BadRequest(
                "Webhook signature verification failed".into(),
            ));
        }
        Ok(())
    }
}
