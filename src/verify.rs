//! Human verification before an instance is created.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[async_trait]
pub trait Verifier: Send + Sync + 'static {
    /// Check a challenge response token. `remote_ip` is forwarded to the
    /// verification service when known.
    async fn verify(&self, response: &str, remote_ip: Option<&str>) -> Result<()>;
}

/// Cloudflare Turnstile siteverify client.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

impl TurnstileVerifier {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(secret, TURNSTILE_VERIFY_URL)
    }

    pub fn with_endpoint(secret: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            secret: secret.into(),
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Verifier for TurnstileVerifier {
    async fn verify(&self, response: &str, remote_ip: Option<&str>) -> Result<()> {
        if response.is_empty() {
            return Err(Error::Verification("missing challenge response".into()));
        }

        let mut form = vec![("secret", self.secret.as_str()), ("response", response)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let reply: SiteVerifyResponse = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Verification(format!("siteverify request: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Verification(format!("siteverify response: {}", e)))?;

        if reply.success {
            debug!("Challenge response accepted");
            Ok(())
        } else {
            Err(Error::Verification(format!(
                "invalid captcha: {}",
                reply.error_codes.join(",")
            )))
        }
    }
}

/// Accepts every request. Used when no verification secret is configured.
pub struct AllowAll;

#[async_trait]
impl Verifier for AllowAll {
    async fn verify(&self, _response: &str, remote_ip: Option<&str>) -> Result<()> {
        warn!(remote_ip = ?remote_ip, "Human verification disabled, accepting request");
        Ok(())
    }
}
