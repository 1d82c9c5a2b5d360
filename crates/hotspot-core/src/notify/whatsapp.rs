// WhatsApp gateway transport
//
// Targets the common Indonesian gateway shape (Fonnte-style): POST a form
// with `target` and `message`, token in the `Authorization` header, JSON
// reply with a boolean `status`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{Channel, Transport};
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub url: Url,
    pub token: SecretString,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    #[serde(default = "default_true")]
    status: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct WhatsAppTransport {
    http: reqwest::Client,
    url: Url,
    token: SecretString,
}

impl WhatsAppTransport {
    pub fn new(config: WhatsAppConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Config {
                message: format!("failed to build WhatsApp HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: config.url,
            token: config.token,
        })
    }
}

/// Gateways expect local format without the leading `+`.
fn target(recipient: &str) -> &str {
    recipient.trim_start_matches('+')
}

#[async_trait]
impl Transport for WhatsAppTransport {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), CoreError> {
        debug!("POST {}", self.url);
        let resp = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::AUTHORIZATION, self.token.expose_secret())
            .form(&[("target", target(recipient)), ("message", text)])
            .send()
            .await
            .map_err(|e| CoreError::Messaging {
                message: format!("whatsapp gateway unreachable: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Messaging {
                message: format!("whatsapp gateway answered {status}"),
            });
        }
        let reply: GatewayReply = resp.json().await.map_err(|e| CoreError::Messaging {
            message: format!("unreadable whatsapp gateway reply: {e}"),
        })?;
        if reply.status {
            Ok(())
        } else {
            Err(CoreError::Messaging {
                message: reply
                    .reason
                    .unwrap_or_else(|| "whatsapp gateway rejected the message".into()),
            })
        }
    }
}
