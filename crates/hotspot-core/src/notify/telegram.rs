// Telegram Bot API transport (`sendMessage`).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{Channel, Transport};
use crate::error::CoreError;

const API_BASE: &str = "https://api.telegram.org/";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub timeout: Duration,
    pub api_base: Option<Url>,
}

#[derive(Debug, Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramTransport {
    http: reqwest::Client,
    base: Url,
    token: SecretString,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Config {
                message: format!("failed to build Telegram HTTP client: {e}"),
            })?;
        let base = match config.api_base {
            Some(base) => base,
            None => Url::parse(API_BASE).map_err(|e| CoreError::Config {
                message: format!("invalid Telegram API URL: {e}"),
            })?,
        };
        Ok(Self {
            http,
            base,
            token: config.bot_token,
        })
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), CoreError> {
        let url = self
            .base
            .join(&format!("bot{}/sendMessage", self.token.expose_secret()))
            .map_err(|e| CoreError::Config {
                message: format!("invalid Telegram URL: {e}"),
            })?;
        // the token is part of the path, keep it out of logs
        debug!(chat_id = recipient, "POST telegram sendMessage");
        let resp = self
            .http
            .post(url)
            .json(&json!({ "chat_id": recipient, "text": text }))
            .send()
            .await
            .map_err(|e| CoreError::Messaging {
                message: format!("telegram unreachable: {}", e.without_url()),
            })?;

        let status = resp.status();
        let reply: BotReply = resp.json().await.map_err(|e| CoreError::Messaging {
            message: format!("unreadable telegram reply ({status}): {}", e.without_url()),
        })?;
        if reply.ok {
            Ok(())
        } else {
            Err(CoreError::Messaging {
                message: reply
                    .description
                    .unwrap_or_else(|| format!("telegram answered {status}")),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, TelegramTransport) {
        let server = MockServer::start().await;
        let transport = TelegramTransport::new(TelegramConfig {
            bot_token: "123:abc".to_owned().into(),
            timeout: Duration::from_secs(2),
            api_base: Some(Url::parse(&format!("{}/", server.uri())).unwrap()),
        })
        .unwrap();
        (server, transport)
    }

    #[tokio::test]
    async fn sends_message_to_chat() {
        let (server, transport) = setup().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(json!({ "chat_id": "-1001", "text": "router down" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        transport.send("-1001", "router down").await.unwrap();
    }

    #[tokio::test]
    async fn bot_errors_surface_description() {
        let (server, transport) = setup().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let err = transport.send("-1", "x").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
