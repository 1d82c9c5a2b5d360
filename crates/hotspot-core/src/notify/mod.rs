// ── Notification dispatcher ──
//
// Renders a template for an event and hands the text to the transport for
// its channel. Each transport sits behind its own circuit breaker. Dispatch
// never fails the caller: problems are logged, counted and reported in the
// returned outcome.

pub mod telegram;
pub mod template;
pub mod whatsapp;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use hotspot_routeros::{BreakerConfig, CircuitBreaker};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::metrics::{self, SharedMetrics};
use crate::model::User;

pub use telegram::{TelegramConfig, TelegramTransport};
pub use template::TemplateSet;
pub use whatsapp::{WhatsAppConfig, WhatsAppTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationEvent {
    PaymentSuccess,
    DebtSettled,
    QuotaLow,
    QuotaHabis,
    ExpirySoon,
    AutoDebtBlocked,
    ManualDebtBlocked,
    Unblocked,
    AdminAlert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    #[serde(rename = "whatsapp")]
    #[strum(serialize = "whatsapp")]
    WhatsApp,
    Telegram,
}

/// One outbound message before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: NotificationEvent,
    pub channel: Channel,
    /// Phone number (E.164) or chat id, depending on the channel.
    pub recipient: String,
    pub params: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(event: NotificationEvent, channel: Channel, recipient: impl Into<String>) -> Self {
        Self {
            event,
            channel,
            recipient: recipient.into(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_owned(), value.to_string());
        self
    }

    /// Spintax seed: same recipient + event renders the same text.
    pub fn seed(&self) -> String {
        format!("{}:{}", self.recipient, self.event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    /// Breaker open; nothing was attempted.
    SkippedOpen { retry_in_secs: u64 },
    NoTransport,
    NoTemplate,
    Failed { error: String },
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    fn channel(&self) -> Channel;

    async fn send(&self, recipient: &str, text: &str) -> Result<(), CoreError>;
}

#[derive(Debug)]
struct Route {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
}

#[derive(Debug)]
pub struct NotificationDispatcher {
    templates: TemplateSet,
    routes: Vec<Route>,
    admin_chat_id: Option<String>,
    metrics: SharedMetrics,
}

impl NotificationDispatcher {
    pub fn new(templates: TemplateSet, metrics: SharedMetrics) -> Self {
        Self {
            templates,
            routes: Vec::new(),
            admin_chat_id: None,
            metrics,
        }
    }

    /// Register a transport with its own breaker. A later transport for the
    /// same channel replaces the earlier one.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>, breaker: BreakerConfig) -> Self {
        let channel = transport.channel();
        self.routes.retain(|r| r.transport.channel() != channel);
        self.routes.push(Route {
            breaker: CircuitBreaker::new(format!("notify:{channel}"), breaker),
            transport,
        });
        self
    }

    /// Telegram chat that receives admin alerts.
    #[must_use]
    pub fn with_admin_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.admin_chat_id = Some(chat_id.into());
        self
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.routes.iter().any(|r| r.transport.channel() == channel)
    }

    /// Message a user on WhatsApp. `name` is always available to templates.
    pub async fn notify_user(
        &self,
        user: &User,
        event: NotificationEvent,
        params: BTreeMap<String, String>,
    ) -> DispatchOutcome {
        let mut n = Notification::new(event, Channel::WhatsApp, user.phone.as_str())
            .param("name", &user.full_name);
        n.params.extend(params);
        self.dispatch(&n).await
    }

    /// Alert operators on Telegram; a no-op without an admin chat.
    pub async fn alert_admins(&self, message: &str) -> DispatchOutcome {
        let Some(chat) = &self.admin_chat_id else {
            return DispatchOutcome::NoTransport;
        };
        let n = Notification::new(NotificationEvent::AdminAlert, Channel::Telegram, chat.clone())
            .param("message", message);
        self.dispatch(&n).await
    }

    pub async fn dispatch(&self, n: &Notification) -> DispatchOutcome {
        let Some(route) = self.routes.iter().find(|r| r.transport.channel() == n.channel) else {
            debug!(channel = %n.channel, event = %n.event, "no transport configured");
            return DispatchOutcome::NoTransport;
        };
        let Some(text) = self.templates.render(n.event, &n.seed(), &n.params) else {
            warn!(event = %n.event, "no template for event");
            return DispatchOutcome::NoTemplate;
        };

        if let Err(remaining) = route.breaker.check() {
            self.metrics
                .increment_labeled(metrics::NOTIFY_SKIPPED_OPEN, n.channel.as_ref());
            warn!(
                channel = %n.channel,
                event = %n.event,
                retry_in_secs = remaining.as_secs(),
                "notification skipped, circuit open"
            );
            return DispatchOutcome::SkippedOpen {
                retry_in_secs: remaining.as_secs(),
            };
        }

        match route.transport.send(&n.recipient, &text).await {
            Ok(()) => {
                route.breaker.record_success();
                self.metrics.increment_labeled(metrics::NOTIFY_SENT, n.channel.as_ref());
                info!(channel = %n.channel, event = %n.event, "notification sent");
                DispatchOutcome::Sent
            }
            Err(e) => {
                route.breaker.record_failure();
                self.metrics.increment_labeled(metrics::NOTIFY_FAILED, n.channel.as_ref());
                warn!(channel = %n.channel, event = %n.event, error = %e, "notification failed");
                DispatchOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}
