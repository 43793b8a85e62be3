//! Notification gate: deliver operator-facing status messages.
//!
//! A send either succeeds or fails; errors never escape this module. Whether
//! a failure is fatal is decided by the caller (see `supervisor`).
use crate::config::NotifyConfig;
use crate::timer::format_hms;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by [`Notifier::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Delivers a text message to an external channel.
pub trait Notifier: Send + Sync {
    /// Human-readable channel name (e.g., "telegram", "disabled").
    fn name(&self) -> &str;

    /// Send `text`. Resolves to `true` only if the channel accepted it.
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a>;
}

/// Messages the supervisor sends at lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Started { duration_secs: u64 },
    Warning { remaining_secs: u64 },
    Expired,
    Stopped,
    Shutdown,
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::Started { duration_secs } => {
                format!("Worker started. Session timer: {}", format_hms(*duration_secs))
            }
            Notice::Warning { remaining_secs } => format!(
                "Session ends in {}. Refresh the timer to keep the worker running.",
                format_hms(*remaining_secs)
            ),
            Notice::Expired => "Session timer expired. Stopping worker.".to_string(),
            Notice::Stopped => "Worker stopped.".to_string(),
            Notice::Shutdown => "Control plane shutting down.".to_string(),
        }
    }
}

/// Channel used when no token or chat id is configured. Every send fails.
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn name(&self) -> &str {
        "disabled"
    }

    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            tracing::warn!(text, "notifications disabled (missing token/chat id)");
            false
        })
    }
}

/// Telegram Bot API `sendMessage` channel.
pub struct TelegramNotifier {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        chat_id: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: send_message_url(api_base, bot_token),
            chat_id: chat_id.to_string(),
        })
    }
}

fn send_message_url(api_base: &str, bot_token: &str) -> String {
    format!(
        "{}/bot{}/sendMessage",
        api_base.trim_end_matches('/'),
        bot_token
    )
}

impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            tracing::debug!(text, "sending notification");
            let body = serde_json::json!({"chat_id": self.chat_id, "text": text});
            match self.client.post(&self.url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(text, "notification sent");
                    true
                }
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    tracing::warn!(%status, detail = %detail, "notification rejected");
                    false
                }
                Err(e) => {
                    // Strip the URL: it embeds the bot token.
                    tracing::warn!(error = %e.without_url(), "notification transport error");
                    false
                }
            }
        })
    }
}

/// Build the configured channel, falling back to [`DisabledNotifier`].
pub fn from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    if !config.is_enabled() {
        tracing::warn!("telegram token/chat id not set; notifications disabled, sessions cannot start");
        return Arc::new(DisabledNotifier);
    }
    match TelegramNotifier::new(
        &config.api_base,
        config.bot_token.trim(),
        config.chat_id.trim(),
        config.timeout(),
    ) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            tracing::error!(error = %e, "failed to build HTTP client; notifications disabled");
            Arc::new(DisabledNotifier)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::Mutex;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_notice_text() {
        assert_eq!(
            Notice::Started { duration_secs: 3600 }.text(),
            "Worker started. Session timer: 1h 0m 0s"
        );
        assert!(Notice::Warning { remaining_secs: 300 }
            .text()
            .starts_with("Session ends in 0h 5m 0s"));
    }

    #[test]
    fn test_send_message_url_trims_slash() {
        assert_eq!(
            send_message_url("https://api.telegram.org/", "123:abc"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_disabled_always_fails() {
        assert!(!DisabledNotifier.send("hello").await);
        let notifier = from_config(&NotifyConfig::default());
        assert_eq!(notifier.name(), "disabled");
        assert!(!notifier.send("hello").await);
    }

    #[tokio::test]
    async fn test_telegram_success_posts_chat_and_text() {
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        let router = Router::new().route(
            "/bottoken/sendMessage",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = Some(body);
                    Json(serde_json::json!({"ok": true}))
                }
            }),
        );
        let base = serve(router).await;

        let notifier = TelegramNotifier::new(&base, "token", "42", Duration::from_secs(5)).unwrap();
        assert!(notifier.send("Worker stopped.").await);

        let body = received.lock().unwrap().clone().unwrap();
        assert_eq!(body["chat_id"], "42");
        assert_eq!(body["text"], "Worker stopped.");
    }

    #[tokio::test]
    async fn test_telegram_error_status_fails() {
        let router = Router::new().route(
            "/bottoken/sendMessage",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad token") }),
        );
        let base = serve(router).await;
        let notifier = TelegramNotifier::new(&base, "token", "42", Duration::from_secs(5)).unwrap();
        assert!(!notifier.send("hi").await);
    }

    #[tokio::test]
    async fn test_telegram_timeout_fails() {
        let router = Router::new().route(
            "/bottoken/sendMessage",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let base = serve(router).await;
        let notifier =
            TelegramNotifier::new(&base, "token", "42", Duration::from_millis(200)).unwrap();
        assert!(!notifier.send("hi").await);
    }

    #[tokio::test]
    async fn test_telegram_connection_refused_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let notifier = TelegramNotifier::new(
            &format!("http://{addr}"),
            "token",
            "42",
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(!notifier.send("hi").await);
    }
}
