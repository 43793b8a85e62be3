//! Record notifications sent straight from the worker.
use crate::env::WorkerEnv;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const TELEGRAM_API: &str = "https://api.telegram.org";

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

pub trait Notifier: Send + Sync {
    /// Resolves to `true` only if the channel accepted the message.
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a>;
}

/// Telegram channel; `None` config means disabled and every send fails.
pub struct Telegram {
    target: Option<(reqwest::Client, String, String)>,
}

impl Telegram {
    pub fn from_env(env: &WorkerEnv) -> Self {
        let target = match (&env.telegram_bot_token, &env.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                match reqwest::Client::builder().timeout(SEND_TIMEOUT).build() {
                    Ok(client) => Some((
                        client,
                        format!("{TELEGRAM_API}/bot{}/sendMessage", token.trim()),
                        chat_id.trim().to_string(),
                    )),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build HTTP client");
                        None
                    }
                }
            }
            _ => None,
        };
        Self { target }
    }
}

impl Notifier for Telegram {
    fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            let Some((client, url, chat_id)) = &self.target else {
                tracing::warn!("telegram disabled (missing token/chat id)");
                return false;
            };
            let body = serde_json::json!({"chat_id": chat_id, "text": text});
            match client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(text, "telegram sent");
                    true
                }
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), "telegram rejected message");
                    false
                }
                Err(e) => {
                    tracing::warn!(error = %e.without_url(), "telegram error");
                    false
                }
            }
        })
    }
}

pub fn record_message(record: &str) -> String {
    format!("Record accepted:\n\n{record}")
}
