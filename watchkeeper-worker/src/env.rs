//! Launch environment handed over by the supervisor.
use std::time::Duration;

const DEFAULT_TIMER_DURATION_SECS: u64 = 60 * 60;
const DEFAULT_FAILSAFE_BUFFER_SECS: u64 = 5 * 60;

/// Errors produced while reading the launch environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvError::Missing(key) => write!(f, "missing required environment variable {key}"),
            EnvError::Invalid { key, value } => {
                write!(f, "invalid value for {key}: {value:?} (expected whole seconds)")
            }
        }
    }
}

impl std::error::Error for EnvError {}

#[derive(Clone)]
pub struct WorkerEnv {
    pub email: String,
    // Read by the probe through the inherited environment.
    #[allow(dead_code)]
    pub password: String,
    #[allow(dead_code)]
    pub otp: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub timer_duration: Duration,
    pub failsafe_buffer: Duration,
}

impl std::fmt::Debug for WorkerEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEnv")
            .field("email", &self.email)
            .field("telegram_enabled", &self.telegram_enabled())
            .field("timer_duration", &self.timer_duration)
            .field("failsafe_buffer", &self.failsafe_buffer)
            .finish_non_exhaustive()
    }
}

impl WorkerEnv {
    pub fn from_process_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnvError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(EnvError::Missing(key))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let seconds = |key: &'static str, default: u64| match lookup(key) {
            None => Ok(Duration::from_secs(default)),
            Some(v) if v.trim().is_empty() => Ok(Duration::from_secs(default)),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| EnvError::Invalid { key, value: v }),
        };

        Ok(Self {
            email: required("EMAIL")?,
            password: required("PASSWORD")?,
            otp: required("OTP")?,
            telegram_bot_token: optional("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: optional("TELEGRAM_CHAT_ID"),
            timer_duration: seconds("TIMER_DURATION", DEFAULT_TIMER_DURATION_SECS)?,
            failsafe_buffer: seconds("FAILSAFE_BUFFER", DEFAULT_FAILSAFE_BUFFER_SECS)?,
        })
    }

    /// Hard runtime cap: the session duration plus the failsafe buffer.
    pub fn max_runtime(&self) -> Duration {
        self.timer_duration + self.failsafe_buffer
    }

    pub fn telegram_enabled(&self) -> bool {
        self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDS: [(&str, &str); 3] = [("EMAIL", "a@b.c"), ("PASSWORD", "pw"), ("OTP", "123456")];

    #[test]
    fn test_defaults_when_only_credentials_set() {
        let env = WorkerEnv::from_lookup(lookup(&CREDS)).unwrap();
        assert_eq!(env.timer_duration, Duration::from_secs(3600));
        assert_eq!(env.failsafe_buffer, Duration::from_secs(300));
        assert_eq!(env.max_runtime(), Duration::from_secs(3900));
        assert!(!env.telegram_enabled());
    }

    #[test]
    fn test_reads_duration_and_channel() {
        let mut pairs = CREDS.to_vec();
        pairs.extend([
            ("TIMER_DURATION", "120"),
            ("FAILSAFE_BUFFER", "30"),
            ("TELEGRAM_BOT_TOKEN", "tok"),
            ("TELEGRAM_CHAT_ID", "42"),
        ]);
        let env = WorkerEnv::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(env.max_runtime(), Duration::from_secs(150));
        assert!(env.telegram_enabled());
    }

    #[test]
    fn test_missing_credential_is_an_error() {
        let err = WorkerEnv::from_lookup(lookup(&CREDS[..2])).unwrap_err();
        assert_eq!(err, EnvError::Missing("OTP"));
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("TIMER_DURATION", "an hour"));
        let err = WorkerEnv::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, EnvError::Invalid { key: "TIMER_DURATION", .. }));
        assert!(err.to_string().contains("TIMER_DURATION"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let env = WorkerEnv::from_lookup(lookup(&CREDS)).unwrap();
        let debug = format!("{env:?}");
        assert!(!debug.contains("pw"));
        assert!(!debug.contains("123456"));
    }
}
