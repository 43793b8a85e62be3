//! Process supervisor: start, stop, refresh and report on the single worker
//! session, running the countdown watchdog and applying the
//! notification-failure kill policy.
//!
//! Locking:
//! - `lifecycle` (async) serializes Start, Stop and RefreshTimer. It may be
//!   held across process termination, never across notification sends.
//! - `process` and `timer` (sync) are only held for short read/copy/update
//!   sections, so status reads never wait on worker I/O. When both are
//!   needed, `process` is taken first.
//! - `watchdog` guards watchdog-loop creation.
use crate::config::{WatchkeeperConfig, WorkerConfig};
use crate::notify::{Notice, Notifier};
use crate::status::{SessionInfo, StatusReport};
use crate::timer::{Tick, TimerSettings, TimerState};
use crate::worker::{
    terminate_group, ExitWatch, SignalDelivery, WorkerEnv, WorkerError, WorkerHandle,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A worker's failsafe starts at spawn, so within this window after spawn
/// it is still ahead of a freshly rearmed countdown.
const RESET_GRACE: Duration = Duration::from_secs(1);

/// Resolved supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub worker: WorkerConfig,
    pub timer: TimerSettings,
    pub failsafe_buffer_secs: u64,
    pub grace_period: Duration,
    /// Resets requested this soon after spawn are not signalled; the worker
    /// may not have installed its SIGUSR1 handler yet.
    pub reset_grace: Duration,
    /// Countdown granularity. One second in production.
    pub tick: Duration,
    /// Notification channel settings forwarded to the worker.
    pub notify_bot_token: String,
    pub notify_chat_id: String,
}

impl SupervisorSettings {
    pub fn from_config(config: &WatchkeeperConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            timer: TimerSettings {
                duration_secs: config.timer.duration_secs,
                warning_secs: config.timer.warning_secs,
            },
            failsafe_buffer_secs: config.timer.failsafe_buffer_secs,
            grace_period: config.stop.grace_period(),
            reset_grace: RESET_GRACE,
            tick: Duration::from_secs(1),
            notify_bot_token: config.notify.bot_token.clone(),
            notify_chat_id: config.notify.chat_id.clone(),
        }
    }
}

/// Credentials the worker needs for its task. Opaque to the supervisor.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub otp: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("otp", &"<redacted>")
            .finish()
    }
}

/// Result of [`Supervisor::start`].
#[derive(Debug)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A live worker exists; nothing was changed.
    AlreadyRunning,
    /// The "started" notification failed; the worker has been killed.
    NotificationFailed,
    SpawnFailed(WorkerError),
}

/// Result of [`Supervisor::refresh_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// No live worker; the countdown was left untouched.
    NotRunning,
}

struct Session {
    generation: u64,
    handle: WorkerHandle,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    notifier: Arc<dyn Notifier>,
    lifecycle: tokio::sync::Mutex<()>,
    process: Mutex<Option<Session>>,
    timer: Mutex<TimerState>,
    watchdog: Mutex<Option<u64>>,
    stop_signal: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        let timer = TimerState::new(settings.timer);
        Arc::new(Self {
            settings,
            notifier,
            lifecycle: tokio::sync::Mutex::new(()),
            process: Mutex::new(None),
            timer: Mutex::new(timer),
            watchdog: Mutex::new(None),
            stop_signal: Notify::new(),
        })
    }

    fn process(&self) -> MutexGuard<'_, Option<Session>> {
        lock(&self.process)
    }

    fn timer(&self) -> MutexGuard<'_, TimerState> {
        lock(&self.timer)
    }

    fn worker_alive(&self) -> bool {
        self.process()
            .as_ref()
            .is_some_and(|session| session.handle.is_alive())
    }

    fn worker_env(&self, credentials: &Credentials) -> WorkerEnv {
        WorkerEnv::new()
            .set("EMAIL", &credentials.email)
            .set("PASSWORD", &credentials.password)
            .set("OTP", &credentials.otp)
            .set("TELEGRAM_BOT_TOKEN", &self.settings.notify_bot_token)
            .set("TELEGRAM_CHAT_ID", &self.settings.notify_chat_id)
            .set(
                "TIMER_DURATION",
                self.settings.timer.duration_secs.to_string(),
            )
            .set(
                "FAILSAFE_BUFFER",
                self.settings.failsafe_buffer_secs.to_string(),
            )
    }

    /// Start a worker session unless one is already live.
    ///
    /// The worker is killed again if the "started" notification cannot be
    /// delivered: a session nobody was told about is not allowed to run.
    pub async fn start(self: &Arc<Self>, credentials: Credentials) -> StartOutcome {
        let (generation, pid, exit) = {
            let _lifecycle = self.lifecycle.lock().await;
            if self.worker_alive() {
                tracing::info!("start requested while worker is running");
                return StartOutcome::AlreadyRunning;
            }

            let generation = self.timer().begin_session();
            tracing::debug!(email = %credentials.email, generation, "starting worker session");
            let handle = match WorkerHandle::spawn(&self.settings.worker, &self.worker_env(&credentials))
            {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(error = %e, "worker failed to start");
                    self.timer().zero_if_current(generation);
                    return StartOutcome::SpawnFailed(e);
                }
            };
            let pid = handle.pid();
            let exit = handle.exit_watch();
            *self.process() = Some(Session { generation, handle });
            (generation, pid, exit)
        };

        let started = Notice::Started {
            duration_secs: self.settings.timer.duration_secs,
        };
        if !self.notifier.send(&started.text()).await {
            tracing::error!(pid, "start notification failed, killing worker");
            self.stop_session(Some(generation)).await;
            self.timer().zero_if_current(generation);
            return StartOutcome::NotificationFailed;
        }

        self.ensure_watchdog(generation);
        tokio::spawn(Arc::clone(self).supervise_exit(generation, exit));
        tracing::info!(pid, generation, "worker session started");
        StartOutcome::Started { pid }
    }

    /// Terminate the worker session, if any. Safe to call in any state.
    ///
    /// Returns true if a session was torn down by this call.
    pub async fn stop(&self) -> bool {
        self.stop_session(None).await
    }

    /// Stop the current session, or only session `only` when given.
    async fn stop_session(&self, only: Option<u64>) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let target = self
            .process()
            .as_ref()
            .filter(|session| only.map_or(true, |g| g == session.generation))
            .map(|session| {
                (
                    session.generation,
                    session.handle.pid(),
                    session.handle.pgid(),
                    session.handle.exit_watch(),
                )
            });

        let Some((generation, pid, pgid, exit)) = target else {
            if only.is_none() {
                self.timer().zero();
            }
            return false;
        };

        self.timer().request_stop();
        self.stop_signal.notify_waiters();

        let outcome = terminate_group(pgid, exit, self.settings.grace_period).await;
        tracing::info!(pid, ?outcome, "worker terminated");

        {
            let mut process = self.process();
            if process
                .as_ref()
                .is_some_and(|session| session.generation == generation)
            {
                *process = None;
            }
        }
        self.timer().zero_if_current(generation);
        true
    }

    /// Reset the countdown and the worker's failsafe clock. No-op without a live worker.
    pub async fn refresh_timer(&self) -> RefreshOutcome {
        let _lifecycle = self.lifecycle.lock().await;

        let process = self.process();
        let Some(session) = process.as_ref().filter(|s| s.handle.is_alive()) else {
            tracing::debug!("refresh requested with no worker running");
            return RefreshOutcome::NotRunning;
        };

        self.timer().rearm();
        if session.handle.uptime() < self.settings.reset_grace {
            tracing::debug!(pid = session.handle.pid(), "worker just started, reset signal skipped");
            return RefreshOutcome::Refreshed;
        }
        match session.handle.send_reset() {
            Ok(SignalDelivery::Delivered) => {
                tracing::info!(pid = session.handle.pid(), "session timer refreshed")
            }
            Ok(SignalDelivery::AlreadyGone) => {
                tracing::debug!(pid = session.handle.pid(), "worker exited before reset signal")
            }
            Err(e) => tracing::warn!(error = %e, "failed to reset worker failsafe"),
        }
        RefreshOutcome::Refreshed
    }

    /// Snapshot of liveness and countdown.
    pub fn status(&self) -> StatusReport {
        let remaining = self.timer().remaining();
        let running = self.worker_alive();
        StatusReport::new(running, remaining)
    }

    /// Pid and start time of the live worker, if any.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.process()
            .as_ref()
            .filter(|session| session.handle.is_alive())
            .map(|session| SessionInfo {
                pid: session.handle.pid(),
                started_at: session.handle.started_at(),
            })
    }

    /// Best-effort notification sent when the control plane is terminated.
    pub async fn announce_shutdown(&self) {
        if !self.notifier.send(&Notice::Shutdown.text()).await {
            tracing::warn!("shutdown notification failed");
        }
    }

    /// Wait for the session's worker to exit, then tear the session down.
    async fn supervise_exit(self: Arc<Self>, generation: u64, mut exit: ExitWatch) {
        let status = exit.wait().await;
        tracing::info!(generation, code = ?status.code, signal = ?status.signal, "worker session ended");

        {
            let mut process = self.process();
            if process
                .as_ref()
                .is_some_and(|session| session.generation == generation)
            {
                *process = None;
            }
        }
        self.timer().zero_if_current(generation);

        if !self.notifier.send(&Notice::Stopped.text()).await {
            tracing::warn!("stopped notification failed");
        }
    }

    fn ensure_watchdog(self: &Arc<Self>, generation: u64) {
        let mut active = lock(&self.watchdog);
        if *active == Some(generation) {
            return;
        }
        // A stop and a newer start may have landed while this session's
        // start notice was in flight.
        if self.timer().generation() != generation {
            tracing::debug!(generation, "session superseded, no watchdog");
            return;
        }
        *active = Some(generation);
        tokio::spawn(Arc::clone(self).run_watchdog(generation));
    }

    /// Generation of the running watchdog loop, if any.
    #[allow(dead_code)]
    pub fn active_watchdog(&self) -> Option<u64> {
        *lock(&self.watchdog)
    }

    async fn run_watchdog(self: Arc<Self>, generation: u64) {
        let period = self.settings.tick;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        tracing::debug!(generation, "watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop_signal.notified() => {}
            }

            let alive = self.worker_alive();
            let tick = self.timer().tick(generation, alive);
            match tick {
                Tick::Counting { remaining } => tracing::trace!(generation, remaining, "tick"),
                Tick::Superseded | Tick::Stopped => break,
                Tick::WorkerGone => {
                    tracing::info!(generation, "worker no longer alive, watchdog exiting");
                    break;
                }
                Tick::Warn { remaining } => {
                    let warning = Notice::Warning {
                        remaining_secs: remaining,
                    };
                    if !self.notifier.send(&warning.text()).await {
                        tracing::error!(remaining, "warning notification failed, killing worker");
                        self.stop_session(Some(generation)).await;
                        break;
                    }
                }
                Tick::Expired => {
                    tracing::warn!(generation, "session timer expired, stopping worker");
                    if !self.notifier.send(&Notice::Expired.text()).await {
                        tracing::warn!("expiry notification failed");
                    }
                    self.stop_session(Some(generation)).await;
                    break;
                }
            }
        }

        let mut active = lock(&self.watchdog);
        if *active == Some(generation) {
            *active = None;
        }
        drop(active);
        self.timer().zero_if_current(generation);
        tracing::debug!(generation, "watchdog stopped");
    }
}
