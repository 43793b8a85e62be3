//! Worker process handle: spawn the worker in its own process group, track
//! its exit, and signal or terminate the whole group.
use crate::config::WorkerConfig;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// How the worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code (None if killed by signal or if the wait itself failed).
    pub code: Option<i32>,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
}

impl WorkerExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Errors from worker process operations.
#[derive(Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// A signal could not be delivered for a reason other than the target being gone.
    Signal { pgid: i32, source: Errno },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Spawn { command, source } => {
                write!(f, "failed to spawn worker `{}`: {}", command, source)
            }
            WorkerError::Signal { pgid, source } => {
                write!(f, "failed to signal worker group {}: {}", pgid, source)
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Spawn { source, .. } => Some(source),
            WorkerError::Signal { source, .. } => Some(source),
        }
    }
}

/// Result of delivering a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    Delivered,
    /// The target no longer exists. Benign during kill races.
    AlreadyGone,
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
    /// Was already gone before we signalled it.
    AlreadyGone,
    /// Still not confirmed dead after SIGKILL and a second grace period.
    Unconfirmed,
}

/// Environment handed to every worker launch.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    vars: Vec<(String, String)>,
}

impl WorkerEnv {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.push((key.to_string(), value.into()));
        self
    }

    #[allow(dead_code)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches for the worker's exit. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<WorkerExit>>,
}

impl ExitWatch {
    /// The exit, if it has already happened.
    pub fn exit(&self) -> Option<WorkerExit> {
        *self.rx.borrow()
    }

    /// Wait until the worker exits.
    pub async fn wait(&mut self) -> WorkerExit {
        match self.rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(UNKNOWN_EXIT),
            // Reaper dropped its sender without reporting; nothing left to wait on.
            Err(_) => UNKNOWN_EXIT,
        }
    }

    /// Wait up to `timeout` for the exit. Returns true if it happened.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

const UNKNOWN_EXIT: WorkerExit = WorkerExit {
    code: None,
    signal: None,
};

/// A running (or recently exited) worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    pgid: i32,
    started_at: DateTime<Utc>,
    spawned: std::time::Instant,
    exit: ExitWatch,
}

impl WorkerHandle {
    /// Spawn the worker in a new process group with `env` added to its environment.
    ///
    /// The child is reaped by a background task that publishes its exit
    /// status; stdout and stderr are forwarded line by line to the log.
    pub fn spawn(config: &WorkerConfig, env: &WorkerEnv) -> Result<Self, WorkerError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0); // New process group for clean kill
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(command = %config.command, args = ?config.args, "spawning worker");

        let mut child = command.spawn().map_err(|e| WorkerError::Spawn {
            command: config.command.clone(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid, "stderr"));
        }

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to wait on worker");
                    UNKNOWN_EXIT
                }
            };
            tracing::info!(pid, code = ?exit.code, signal = ?exit.signal, "worker exited");
            let _ = tx.send(Some(exit));
        });

        tracing::info!(pid, "worker started");
        Ok(Self {
            pid,
            // process_group(0) makes the child its own group leader.
            pgid: pid as i32,
            started_at: Utc::now(),
            spawned: std::time::Instant::now(),
            exit: ExitWatch { rx },
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since spawn.
    pub fn uptime(&self) -> Duration {
        self.spawned.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.exit.exit().is_none()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Ask the worker to restart its failsafe clock (SIGUSR1 to the worker itself).
    pub fn send_reset(&self) -> Result<SignalDelivery, WorkerError> {
        if !self.is_alive() {
            return Ok(SignalDelivery::AlreadyGone);
        }
        classify(
            kill(Pid::from_raw(self.pid as i32), Signal::SIGUSR1),
            self.pgid,
        )
    }
}

/// Send `signal` to every process in group `pgid`.
pub fn signal_group(pgid: i32, signal: Signal) -> Result<SignalDelivery, WorkerError> {
    classify(killpg(Pid::from_raw(pgid), signal), pgid)
}

fn classify(result: nix::Result<()>, pgid: i32) -> Result<SignalDelivery, WorkerError> {
    match result {
        Ok(()) => Ok(SignalDelivery::Delivered),
        Err(Errno::ESRCH) => Ok(SignalDelivery::AlreadyGone),
        Err(e) => Err(WorkerError::Signal { pgid, source: e }),
    }
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL and wait once more.
///
/// A group that has vanished at any step counts as terminated.
pub async fn terminate_group(pgid: i32, mut exit: ExitWatch, grace: Duration) -> Termination {
    if exit.exit().is_some() {
        // Leader is reaped; sweep any descendants left in the group.
        let _ = signal_group(pgid, Signal::SIGKILL);
        return Termination::AlreadyGone;
    }

    match signal_group(pgid, Signal::SIGTERM) {
        Ok(SignalDelivery::AlreadyGone) => return Termination::AlreadyGone,
        Ok(SignalDelivery::Delivered) => {}
        Err(e) => tracing::warn!(error = %e, "SIGTERM failed, escalating"),
    }

    if exit.wait_timeout(grace).await {
        let _ = signal_group(pgid, Signal::SIGKILL);
        tracing::info!(pgid, "worker exited after SIGTERM");
        return Termination::Graceful;
    }

    tracing::warn!(pgid, grace_secs = grace.as_secs_f64(), "worker ignored SIGTERM, sending SIGKILL");
    match signal_group(pgid, Signal::SIGKILL) {
        Ok(SignalDelivery::AlreadyGone) => return Termination::Killed,
        Ok(SignalDelivery::Delivered) => {}
        Err(e) => tracing::error!(error = %e, "SIGKILL failed"),
    }

    if exit.wait_timeout(grace).await {
        Termination::Killed
    } else {
        tracing::error!(pgid, "worker still not reaped after SIGKILL");
        Termination::Unconfirmed
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, pid: u32, stream_name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "worker", pid, stream = stream_name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "worker", pid, error = %e, "worker output closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerConfig {
        WorkerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
        }
    }

    #[test]
    fn test_worker_env_later_values_win() {
        let env = WorkerEnv::new()
            .set("TIMER_DURATION", "60")
            .set("TIMER_DURATION", "120");
        assert_eq!(env.get("TIMER_DURATION"), Some("120"));
        assert_eq!(env.get("MISSING"), None);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = WorkerConfig {
            command: "nonexistent-binary-xyz".to_string(),
            args: vec![],
            working_dir: None,
        };
        let err = WorkerHandle::spawn(&config, &WorkerEnv::new()).unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let handle = WorkerHandle::spawn(&sh("exit 7"), &WorkerEnv::new()).unwrap();
        assert!(handle.pid() > 0);
        assert_eq!(handle.pgid(), handle.pid() as i32);
        let exit = handle.exit_watch().wait().await;
        assert_eq!(exit.code, Some(7));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_env_is_passed_to_worker() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!("printf '%s' \"$TIMER_DURATION\" > {}", out.display());
        let env = WorkerEnv::new().set("TIMER_DURATION", "90");
        let handle = WorkerHandle::spawn(&sh(&script), &env).unwrap();
        handle.exit_watch().wait().await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "90");
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let handle = WorkerHandle::spawn(&sh("sleep 30"), &WorkerEnv::new()).unwrap();
        let outcome = terminate_group(handle.pgid(), handle.exit_watch(), Duration::from_secs(5)).await;
        assert_eq!(outcome, Termination::Graceful);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let handle = WorkerHandle::spawn(
            &sh("trap '' TERM; while true; do sleep 0.05; done"),
            &WorkerEnv::new(),
        )
        .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = terminate_group(handle.pgid(), handle.exit_watch(), Duration::from_millis(300)).await;
        assert_eq!(outcome, Termination::Killed);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_terminate_already_exited_is_benign() {
        let handle = WorkerHandle::spawn(&sh("exit 0"), &WorkerEnv::new()).unwrap();
        handle.exit_watch().wait().await;
        assert_eq!(
            terminate_group(handle.pgid(), handle.exit_watch(), Duration::from_millis(100)).await,
            Termination::AlreadyGone
        );
        assert_eq!(handle.send_reset().unwrap(), SignalDelivery::AlreadyGone);
    }

    #[tokio::test]
    async fn test_signal_to_missing_group_is_already_gone() {
        // PIDs near i32::MAX are never allocated on Linux (pid_max <= 2^22).
        assert_eq!(
            signal_group(i32::MAX - 1, Signal::SIGTERM).unwrap(),
            SignalDelivery::AlreadyGone
        );
    }

    #[tokio::test]
    async fn test_reset_signal_reaches_worker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reset.txt");
        let script = format!(
            "trap 'echo reset >> {}' USR1; while true; do sleep 0.05; done",
            marker.display()
        );
        let handle = WorkerHandle::spawn(&sh(&script), &WorkerEnv::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handle.send_reset().unwrap(), SignalDelivery::Delivered);

        let mut seen = false;
        for _ in 0..40 {
            if std::fs::read_to_string(&marker).is_ok_and(|s| s.contains("reset")) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        terminate_group(handle.pgid(), handle.exit_watch(), Duration::from_secs(2)).await;
        assert!(seen, "worker never observed SIGUSR1");
    }
}
