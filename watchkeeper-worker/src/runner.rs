//! The worker's main loop: probe, notify on records, sleep, repeat.
//!
//! Every wait in the loop (probe attempt, retry delay, poll interval) is
//! raced against the failsafe deadline and the event stream, so a shutdown
//! or an expired failsafe is acted on without waiting for the current step.
use crate::events::WorkerEvent;
use crate::failsafe::Failsafe;
use crate::notify::{self, Notifier};
use crate::probe::{Probe, ProbeOutcome};
use crate::retry::{RetryDecision, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Why the loop ended. Maps onto the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    FailsafeTripped,
    NotifyFailed,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Shutdown => 0,
            RunOutcome::FailsafeTripped => 3,
            RunOutcome::NotifyFailed => 4,
        }
    }
}

enum Waited<T> {
    Done(T),
    Interrupted(RunOutcome),
}

/// Failsafe clock plus event stream; the two things that can cut a wait short.
struct Interrupts {
    events: mpsc::Receiver<WorkerEvent>,
    events_open: bool,
    failsafe: Failsafe,
}

impl Interrupts {
    async fn wait<T>(&mut self, fut: impl Future<Output = T>) -> Waited<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return Waited::Done(out),
                _ = tokio::time::sleep_until(self.failsafe.deadline()) => {
                    tracing::error!(
                        max_runtime_secs = self.failsafe.max_runtime().as_secs(),
                        "failsafe tripped, exiting"
                    );
                    return Waited::Interrupted(RunOutcome::FailsafeTripped);
                }
                event = self.events.recv(), if self.events_open => match event {
                    Some(WorkerEvent::Shutdown) => return Waited::Interrupted(RunOutcome::Shutdown),
                    Some(WorkerEvent::ResetFailsafe) => {
                        self.failsafe.reset();
                        tracing::info!("failsafe reset");
                    }
                    None => {
                        tracing::warn!("event stream closed");
                        self.events_open = false;
                    }
                },
            }
        }
    }
}

pub struct Runner {
    probe: Box<dyn Probe>,
    notifier: Box<dyn Notifier>,
    interrupts: Interrupts,
    settings: LoopSettings,
}

impl Runner {
    pub fn new(
        probe: Box<dyn Probe>,
        notifier: Box<dyn Notifier>,
        events: mpsc::Receiver<WorkerEvent>,
        failsafe: Failsafe,
        settings: LoopSettings,
    ) -> Self {
        Self {
            probe,
            notifier,
            interrupts: Interrupts {
                events,
                events_open: true,
                failsafe,
            },
            settings,
        }
    }

    pub async fn run(mut self) -> RunOutcome {
        let mut retry = RetryPolicy::new(self.settings.max_attempts);
        let mut iteration: u64 = 0;

        loop {
            if self.interrupts.failsafe.expired() {
                tracing::error!("failsafe tripped, exiting");
                return RunOutcome::FailsafeTripped;
            }
            iteration += 1;
            retry.reset();

            let outcome = loop {
                match self.interrupts.wait(self.probe.poll()).await {
                    Waited::Done(Ok(outcome)) => break Some(outcome),
                    Waited::Done(Err(e)) => match retry.on_failure(&e.to_string()) {
                        RetryDecision::Retry { attempt } => {
                            tracing::debug!(iteration, attempt, "waiting before retry");
                            let delay = tokio::time::sleep(self.settings.retry_delay);
                            if let Waited::Interrupted(why) = self.interrupts.wait(delay).await {
                                return why;
                            }
                        }
                        RetryDecision::GiveUp => break None,
                    },
                    Waited::Interrupted(why) => return why,
                }
            };

            match outcome {
                Some(ProbeOutcome::Record(record)) => {
                    tracing::info!(iteration, record = %record, "record accepted");
                    if !self.notifier.send(&notify::record_message(&record)).await {
                        tracing::error!(iteration, "record notification failed, exiting");
                        return RunOutcome::NotifyFailed;
                    }
                }
                Some(ProbeOutcome::Idle) => tracing::debug!(iteration, "nothing new"),
                None => {}
            }

            let pause = tokio::time::sleep(self.settings.poll_interval);
            if let Waited::Interrupted(why) = self.interrupts.wait(pause).await {
                return why;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SendFuture;
    use crate::probe::{ProbeError, ProbeFuture};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Replays scripted results, then reports idle forever.
    struct ScriptedProbe {
        script: Mutex<VecDeque<Result<ProbeOutcome, ProbeError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<ProbeOutcome, ProbeError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let probe = Self {
                script: Mutex::new(script.into()),
                calls: Arc::clone(&calls),
            };
            (probe, calls)
        }
    }

    impl Probe for ScriptedProbe {
        fn poll(&self) -> ProbeFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            Box::pin(async move { next.unwrap_or(Ok(ProbeOutcome::Idle)) })
        }
    }

    struct FakeNotifier {
        ok: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for FakeNotifier {
        fn send<'a>(&'a self, text: &'a str) -> SendFuture<'a> {
            self.sent.lock().unwrap().push(text.to_string());
            let ok = self.ok;
            Box::pin(async move { ok })
        }
    }

    fn transient() -> Result<ProbeOutcome, ProbeError> {
        Err(ProbeError::Failed {
            code: Some(1),
            stderr: "upstream timeout".to_string(),
        })
    }

    fn record(text: &str) -> Result<ProbeOutcome, ProbeError> {
        Ok(ProbeOutcome::Record(text.to_string()))
    }

    struct Harness {
        runner: Runner,
        tx: mpsc::Sender<WorkerEvent>,
        calls: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    fn harness(
        script: Vec<Result<ProbeOutcome, ProbeError>>,
        notify_ok: bool,
        max_runtime: Duration,
        max_attempts: u32,
    ) -> Harness {
        let (probe, calls) = ScriptedProbe::new(script);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let notifier = FakeNotifier {
            ok: notify_ok,
            sent: Arc::clone(&sent),
        };
        let (tx, rx) = mpsc::channel(8);
        let runner = Runner::new(
            Box::new(probe),
            Box::new(notifier),
            rx,
            Failsafe::new(max_runtime),
            LoopSettings {
                poll_interval: Duration::from_secs(2),
                max_attempts,
                retry_delay: Duration::from_secs(1),
            },
        );
        Harness {
            runner,
            tx,
            calls,
            sent,
        }
    }

    async fn send_after(tx: &mpsc::Sender<WorkerEvent>, after: Duration, event: WorkerEvent) {
        tokio::time::sleep(after).await;
        tx.send(event).await.unwrap();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Shutdown.exit_code(), 0);
        assert_eq!(RunOutcome::FailsafeTripped.exit_code(), 3);
        assert_eq!(RunOutcome::NotifyFailed.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_is_notified_then_shutdown() {
        let h = harness(vec![record("St. Elsewhere, 09:00")], true, Duration::from_secs(3600), 3);
        let (outcome, _) = tokio::join!(
            h.runner.run(),
            send_after(&h.tx, Duration::from_millis(100), WorkerEvent::Shutdown)
        );
        assert_eq!(outcome, RunOutcome::Shutdown);
        assert_eq!(
            *h.sent.lock().unwrap(),
            vec!["Record accepted:\n\nSt. Elsewhere, 09:00".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_notification_exits() {
        let h = harness(vec![record("x")], false, Duration::from_secs(3600), 3);
        assert_eq!(h.runner.run().await, RunOutcome::NotifyFailed);
        assert_eq!(h.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failsafe_trips_during_sleep() {
        let h = harness(vec![], true, Duration::from_secs(5), 3);
        let _tx = h.tx;
        assert_eq!(h.runner.run().await, RunOutcome::FailsafeTripped);
        // Probed at 0s, 2s and 4s; the 4s..6s sleep is cut short at 5s.
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_extends_failsafe() {
        let h = harness(vec![], true, Duration::from_secs(5), 3);
        let events = async {
            send_after(&h.tx, Duration::from_secs(3), WorkerEvent::ResetFailsafe).await;
            send_after(&h.tx, Duration::from_secs(4), WorkerEvent::Shutdown).await;
        };
        let (outcome, _) = tokio::join!(h.runner.run(), events);
        // Without the reset at 3s the failsafe would have tripped at 5s.
        assert_eq!(outcome, RunOutcome::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = harness(
            vec![transient(), transient(), record("late")],
            true,
            Duration::from_secs(3600),
            3,
        );
        let (outcome, _) = tokio::join!(
            h.runner.run(),
            send_after(&h.tx, Duration::from_millis(2500), WorkerEvent::Shutdown)
        );
        assert_eq!(outcome, RunOutcome::Shutdown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_skip_iteration() {
        // Two attempts per iteration: the first iteration gives up, the
        // second recovers after one retry.
        let h = harness(
            vec![transient(), transient(), transient(), record("second")],
            true,
            Duration::from_secs(3600),
            2,
        );
        let (outcome, _) = tokio::join!(
            h.runner.run(),
            send_after(&h.tx, Duration::from_millis(4500), WorkerEvent::Shutdown)
        );
        assert_eq!(outcome, RunOutcome::Shutdown);
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            *h.sent.lock().unwrap(),
            vec!["Record accepted:\n\nsecond".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_event_stream_keeps_running_until_failsafe() {
        let h = harness(vec![], true, Duration::from_secs(3), 3);
        drop(h.tx);
        assert_eq!(h.runner.run().await, RunOutcome::FailsafeTripped);
    }
}
