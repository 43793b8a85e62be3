//! Countdown state for the supervisor-side watchdog.
//!
//! The watchdog loop calls [`TimerState::tick`] once per second and acts on
//! the returned [`Tick`]. All mutation happens through this type, under the
//! supervisor's timer lock.

/// What the watchdog should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A newer session owns the countdown; this loop must exit without touching it.
    Superseded,
    /// Stop was requested for this session.
    Stopped,
    /// The worker is gone on its own. Countdown has been zeroed.
    WorkerGone,
    /// Countdown decremented, nothing else to do.
    Counting { remaining: u64 },
    /// Countdown just reached the warning threshold; the warning is now marked sent.
    Warn { remaining: u64 },
    /// Countdown reached zero without an external stop.
    Expired,
}

/// Countdown settings, all in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub duration_secs: u64,
    pub warning_secs: u64,
}

/// Session countdown state.
///
/// `remaining` never increases except through [`TimerState::begin_session`]
/// or [`TimerState::rearm`], and `warning_sent` is cleared only by those
/// same calls.
#[derive(Debug)]
pub struct TimerState {
    settings: TimerSettings,
    remaining: u64,
    warning_sent: bool,
    stop_requested: bool,
    generation: u64,
}

impl TimerState {
    /// A zeroed countdown. Nothing runs until a session begins.
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings,
            remaining: 0,
            warning_sent: false,
            stop_requested: false,
            generation: 0,
        }
    }

    /// Start a new session: full countdown, fresh warning, new generation.
    ///
    /// Returns the generation the session's watchdog must present on every tick.
    pub fn begin_session(&mut self) -> u64 {
        self.generation += 1;
        self.rearm();
        self.generation
    }

    /// Reset the countdown to the full duration within the current session.
    pub fn rearm(&mut self) {
        self.remaining = self.settings.duration_secs;
        self.warning_sent = false;
        self.stop_requested = false;
    }

    /// Raise the stop event; the watchdog exits on its next tick.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn zero(&mut self) {
        self.remaining = 0;
    }

    /// Zero the countdown only if `generation` still owns it.
    pub fn zero_if_current(&mut self, generation: u64) {
        if self.generation == generation {
            self.remaining = 0;
        }
    }

    /// Advance the countdown by one second for the session `generation`.
    ///
    /// Checks run in priority order: ownership, stop, worker liveness,
    /// then the decrement with its warning and expiry transitions.
    pub fn tick(&mut self, generation: u64, worker_alive: bool) -> Tick {
        if generation != self.generation {
            return Tick::Superseded;
        }
        if self.stop_requested {
            return Tick::Stopped;
        }
        if !worker_alive {
            self.remaining = 0;
            return Tick::WorkerGone;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return Tick::Expired;
        }
        if self.remaining <= self.settings.warning_secs && !self.warning_sent {
            self.warning_sent = true;
            return Tick::Warn {
                remaining: self.remaining,
            };
        }
        Tick::Counting {
            remaining: self.remaining,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    #[allow(dead_code)]
    pub fn warning_sent(&self) -> bool {
        self.warning_sent
    }

    #[allow(dead_code)]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Split whole seconds into (hours, minutes, seconds).
pub fn split_hms(total_secs: u64) -> (u64, u64, u64) {
    (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60)
}

/// Human-readable countdown, e.g. `1h 0m 0s`.
pub fn format_hms(total_secs: u64) -> String {
    let (h, m, s) = split_hms(total_secs);
    format!("{h}h {m}m {s}s")
}
