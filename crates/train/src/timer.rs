//! Wall-clock stopwatch for the phases of an iteration.

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Records the most recent interval and the mean of all intervals since the
/// last [`reset`](Timer::reset).
///
/// State lives in `Cell`s so a [`TimerScope`] only needs `&Timer`, letting a
/// scope stay open while the rest of the owning struct is mutated.
#[derive(Debug, Default)]
pub struct Timer {
    started: Cell<Option<Instant>>,
    last: Cell<Duration>,
    total: Cell<Duration>,
    count: Cell<u32>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.started.set(Some(Instant::now()));
    }

    /// Close the interval opened by [`start`](Self::start). No-op when not started.
    pub fn stop(&self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    /// Time until the returned guard drops, including early `?` returns.
    pub fn scope(&self) -> TimerScope<'_> {
        TimerScope {
            timer: self,
            started: Instant::now(),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        self.last.set(elapsed);
        self.total.set(self.total.get() + elapsed);
        self.count.set(self.count.get() + 1);
    }

    pub fn reset(&self) {
        self.started.set(None);
        self.last.set(Duration::ZERO);
        self.total.set(Duration::ZERO);
        self.count.set(0);
    }

    /// Seconds of the most recent interval (0 before the first one).
    pub fn last(&self) -> f64 {
        self.last.get().as_secs_f64()
    }

    /// Mean seconds per interval since the last reset (0 when empty).
    pub fn average(&self) -> f64 {
        match self.count.get() {
            0 => 0.0,
            n => self.total.get().as_secs_f64() / n as f64,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

/// Guard returned by [`Timer::scope`].
pub struct TimerScope<'a> {
    timer: &'a Timer,
    started: Instant,
}

impl Drop for TimerScope<'_> {
    fn drop(&mut self) {
        self.timer.record(self.started.elapsed());
    }
}
