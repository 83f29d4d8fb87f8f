//! Restartable single-shot timer with attempt-indexed backoff.
//!
//! One instance drives connection reconnects, another drives each channel's
//! rejoin. The two never share state.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Maps the attempt number (1-based) to the delay before firing.
pub type DelayFn = dyn Fn(u32) -> Duration + Send + Sync;

type TimerCallback = dyn Fn() + Send + Sync;

/// Default backoff sequence: 1s, 2s, 5s, then flat 10s.
pub fn default_delay(tries: u32) -> Duration {
    match tries {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        3 => Duration::from_secs(5),
        _ => Duration::from_secs(10),
    }
}

struct TimerState {
    tries: u32,
    handle: Option<AbortHandle>,
}

/// A cancelable single-shot timer whose delay grows with each scheduling.
///
/// `schedule_timeout` replaces any pending shot; `reset` cancels and zeroes
/// the attempt counter. The callback runs on the tokio runtime.
pub struct BackoffTimer {
    callback: Arc<TimerCallback>,
    delay_fn: Arc<DelayFn>,
    state: Mutex<TimerState>,
}

impl BackoffTimer {
    pub fn new(callback: Arc<TimerCallback>, delay_fn: Arc<DelayFn>) -> Self {
        Self {
            callback,
            delay_fn,
            state: Mutex::new(TimerState {
                tries: 0,
                handle: None,
            }),
        }
    }

    /// Cancel any pending shot and zero the attempt counter.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tries = 0;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    /// Bump the attempt counter and (re)arm the timer with the delay for the
    /// new attempt. A pending shot is canceled first.
    pub fn schedule_timeout(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.tries += 1;
        let delay = (self.delay_fn)(state.tries);
        let callback = Arc::clone(&self.callback);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        state.handle = Some(task.abort_handle());
    }

    /// Number of attempts since the last reset.
    pub fn tries(&self) -> u32 {
        self.state.lock().unwrap().tries
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.state.lock().unwrap().handle.take() {
            handle.abort();
        }
    }
}
