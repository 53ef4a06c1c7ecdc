//! Retry timer with a tries-indexed backoff
//!
//! Used for both socket reconnection and channel rejoin. Each
//! `schedule_timeout` replaces any pending attempt; `reset` cancels it and
//! zeroes the attempt counter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Maps the 1-based attempt number to the delay before that attempt
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TimerState {
    tries: u32,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Cancellable, resettable retry scheduler
pub struct Timer {
    callback: TimerCallback,
    backoff: BackoffFn,
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new<F>(callback: F, backoff: BackoffFn) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            backoff,
            state: Arc::new(Mutex::new(TimerState::default())),
        }
    }

    /// Cancel the pending attempt and start counting from zero again
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tries = 0;
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    /// Schedule the next attempt, replacing any pending one
    pub fn schedule_timeout(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.generation += 1;

        let generation = state.generation;
        let delay = (self.backoff)(state.tries + 1);
        let shared = Arc::clone(&self.state);
        let callback = Arc::clone(&self.callback);

        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock();
                if state.generation != generation {
                    return;
                }
                state.tries += 1;
                state.handle = None;
            }
            callback();
        }));
    }

    /// Attempts fired since the last reset
    pub fn tries(&self) -> u32 {
        self.state.lock().tries
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().handle.is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.state.lock().handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Timer")
            .field("tries", &state.tries)
            .field("scheduled", &state.handle.is_some())
            .finish()
    }
}

/// Backoff that walks `steps_ms` and then repeats its last entry
pub fn stepped_backoff(steps_ms: Vec<u64>) -> BackoffFn {
    Arc::new(move |tries: u32| {
        let idx = tries.saturating_sub(1) as usize;
        let ms = steps_ms
            .get(idx)
            .or_else(|| steps_ms.last())
            .copied()
            .unwrap_or(10_000);
        Duration::from_millis(ms)
    })
}
