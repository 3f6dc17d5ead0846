//! Blocking facade over card work run on a worker thread.
//!
//! The host calls in from its own event loop. The bridge runs the job on a
//! scoped worker thread and waits on a channel; every poll interval that
//! passes without a result it hands control to the host's [`MessagePump`] so
//! the host stays responsive.

use crate::domain::error::Result;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lets the host service its own message loop while the bridge waits.
pub trait MessagePump {
    fn pump(&mut self);
}

/// For callers that are not on a UI thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPump;

impl MessagePump for NoPump {
    fn pump(&mut self) {}
}

impl<F: FnMut()> MessagePump for F {
    fn pump(&mut self) {
        self()
    }
}

pub struct SyncBridge<P: MessagePump = NoPump> {
    pump: P,
    poll_interval: Duration,
}

impl SyncBridge<NoPump> {
    pub fn new() -> Self {
        Self::with_pump(NoPump)
    }
}

impl Default for SyncBridge<NoPump> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MessagePump> SyncBridge<P> {
    pub fn with_pump(pump: P) -> Self {
        Self {
            pump,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn pump_mut(&mut self) -> &mut P {
        &mut self.pump
    }

    /// Run `job` on a worker thread and block until it finishes, pumping
    /// host messages meanwhile. The job's error is returned unchanged; a
    /// panic in the job resumes in the caller.
    ///
    /// `&mut self` keeps one operation in flight per bridge.
    pub fn run<T, F>(&mut self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let pump = &mut self.pump;
        let interval = self.poll_interval;

        thread::scope(|scope| {
            let worker = scope.spawn(move || {
                let result = job();
                let _ = done_tx.send(());
                result
            });

            let started = Instant::now();
            loop {
                match done_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => pump.pump(),
                }
            }
            debug!("Bridged operation finished in {:?}", started.elapsed());

            match worker.join() {
                Ok(result) => result,
                Err(panic) => {
                    error!("Card worker panicked");
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }

    /// Wait `duration` without blocking the host's message loop.
    pub fn wait(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
            self.pump.pump();
        }
    }
}
