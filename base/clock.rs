// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use crate::error::Error;
use crate::shutdown::ShutdownError;
use jiff::{SignedDuration, Timestamp};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::warn;

/// Abstract interface to the system clock. This exists so tests can advance
/// time deterministically instead of sleeping for real.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: StdDuration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Retries `f` until it succeeds, sleeping a second between attempts, or
/// returns early if shutdown has been requested.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(exception = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn sleep(&self, how_long: StdDuration) {
        std::thread::sleep(how_long);
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guard lives "too long", using the label created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Timestamp,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.now(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.now().duration_since(self.start);
        if elapsed >= SignedDuration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: `sleep` advances time instantly rather than blocking.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    epoch: Timestamp,
    elapsed: Mutex<SignedDuration>,
}

impl SimulatedClocks {
    pub fn new(epoch: Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            epoch,
            elapsed: Mutex::new(SignedDuration::ZERO),
        }))
    }
}

impl Default for SimulatedClocks {
    fn default() -> Self {
        Self::new(Timestamp::UNIX_EPOCH)
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> Timestamp {
        self.0.epoch + *self.0.elapsed.lock().unwrap()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        let mut l = self.0.elapsed.lock().unwrap();
        *l = *l + SignedDuration::try_from(how_long).unwrap();
    }

    /// Advances the clock by the specified amount if data is not immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::ZERO);
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::default();
        let t0 = c.now();
        c.sleep(StdDuration::from_secs(5));
        assert_eq!(c.now().duration_since(t0), SignedDuration::from_secs(5));
    }
}
