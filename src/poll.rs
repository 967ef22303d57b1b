// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Bounded polling shared by every convergence wait.
//!
//! All waits (health, clean PGs, MDS rank states, mounts, sessions) go through [`PollPolicy`]
//! so that intervals and bounds are configured in one place. Time is measured with
//! `tokio::time`, so a paused tokio clock drives these loops deterministically in tests.

use std::{fmt::Debug, future::Future, time::Duration};

use log::debug;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// The outcome of one check in a poll loop.
#[derive(Debug)]
pub enum Check<T, S> {
    /// The goal was reached; stop polling and return the value.
    Done(T),
    /// Not there yet; keep polling. The state is kept for the timeout error.
    Pending(S),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls forever. Only the lifecycle's optional waits use this; every scenario wait is
    /// bounded.
    pub timeout: Option<Duration>,
    /// Multiplier applied to the interval after every pending check. 1.0 keeps a fixed interval.
    pub backoff: f64,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollPolicy {
            interval,
            timeout: Some(timeout),
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub fn every_secs(interval: u64, timeout: u64) -> Self {
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    pub fn unbounded(interval: Duration) -> Self {
        PollPolicy {
            interval,
            timeout: None,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Run `check` until it reports [`Check::Done`] or the timeout passes.
    ///
    /// The check always runs at least once, and once more after the deadline has passed so that
    /// a goal reached during the final sleep is not reported as a timeout. Errors returned by the
    /// check itself end the poll immediately.
    pub async fn run<T, S, F, Fut>(&self, what: &str, mut check: F) -> Result<(T, Duration)>
    where
        S: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Check<T, S>>>,
    {
        let start = Instant::now();
        let mut interval = self.interval;
        loop {
            let last = match check().await? {
                Check::Done(value) => return Ok((value, start.elapsed())),
                Check::Pending(state) => state,
            };

            let elapsed = start.elapsed();
            if let Some(timeout) = self.timeout {
                if elapsed >= timeout {
                    return Err(Error::Timeout {
                        what: what.to_string(),
                        elapsed,
                        last_observed: format!("{last:?}"),
                    });
                }
            }

            debug!("waiting for {what}: currently {last:?}");
            tokio::time::sleep(interval).await;
            interval = interval.mul_f64(self.backoff).min(self.max_interval);
        }
    }

    /// Convenience wrapper for a check that only answers yes or no.
    pub async fn until<F, Fut>(&self, what: &str, mut condition: F) -> Result<Duration>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let (_, elapsed) = self
            .run(what, || {
                let fut = condition();
                async move {
                    Ok(if fut.await? {
                        Check::Done(())
                    } else {
                        Check::Pending(false)
                    })
                }
            })
            .await?;
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reaches_goal() {
        let calls = Cell::new(0);
        let policy = PollPolicy::every_secs(1, 10);
        let (value, elapsed) = policy
            .run("counter", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    Ok(if n == 4 {
                        Check::Done(n)
                    } else {
                        Check::Pending(n)
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 4);
        assert_eq!(elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_last_state() {
        let policy = PollPolicy::every_secs(2, 5);
        let err = policy
            .run("nothing", || async { Ok(Check::<(), _>::Pending("HEALTH_WARN")) })
            .await
            .unwrap_err();

        match err {
            Error::Timeout {
                elapsed,
                last_observed,
                ..
            } => {
                assert!(elapsed >= Duration::from_secs(5));
                assert!(elapsed < Duration::from_secs(8));
                assert!(last_observed.contains("HEALTH_WARN"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let policy = PollPolicy::every_secs(1, 100).with_backoff(2.0, Duration::from_secs(4));
        let calls = Cell::new(0u32);
        let elapsed = policy
            .until("backoff", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Ok(n == 5) }
            })
            .await
            .unwrap();

        // 1 + 2 + 4 + 4
        assert_eq!(elapsed, Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_stops_immediately() {
        let policy = PollPolicy::every_secs(1, 100);
        let err = policy
            .until("broken", || async { Err(Error::config("bad")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
