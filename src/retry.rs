// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry With Backoff
//!
//! `RetryPolicy` runs an async operation up to `max_attempts` times, sleeping
//! between failures. The delay doubles with every failure, is capped at
//! `max_delay`, and gets up to `jitter` (a fraction in `[0, 1]`) added on top.
//! Keeping jitter at or below one full delay keeps the sequence of delays
//! non-decreasing.
//!
//! The policy knows nothing about acking or dead-lettering; the consumer
//! layers those on top of the returned outcome.

use crate::errors::HandlerError;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classifies an error as worth retrying or not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for HandlerError {
    fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Why the retry loop gave up. Every variant carries the attempts made and the
/// last error observed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("non-retryable failure on attempt {attempts}: {last}")]
    Rejected { attempts: u32, last: E },

    #[error("cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Rejected { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. }
            | RetryError::Rejected { last, .. }
            | RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last, .. }
            | RetryError::Rejected { last, .. }
            | RetryError::Cancelled { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy making at most `max_attempts` calls (at least one).
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fresh per-delivery state.
    pub fn state(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }

    /// Calls `op` until it succeeds, returns a non-retryable error, runs out
    /// of attempts or `cancel` fires during a backoff wait.
    ///
    /// On success returns the number of attempts it took.
    pub async fn execute<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<u32, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut state = self.state();

        loop {
            let attempt = state.begin();

            let err = match op(attempt).await {
                Ok(()) => return Ok(attempt),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(attempt, error = %err, "non-retryable failure");
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    last: err,
                });
            }

            let Some(delay) = state.next_delay() else {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            };

            warn!(
                attempt,
                max_attempts = state.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt, last: err });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Attempt bookkeeping for one delivery; dropped once it is settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryState {
    /// Moves to the next attempt and returns its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay to wait after the current failed attempt, or `None` when no
    /// attempt is left.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }

        let factor = if self.jitter > 0.0 {
            1.0 + rand::random::<f64>() * self.jitter
        } else {
            1.0
        };

        Some(self.delay_for(self.attempt, factor))
    }

    /// `min(max_delay, base_delay * 2^(failures - 1) * factor)`
    pub(crate) fn delay_for(&self, failures: u32, factor: f64) -> Duration {
        let exponent = failures.saturating_sub(1).min(30) as i32;
        let millis = self.base_delay.as_millis() as f64 * 2f64.powi(exponent) * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped.max(0.0) as u64)
    }
}
