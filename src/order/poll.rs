use std::cmp;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// How to wait for the ACME API to settle an authorization or an order.
///
/// Each attempt is one POST-as-GET. Between attempts the poller sleeps for the
/// `Retry-After` the server sent, capped at `max_retry_after`, or else an
/// interval starting at `initial_interval` that doubles up to `max_interval`.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Attempts before giving up with [`Error::Timeout`]. Must be at least 1.
    ///
    /// [`Error::Timeout`]: ../enum.Error.html#variant.Timeout
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Upper bound for a server supplied `Retry-After`.
    pub max_retry_after: Duration,
    /// Abort the waiting from another thread.
    pub cancel: Option<CancelToken>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
            cancel: None,
        }
    }
}

/// Outcome of one poll attempt.
pub(crate) enum Poll {
    Settled,
    /// Not yet, with the server's `Retry-After` if it sent one.
    Pending(Option<Duration>),
}

impl PollPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        PollPolicy {
            max_attempts,
            initial_interval,
            max_interval,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
            cancel: None,
        }
    }

    pub fn with_max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run `attempt` until it reports `Settled`.
    ///
    /// Errors from `attempt` end the loop right away.
    pub(crate) fn run<F>(&self, what: &str, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Result<Poll>,
    {
        if self.max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".into()));
        }
        let mut backoff = self.initial_interval;
        for n in 1..=self.max_attempts {
            self.check_cancel()?;
            let retry_after = match attempt()? {
                Poll::Settled => return Ok(()),
                Poll::Pending(retry_after) => retry_after,
            };
            if n == self.max_attempts {
                break;
            }
            let delay = match retry_after {
                Some(d) => cmp::min(d, self.max_retry_after),
                None => {
                    let d = cmp::min(backoff, self.max_interval);
                    backoff = cmp::min(backoff * 2, self.max_interval);
                    d
                }
            };
            trace!("Poll {} attempt {} pending, wait {:?}", what, n, delay);
            self.sleep(delay)?;
        }
        Err(Error::Timeout(format!(
            "{} not settled after {} attempts",
            what, self.max_attempts
        )))
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(c) if c.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn sleep(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(c) => c.sleep(delay),
            None => {
                thread::sleep(delay);
                Ok(())
            }
        }
    }
}

/// Cancels polling loops.
///
/// Clones share the flag. Cancelling wakes pollers that are sleeping between
/// attempts, and they return [`Error::Cancelled`].
///
/// [`Error::Cancelled`]: ../enum.Error.html#variant.Cancelled
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep(&self, delay: Duration) -> Result<()> {
        let (lock, cvar) = &*self.state;
        // None when the delay is past what Instant can represent
        let deadline = Instant::now().checked_add(delay);
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        // loop for spurious wakeups
        while !*cancelled {
            cancelled = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    cvar.wait_timeout(cancelled, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => cvar.wait(cancelled).unwrap_or_else(PoisonError::into_inner),
            };
        }
        Err(Error::Cancelled)
    }
}
