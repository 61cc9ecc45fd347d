use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use crate::store::db::ScanDb;

/// Opens handles against one fixed target and checks their liveness.
pub trait Connect {
    type Handle;

    fn connect(&self) -> anyhow::Result<Self::Handle>;

    fn is_live(&self, handle: &Self::Handle) -> bool;
}

/// Reconnects to the same SQLite file the store was opened from.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    pub path: PathBuf,
}

impl Connect for SqliteConnector {
    type Handle = ScanDb;

    fn connect(&self) -> anyhow::Result<ScanDb> {
        ScanDb::open(&self.path)
    }

    fn is_live(&self, handle: &ScanDb) -> bool {
        handle.ping().is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    pub base_delay: Duration,
    /// Upper bound on a whole reconnect episode.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`: 1s, 2s, 4s, ... for the default base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("reconnect failed after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("reconnect deadline exceeded after {attempts} attempts ({elapsed:?})")]
    DeadlineExceeded { attempts: u32, elapsed: Duration },
}

/// Keeps a store handle usable across a long-running scan.
pub struct ConnectionSupervisor<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connect> ConnectionSupervisor<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    /// Return `handle` unchanged if it still answers a liveness check, otherwise replace it.
    pub fn ensure_live(&self, handle: C::Handle) -> Result<C::Handle, SupervisorError> {
        if self.connector.is_live(&handle) {
            return Ok(handle);
        }

        tracing::debug!("Store handle is not live, reconnecting");
        drop(handle);
        self.reconnect()
    }

    /// Bounded exponential-backoff reconnect.
    pub fn reconnect(&self) -> Result<C::Handle, SupervisorError> {
        let started = Instant::now();
        let mut last_error = anyhow::anyhow!("no reconnect attempt was made");

        for attempt in 0..self.policy.max_retries {
            match self.connector.connect() {
                Ok(handle) => {
                    tracing::info!(attempt = attempt + 1, "Reconnected to store");
                    return Ok(handle);
                }
                Err(e) => last_error = e,
            }

            if attempt + 1 == self.policy.max_retries {
                break;
            }

            let mut delay = self.policy.backoff(attempt);
            if let Some(deadline) = self.policy.deadline {
                let elapsed = started.elapsed();
                let remaining = deadline.saturating_sub(elapsed);
                if remaining.is_zero() {
                    return Err(SupervisorError::DeadlineExceeded { attempts: attempt + 1, elapsed });
                }
                delay = delay.min(remaining);
            }

            tracing::debug!(
                attempt = attempt + 1,
                "Reconnect failed, waiting {:.1}s for the next attempt: {:#}",
                delay.as_secs_f64(),
                last_error
            );
            std::thread::sleep(delay);
        }

        Err(SupervisorError::Exhausted {
            attempts: self.policy.max_retries,
            source: last_error,
        })
    }
}
