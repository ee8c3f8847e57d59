//! Process-wide admission gate for outbound user messages
//!
//! Bounds the number of in-flight sends (`RATELIMIT_USERSAYS_MAXCONCURRENT`)
//! and enforces a minimum spacing between admissions
//! (`RATELIMIT_USERSAYS_MINTIME` ms). Shared by all sessions of a process.

use crate::capabilities::{Capabilities, Capability};
use crate::error::{TestError, TestResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    permits: Option<Arc<Semaphore>>,
    min_spacing: Duration,
    next_admission: Mutex<Option<Instant>>,
}

/// Held for the duration of one send; dropping it frees the slot
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(max_concurrent: Option<usize>, min_spacing: Duration) -> Self {
        Self {
            permits: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            min_spacing,
            next_admission: Mutex::new(None),
        }
    }

    /// A limiter that admits everything immediately
    pub fn unlimited() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn from_caps(caps: &Capabilities) -> TestResult<Self> {
        let max_concurrent = caps
            .get_u64(Capability::RATELIMIT_USERSAYS_MAXCONCURRENT)?
            .map(|n| {
                usize::try_from(n).map_err(|_| {
                    TestError::configuration(format!(
                        "RATELIMIT_USERSAYS_MAXCONCURRENT {n} out of range"
                    ))
                })
            })
            .transpose()?;
        let min_spacing = caps
            .get_millis(Capability::RATELIMIT_USERSAYS_MINTIME)?
            .unwrap_or(Duration::ZERO);
        if max_concurrent.is_some() || !min_spacing.is_zero() {
            tracing::info!(
                max_concurrent = ?max_concurrent,
                min_spacing_ms = %min_spacing.as_millis(),
                "User message rate limit active"
            );
        }
        Ok(Self::new(max_concurrent, min_spacing))
    }

    /// Wait for a free slot, then for the minimum spacing since the last admission
    pub async fn acquire(&self) -> TestResult<Admission> {
        let permit = match &self.permits {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TestError::cancelled("Rate limiter closed"))?,
            ),
            None => None,
        };

        if !self.min_spacing.is_zero() {
            let mut next = self.next_admission.lock().await;
            let now = Instant::now();
            if let Some(at) = *next {
                if at > now {
                    tokio::time::sleep_until(at).await;
                }
            }
            *next = Some(Instant::now() + self.min_spacing);
        }

        Ok(Admission { _permit: permit })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
