//! Entitlement accrual arithmetic. No I/O.

use chrono::{DateTime, Duration, Utc};

use crate::error::{ServiceError, ServiceResult};

/// Fallback reward period when a pledge carries no next charge date.
pub const REWARD_PERIOD_DAYS: i64 = 30;

/// Compute a new entitlement expiration.
///
/// Earned time stacks on top of the current expiration when one exists,
/// whether it lies in the past or the future; otherwise the clock starts
/// from `now`. Negative earned durations are rejected — callers are
/// expected to have screened those out as non-accruing events.
pub fn accrue(
    earned: Duration,
    current_expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ServiceResult<DateTime<Utc>> {
    if earned < Duration::zero() {
        return Err(ServiceError::InvalidDuration(earned.num_seconds()));
    }

    Ok(match current_expiration {
        Some(expiration) => expiration + earned,
        None => now + earned,
    })
}
