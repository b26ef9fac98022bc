//! Refresh timing.

use std::time::Duration;

use time::OffsetDateTime;

use crate::types::Expiry;

/// Refresh this long before the access token expires.
pub const LEAD_TIME: Duration = Duration::from_secs(5 * 60);

/// Never schedule a refresh sooner than this.
pub const MIN_DELAY: Duration = Duration::from_secs(60);

/// When the next proactive refresh should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Fire after this delay.
    After(Duration),
    /// The token is already expired; refreshing is pointless.
    Expired,
}

/// `max(expiry - now - lead, min_delay)`, or [`RefreshPlan::Expired`] once
/// the expiry has passed.
#[must_use]
pub fn refresh_delay(
    expiry: Expiry,
    now: OffsetDateTime,
    lead: Duration,
    min_delay: Duration,
) -> RefreshPlan {
    let remaining = expiry.remaining(now);
    if !remaining.is_positive() {
        return RefreshPlan::Expired;
    }
    // `remaining` is positive, so the conversion only fails on overflow.
    let remaining = Duration::try_from(remaining).unwrap_or(Duration::MAX);
    let delay = remaining.saturating_sub(lead).max(min_delay);
    RefreshPlan::After(delay)
}
