//! Decay and recency scoring.

use chrono::{DateTime, Utc};

/// Multiplicative down-weighting by elapsed time since last access,
/// softened by access frequency: facts accessed often decay slower.
///
/// `decay = decay_rate ^ (hours_since_access / (ln(access_count + 1) + 1))`
pub fn decay_score(last_accessed_at: DateTime<Utc>, access_count: i64, now: DateTime<Utc>, decay_rate: f64) -> f64 {
    let hours_since_access = (now - last_accessed_at).num_seconds() as f64 / 3600.0;
    let hours_since_access = hours_since_access.max(0.0);
    let softening = ((access_count.max(0) as f64 + 1.0).ln()) + 1.0;
    decay_rate.powf(hours_since_access / softening)
}

/// Exponential up-weighting by freshness of the underlying event time
/// relative to `reference_time` (the query time, when supplied).
///
/// `recency_boost = exp(-hours_since_event / sigma)`
pub fn recency_boost(event_time: DateTime<Utc>, reference_time: Option<DateTime<Utc>>, sigma_hours: f64) -> f64 {
    let reference = reference_time.unwrap_or_else(Utc::now);
    let hours_since_event = (reference - event_time).num_seconds() as f64 / 3600.0;
    (-hours_since_event.abs() / sigma_hours).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn decay_is_one_at_zero_elapsed() {
        let now = Utc::now();
        assert!((decay_score(now, 0, now, 0.99) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decay_shrinks_over_time() {
        let now = Utc::now();
        let last = now - Duration::hours(1000);
        let fresh = decay_score(now, 0, now, 0.99);
        let stale = decay_score(last, 0, now, 0.99);
        assert!(stale < fresh);
    }

    #[test]
    fn frequent_access_slows_decay() {
        let now = Utc::now();
        let last = now - Duration::hours(500);
        let rarely = decay_score(last, 0, now, 0.99);
        let often = decay_score(last, 50, now, 0.99);
        assert!(often > rarely);
    }

    #[test]
    fn recency_boost_is_one_at_reference() {
        let now = Utc::now();
        assert!((recency_boost(now, Some(now), 72.0) - 1.0).abs() < 1e-9);
    }
}
