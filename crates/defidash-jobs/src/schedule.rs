use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Round `t` to the nearest multiple of `interval` counted from the Unix
/// epoch. A tie rounds up.
///
/// Returns `t` unchanged for a zero interval or when the result would leave
/// chrono's range; registered intervals are validated so neither happens for
/// them.
pub fn align(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let Ok(step) = i64::try_from(interval.as_millis()) else {
        return t;
    };
    if step == 0 {
        return t;
    }

    let ms = t.timestamp_millis();
    let rem = ms.rem_euclid(step);
    let base = ms - rem;
    let aligned = if rem * 2 >= step { base.checked_add(step) } else { Some(base) };

    aligned
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(t)
}

/// First grid point for a schedule that fired (or was created) at `now`:
/// `now + interval` snapped to the interval grid.
///
/// Always later than `now`, so a claimed occurrence never stays due.
pub fn next_run_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
    {
        Some(t) => align(t, interval),
        None => now,
    }
}
