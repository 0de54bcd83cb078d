//! Small helpers shared by the benchmark scripts

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Pretty-print a duration in seconds, e.g. `1h30m25s`
pub fn pp_time(secs: u64) -> String {
    let parts = [
        (secs / 86_400, "d"),
        (secs / 3_600 % 24, "h"),
        (secs / 60 % 60, "m"),
        (secs % 60, "s"),
    ];

    let formatted: String = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect();

    if formatted.is_empty() {
        "0s".to_string()
    } else {
        formatted
    }
}

/// Pretty-print a [`Duration`], rounding down to whole seconds
pub fn pp_duration(duration: Duration) -> String {
    pp_time(duration.as_secs())
}

/// Run a future, logging when it starts and how long it took
pub async fn timed<F, T, E>(name: &str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    debug!("{} started", name);
    let start = Instant::now();
    let result = fut.await;
    let elapsed = pp_duration(start.elapsed());
    match &result {
        Ok(_) => debug!("{} took {}.", name, elapsed),
        Err(_) => debug!("{} errored after {}.", name, elapsed),
    }
    result
}
