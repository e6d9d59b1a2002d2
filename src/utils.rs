//! Shared helpers for the orchestration core.
//!
//! Formatting, shell quoting and credential generation used across the
//! job, provisioning and deployment modules.

use std::borrow::Cow;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Formats a duration in seconds into a human-readable string.
///
/// # Examples
///
/// ```
/// use hostwright::utils::format_duration;
///
/// assert_eq!(format_duration(3661), "1h 1m 1s");
/// assert_eq!(format_duration(61), "1m 1s");
/// assert_eq!(format_duration(30), "30s");
/// ```
pub fn format_duration(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    match (hours, minutes) {
        (0, 0) => format!("{}s", secs),
        (0, _) => format!("{}m {}s", minutes, secs),
        _ => format!("{}h {}m {}s", hours, minutes, secs),
    }
}

/// Truncates a string to at most `max_len` characters, appending "..." if
/// truncated.
///
/// # Examples
///
/// ```
/// use hostwright::utils::truncate;
///
/// assert_eq!(truncate("hello", 10), "hello");
/// assert_eq!(truncate("hello world", 8), "hello...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_len {
        Cow::Borrowed(s)
    } else if max_len <= 3 {
        Cow::Owned(s.chars().take(max_len).collect())
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        Cow::Owned(format!("{}...", head))
    }
}

/// Wraps a value in single quotes for POSIX shells.
///
/// # Examples
///
/// ```
/// use hostwright::utils::shell_quote;
///
/// assert_eq!(shell_quote("main"), "'main'");
/// assert_eq!(shell_quote("it's"), "'it'\\''s'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Random alphanumeric secret for root/database passwords and webhook keys.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

const RELEASE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Release directory name for a deployment started at `at`. The name sorts
/// after `latest`, moving forward a second at a time when `at` falls in the
/// same second as (or before) the site's latest release.
pub fn release_name(at: DateTime<Utc>, latest: Option<&str>) -> String {
    let name = at.format(RELEASE_FORMAT).to_string();
    match latest {
        Some(latest) if name.as_str() <= latest => {
            match NaiveDateTime::parse_from_str(latest, RELEASE_FORMAT) {
                Ok(previous) => (Utc.from_utc_datetime(&previous) + Duration::seconds(1))
                    .format(RELEASE_FORMAT)
                    .to_string(),
                Err(_) => name,
            }
        }
        _ => name,
    }
}
