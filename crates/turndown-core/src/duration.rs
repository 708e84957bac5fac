//! Duration strings used in config files and the control API.

use std::time::Duration;

/// Parse a duration like "30s", "5m", "8h" or "1d". A bare number is seconds.
///
/// Returns `None` for empty or malformed input and on overflow. Zero is
/// accepted; callers that need a positive duration check for it.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = match s.char_indices().last()? {
        (i, 's') => (&s[..i], 1),
        (i, 'm') => (&s[..i], 60),
        (i, 'h') => (&s[..i], 60 * 60),
        (i, 'd') => (&s[..i], 24 * 60 * 60),
        _ => (s, 1),
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_mul(multiplier).map(Duration::from_secs)
}
