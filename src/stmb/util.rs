use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn now_epoch_millis() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
pub fn rfc3339_to_millis(raw: &str) -> Option<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}

/// Truncate `input` to at most `max_chars` Unicode characters, appending `…`
/// when truncated.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() > max_chars {
        let mut s: String = input.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        input.to_string()
    }
}

/// Substitute `{{char}}` and `{{user}}` placeholders.
pub fn substitute_names(template: &str, character: &str, user: &str) -> String {
    template
        .replace("{{char}}", character)
        .replace("{{user}}", user)
}

/// Parse `X-Y` with a hyphen, en dash, or em dash separator.
pub fn parse_index_range(raw: &str) -> Option<(i64, i64)> {
    let trimmed = raw.trim();
    let sep = trimmed.find(&['-', '–', '—'][..])?;
    let (left, rest) = trimmed.split_at(sep);
    let right = rest.chars().skip(1).collect::<String>();
    let left = left.trim();
    let right = right.trim();
    if left.is_empty()
        || right.is_empty()
        || !left.chars().all(|c| c.is_ascii_digit())
        || !right.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((left.parse().ok()?, right.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_range_accepts_dash_variants() {
        assert_eq!(parse_index_range("10-15"), Some((10, 15)));
        assert_eq!(parse_index_range(" 3 – 9 "), Some((3, 9)));
        assert_eq!(parse_index_range("0—0"), Some((0, 0)));
    }

    #[test]
    fn parse_index_range_rejects_garbage() {
        assert_eq!(parse_index_range("10"), None);
        assert_eq!(parse_index_range("-3-4"), None);
        assert_eq!(parse_index_range("a-b"), None);
        assert_eq!(parse_index_range("4-"), None);
    }

    #[test]
    fn substitute_names_replaces_every_occurrence() {
        assert_eq!(
            substitute_names("{{char}} meets {{user}}; {{char}} waves", "Ava", "Sam"),
            "Ava meets Sam; Ava waves"
        );
    }

    #[test]
    fn rfc3339_round_trips_to_millis() {
        assert_eq!(
            rfc3339_to_millis("1970-01-01T00:00:10.000Z"),
            Some(10_000)
        );
        assert_eq!(rfc3339_to_millis("not a date"), None);
    }
}
