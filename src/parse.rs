use chrono::{DateTime, NaiveDate, Utc};

/// Placeholder the source platform uses for "no data". `"N/A"` and `"-"` both
/// normalize to this before persistence.
pub const SENTINEL: &str = "-";

pub fn normalize_sentinel(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "N/A" || trimmed == SENTINEL {
        SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Accepts only `digits[.digits]%` (surrounding whitespace tolerated) and
/// returns the numeric part. Anything else is excluded from aggregation by
/// returning None, never coerced to zero.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let body = trimmed.strip_suffix('%')?;
    let (whole, frac) = match body.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (body, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    body.parse().ok()
}

/// `"M:SS"` to total seconds. The sentinel yields None so callers can exclude
/// it from "has time on task" groupings; a bare number is already seconds.
pub fn clock_to_seconds(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == SENTINEL {
        return None;
    }
    match trimmed.split_once(':') {
        Some((minutes, seconds)) => {
            let minutes: u32 = minutes.parse().ok()?;
            let seconds: u32 = seconds.parse().ok()?;
            Some(minutes * 60 + seconds)
        }
        None => trimmed.parse().ok(),
    }
}

/// Splits a raw score cell of the form `"<score> (<mm:ss>)"` into
/// `(score, time_on_task)`. A literal `-` anywhere means no data for either
/// part; a cell with no parenthetical has a score but no recorded time.
pub fn parse_score_cell(raw: &str) -> (String, String) {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains('-') {
        return (SENTINEL.to_string(), SENTINEL.to_string());
    }
    match (trimmed.rfind('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            let score = trimmed[..open].trim().to_string();
            let time = trimmed[open + 1..close].trim().to_string();
            (score, time)
        }
        _ => (trimmed.to_string(), "0".to_string()),
    }
}

/// Max score is embedded in a column label as `"Label (N)"`. Missing
/// parenthetical means the platform did not report one.
pub fn max_score_from_label(label: &str) -> String {
    match (label.rfind('('), label.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            let inner = label[open + 1..close].trim();
            if inner.is_empty() {
                SENTINEL.to_string()
            } else {
                inner.to_string()
            }
        }
        _ => SENTINEL.to_string(),
    }
}

/// Enrollment dates arrive as `"MMMM dd, yyyy"`, e.g. `"January 05, 2026"`.
pub fn parse_enrollment_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%B %d, %Y").ok()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Course start/end dates come back in more than one shape.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(trimmed).map(|dt| dt.date_naive()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_requires_exact_shape() {
        assert_eq!(parse_percent("87.5% "), Some(87.5));
        assert_eq!(parse_percent("100%"), Some(100.0));
        assert_eq!(parse_percent("N/A"), None);
        assert_eq!(parse_percent("-"), None);
        assert_eq!(parse_percent("87.5"), None);
        assert_eq!(parse_percent(".5%"), None);
        assert_eq!(parse_percent("87.%"), None);
        assert_eq!(parse_percent("-87%"), None);
        assert_eq!(parse_percent("8a%"), None);
    }

    #[test]
    fn clock_time_converts_to_seconds() {
        assert_eq!(clock_to_seconds("3:45"), Some(225));
        assert_eq!(clock_to_seconds("0:09"), Some(9));
        assert_eq!(clock_to_seconds("0"), Some(0));
        assert_eq!(clock_to_seconds("-"), None);
        assert_eq!(clock_to_seconds("abc"), None);
    }

    #[test]
    fn score_cell_splits_score_and_time() {
        assert_eq!(
            parse_score_cell("87 (3:45)"),
            ("87".to_string(), "3:45".to_string())
        );
        assert_eq!(parse_score_cell("87"), ("87".to_string(), "0".to_string()));
        assert_eq!(parse_score_cell("-"), ("-".to_string(), "-".to_string()));
        assert_eq!(
            parse_score_cell("12 (-)"),
            ("-".to_string(), "-".to_string())
        );
        assert_eq!(parse_score_cell(""), ("-".to_string(), "-".to_string()));
    }

    #[test]
    fn max_score_comes_from_parenthetical() {
        assert_eq!(max_score_from_label("Question 4 (10)"), "10");
        assert_eq!(max_score_from_label("Question 4"), "-");
        assert_eq!(max_score_from_label("Tricky (a) label (2.5)"), "2.5");
        assert_eq!(max_score_from_label("()"), "-");
    }

    #[test]
    fn sentinel_normalization_collapses_variants() {
        assert_eq!(normalize_sentinel("N/A"), "-");
        assert_eq!(normalize_sentinel("-"), "-");
        assert_eq!(normalize_sentinel(""), "-");
        assert_eq!(normalize_sentinel(" 91.2% "), "91.2%");
    }

    #[test]
    fn enrollment_dates_use_long_month_form() {
        assert_eq!(
            parse_enrollment_date("January 05, 2026"),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(parse_enrollment_date("2026-01-05"), None);
    }

    #[test]
    fn loose_dates_accept_iso_and_rfc3339() {
        assert_eq!(
            parse_loose_date("2026-01-05"),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(
            parse_loose_date("2026-01-05T10:00:00Z"),
            NaiveDate::from_ymd_opt(2026, 1, 5)
        );
        assert_eq!(parse_loose_date("soon"), None);
    }
}
