use agent_core::timefmt::TimeFormat;
use chrono::NaiveDateTime;

/// How a source run filters its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Keyword matching only; records without a timestamp prefix pass.
    KeywordOnly,
    /// Keyword matching plus a strict checkpoint window on the record's
    /// fixed-width timestamp prefix.
    DateFiltered,
}

/// Decides the mode for a whole source run from its first record: when the
/// first record does not carry a valid timestamp prefix the entire run falls
/// back to keyword-only filtering. The fallback is per-run, never persisted.
pub fn check_mode_for(first_record: Option<&str>, format: TimeFormat) -> CheckMode {
    match first_record.and_then(|line| format.prefix(line)) {
        Some(prefix) if format.is_valid(prefix) => CheckMode::DateFiltered,
        _ => CheckMode::KeywordOnly,
    }
}

/// Pure eligibility decision for one raw record.
///
/// A record is eligible when it contains at least one include keyword
/// (case-insensitive substring) and none of the exclude keywords. Under
/// `DateFiltered` the leading timestamp must additionally parse, be strictly
/// after `checkpoint`, and not lie in the future.
pub fn is_eligible(
    record: &str,
    checkpoint: NaiveDateTime,
    include: &[String],
    exclude: &[String],
    mode: CheckMode,
    now: NaiveDateTime,
    format: TimeFormat,
) -> bool {
    let text = record.to_lowercase();

    let has_include = include
        .iter()
        .any(|keyword| text.contains(&keyword.to_lowercase()));
    let has_exclude = exclude
        .iter()
        .any(|keyword| text.contains(&keyword.to_lowercase()));

    if !has_include || has_exclude {
        return false;
    }

    match mode {
        CheckMode::KeywordOnly => true,
        CheckMode::DateFiltered => match format.parse_prefix(record) {
            Some(ts) => ts > checkpoint && ts <= now,
            None => false,
        },
    }
}
