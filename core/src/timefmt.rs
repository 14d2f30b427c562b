use chrono::{NaiveDate, NaiveDateTime, ParseError};

/// A fixed textual timestamp pattern with a known rendered width.
///
/// Extracted records carry their timestamp as a fixed-width leading field,
/// so the prefix width is part of the format, not of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFormat {
    pattern: &'static str,
    prefix_len: usize,
}

/// Log-file timestamps, e.g. `01-Jan-2020 00:00:00.000`.
pub const LOG_TIME: TimeFormat = TimeFormat {
    pattern: "%d-%b-%Y %H:%M:%S%.3f",
    prefix_len: 24,
};

/// Database checkpoint timestamps, e.g. `2021-01-01 00:00:00.000000`.
pub const DB_TIME: TimeFormat = TimeFormat {
    pattern: "%Y-%m-%d %H:%M:%S%.6f",
    prefix_len: 26,
};

impl TimeFormat {
    pub fn parse(&self, s: &str) -> Result<NaiveDateTime, ParseError> {
        NaiveDateTime::parse_from_str(s, self.pattern)
    }

    pub fn format(&self, t: NaiveDateTime) -> String {
        t.format(self.pattern).to_string()
    }

    /// Validates a candidate string without surfacing the parse error.
    pub fn is_valid(&self, s: &str) -> bool {
        self.parse(s).is_ok()
    }

    /// The fixed-width leading timestamp field of a record, if the record
    /// is long enough and the cut lands on a char boundary.
    pub fn prefix<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.get(..self.prefix_len)
    }

    /// Parses the leading timestamp field of a record.
    pub fn parse_prefix(&self, line: &str) -> Option<NaiveDateTime> {
        self.prefix(line).and_then(|p| self.parse(p).ok())
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }
}

const TOKEN_OPEN: &str = "<<";
const TOKEN_CLOSE: &str = ">>";

/// Splits `input` around its single `<<...>>` token, returning
/// (before, token contents, after). `None` when no token is present.
fn split_token(input: &str) -> Option<(&str, &str, &str)> {
    let start = input.find(TOKEN_OPEN)?;
    let rest = &input[start + TOKEN_OPEN.len()..];
    let end = rest.find(TOKEN_CLOSE)?;
    Some((
        &input[..start],
        &rest[..end],
        &rest[end + TOKEN_CLOSE.len()..],
    ))
}

/// Replaces the single bracketed token in `input` with `replacement`,
/// regardless of the token contents. Inputs without a token pass through.
pub fn replace_token(input: &str, replacement: &str) -> String {
    match split_token(input) {
        Some((before, _, after)) => format!("{before}{replacement}{after}"),
        None => input.to_string(),
    }
}

/// Resolves a path template whose token encloses a date-format pattern,
/// e.g. `app-<<%Y-%m-%d>>.log`, against the given day.
pub fn resolve_date_token(input: &str, day: NaiveDate) -> String {
    match split_token(input) {
        Some((before, pattern, after)) => {
            format!("{before}{}{after}", day.format(pattern))
        }
        None => input.to_string(),
    }
}
