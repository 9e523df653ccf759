use chrono::{DateTime, Utc};

/// Width of the RFC 3339 timestamp (nanosecond precision, UTC) the runtime
/// prefixes to each line, e.g. `2021-01-01T00:00:00.000000000Z`.
pub const TIMESTAMP_WIDTH: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Line has no timestamp prefix: {0:?}")]
    MissingTimestamp(String),
    #[error("Malformed timestamp {token:?}: {source}")]
    Timestamp {
        token: String,
        source: chrono::ParseError,
    },
    #[error("No separator after timestamp in {0:?}")]
    MissingSeparator(String),
}

/// How a stream prefixes its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every line starts with a fixed-width timestamp and a space.
    Timestamped,
    /// Lines carry no timestamp; the framing time is used instead.
    Plain,
}

/// Splits one raw line into its timestamp and payload.
pub fn frame_line(line: &str, framing: Framing) -> Result<(DateTime<Utc>, &str), FrameError> {
    let line = strip_line_ending(line);
    match framing {
        Framing::Plain => Ok((Utc::now(), line)),
        Framing::Timestamped => {
            let token = line
                .get(..TIMESTAMP_WIDTH)
                .ok_or_else(|| FrameError::MissingTimestamp(line.to_string()))?;
            let time = DateTime::parse_from_rfc3339(token)
                .map_err(|source| FrameError::Timestamp {
                    token: token.to_string(),
                    source,
                })?
                .with_timezone(&Utc);
            let rest = &line[TIMESTAMP_WIDTH..];
            let data = if rest.is_empty() {
                rest
            } else {
                rest.strip_prefix(' ')
                    .ok_or_else(|| FrameError::MissingSeparator(line.to_string()))?
            };
            Ok((time, data))
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
