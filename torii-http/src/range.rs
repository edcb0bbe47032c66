//! Byte-range negotiation.

use std::ops::RangeInclusive;

/// What the `Range` header (or its absence) means for this response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No range requested: serialize the whole file with status 200.
    Full,
    /// One satisfiable range: status 206 with a `Content-Range`.
    Partial(RangeInclusive<u64>),
    /// Present but unsatisfiable (or multipart, which is not served):
    /// status 416 with `Content-Range: bytes */size`.
    Unsatisfiable,
}

/// Applies `Range: bytes=start-end` against a body of `size` bytes.
///
/// Either bound may be absent: `-100` is a suffix range, `100-` runs to
/// the end. Multiple ranges are answered 416 rather than multipart.
#[must_use]
pub fn negotiate(range_header: Option<&str>, size: u64) -> RangeOutcome {
    let Some(value) = range_header else {
        return RangeOutcome::Full;
    };

    let parsed = match http_range_header::parse_range_header(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(%err, "unparseable range header");
            return RangeOutcome::Unsatisfiable;
        }
    };

    match parsed.validate(size) {
        Ok(ranges) if ranges.len() == 1 => RangeOutcome::Partial(ranges[0].clone()),
        Ok(ranges) => {
            tracing::debug!(count = ranges.len(), "multipart ranges are not served");
            RangeOutcome::Unsatisfiable
        }
        Err(err) => {
            tracing::debug!(%err, "unsatisfiable range");
            RangeOutcome::Unsatisfiable
        }
    }
}

/// `Content-Range` value for a satisfied partial response.
#[must_use]
pub fn content_range(range: &RangeInclusive<u64>, size: u64) -> String {
    format!("bytes {}-{}/{size}", range.start(), range.end())
}

/// `Content-Range` value for a 416 answer.
#[must_use]
pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{size}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_serves_the_full_file() {
        assert_eq!(negotiate(None, 1000), RangeOutcome::Full);
    }

    #[test]
    fn bounded_range() {
        assert_eq!(
            negotiate(Some("bytes=100-199"), 1_048_576),
            RangeOutcome::Partial(100..=199)
        );
    }

    #[test]
    fn first_byte_alone() {
        assert_eq!(negotiate(Some("bytes=0-0"), 1000), RangeOutcome::Partial(0..=0));
    }

    #[test]
    fn suffix_range_takes_the_tail() {
        assert_eq!(
            negotiate(Some("bytes=-100"), 1000),
            RangeOutcome::Partial(900..=999)
        );
    }

    #[test]
    fn open_ended_range_runs_to_the_last_byte() {
        assert_eq!(
            negotiate(Some("bytes=100-"), 1000),
            RangeOutcome::Partial(100..=999)
        );
    }

    #[test]
    fn last_byte_range() {
        assert_eq!(
            negotiate(Some("bytes=999-999"), 1000),
            RangeOutcome::Partial(999..=999)
        );
    }

    #[test]
    fn past_the_end_is_unsatisfiable() {
        assert_eq!(
            negotiate(Some("bytes=1000-2000"), 1000),
            RangeOutcome::Unsatisfiable
        );
    }

    #[test]
    fn garbage_is_unsatisfiable() {
        assert_eq!(negotiate(Some("lines=1-2"), 1000), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn content_range_values() {
        assert_eq!(content_range(&(100..=199), 1_048_576), "bytes 100-199/1048576");
        assert_eq!(unsatisfied_range(1000), "bytes */1000");
    }
}
