//! Half-open byte intervals.
//!
//! A [`Range`] covers `[start, start + size)`. The sentinel size
//! [`Range::FULL`] means "to the end of the object"; such a range must be
//! resolved against a concrete object length (see [`Range::clip`]) before any
//! containment arithmetic.

use crate::domain::errors::{CloudError, CloudResult};

/// A half-open byte interval `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

impl Range {
    /// Sentinel size meaning "to the end of the object".
    pub const FULL: u64 = u64::MAX;

    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// The whole object.
    pub fn full() -> Self {
        Self {
            start: 0,
            size: Range::FULL,
        }
    }

    pub fn is_full(&self) -> bool {
        self.size == Range::FULL
    }

    /// One past the last byte. `None` for full ranges.
    pub fn end(&self) -> Option<u64> {
        if self.is_full() {
            None
        } else {
            Some(self.start + self.size)
        }
    }

    /// Clamps the range into `[0, len)`, resolving the full sentinel.
    ///
    /// A start at or beyond `len` collapses to an empty range at the end of
    /// the object.
    pub fn clip(&self, len: u64) -> Range {
        let start = self.start.min(len);
        let size = if self.is_full() {
            len - start
        } else {
            self.size.min(len - start)
        };
        Range { start, size }
    }

    /// True when `self` lies entirely within `outer`. Both ranges must have
    /// concrete sizes.
    pub fn is_inside(&self, outer: &Range) -> bool {
        debug_assert!(!self.is_full() && !outer.is_full());
        self.start >= outer.start
            && self.start + self.size <= outer.start + outer.size
    }

    /// Parses an HTTP `Range` header value such as `bytes=0-7` or
    /// `bytes=100-`. Only single ranges are supported.
    pub fn parse_http(header: &str) -> CloudResult<Range> {
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| CloudError::invalid_range(format!("bad range header: {header}")))?;
        let (from, to) = spec
            .split_once('-')
            .ok_or_else(|| CloudError::invalid_range(format!("bad range header: {header}")))?;
        let start: u64 = from
            .parse()
            .map_err(|_| CloudError::invalid_range(format!("bad range start: {header}")))?;
        let size = if to.is_empty() {
            Range::FULL
        } else {
            let end: u64 = to
                .parse()
                .map_err(|_| CloudError::invalid_range(format!("bad range end: {header}")))?;
            if end < start {
                return Err(CloudError::invalid_range(format!(
                    "inverted range: {header}"
                )));
            }
            end - start + 1
        };
        Ok(Range { start, size })
    }

    /// Renders a `Content-Range` header value for a range within an object
    /// of `len` bytes. The range must be concrete and non-empty.
    pub fn content_range(&self, len: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.start + self.size - 1, len)
    }

    /// Renders the request `Range` header value; `None` when the range
    /// covers the whole object and the header can be omitted.
    pub fn http_header_value(&self) -> Option<String> {
        if self.start == 0 && self.is_full() {
            None
        } else if self.is_full() {
            Some(format!("bytes={}-", self.start))
        } else {
            Some(format!(
                "bytes={}-{}",
                self.start,
                self.start + self.size - 1
            ))
        }
    }
}
