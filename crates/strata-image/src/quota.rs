//! Quota-enforcing byte streams.
//!
//! A [`QuotaedReader`] counts the bytes pulled through it while a layer is
//! unpacked. Reads are clamped to one byte past the remaining quota, so the
//! read that crosses the limit observes the extra byte and fails with a
//! quota error instead of ending quietly at the boundary.

use std::error::Error as StdError;
use std::io::{self, Read};

use strata_common::error::{Result, StrataError};
use thiserror::Error;

/// Raised inside an [`io::Error`] when a stream outgrows its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream exceeds the quota of {limit} bytes")]
pub struct QuotaExceededError {
    /// Quota the reader started with.
    pub limit: u64,
}

/// Returns the quota of a [`QuotaExceededError`] found anywhere in the
/// chain of `err`.
///
/// Archive readers wrap I/O errors of the underlying stream, so the quota
/// error can sit several levels deep.
pub fn quota_exceeded_limit(err: &io::Error) -> Option<u64> {
    let mut current = err.get_ref().map(|e| e as &(dyn StdError + 'static));
    while let Some(e) = current {
        if let Some(quota) = e.downcast_ref::<QuotaExceededError>() {
            return Some(quota.limit);
        }
        current = match e.downcast_ref::<io::Error>() {
            Some(inner) => inner.get_ref().map(|i| i as &(dyn StdError + 'static)),
            None => e.source(),
        };
    }
    None
}

/// Wraps a byte source with an optional quota.
///
/// Not meant to be shared between threads: reads mutate the remaining
/// quota.
#[derive(Debug)]
pub struct QuotaedReader<R> {
    inner: R,
    limit: Option<u64>,
    remaining: u64,
    skip_validation: bool,
    exceeded: bool,
}

impl<R: Read> QuotaedReader<R> {
    /// Wraps `inner` with `quota` bytes; a negative quota disables the
    /// limit. With `skip_validation` the bytes are not counted at all.
    pub fn new(inner: R, quota: i64, skip_validation: bool) -> Self {
        let limit = u64::try_from(quota).ok();
        Self {
            inner,
            limit,
            remaining: limit.unwrap_or(0),
            skip_validation,
            exceeded: false,
        }
    }

    /// Returns `true` if the quota is enforced and some of it is left.
    pub const fn any_quota_left(&self) -> bool {
        self.limit.is_some() && !self.skip_validation && !self.exceeded && self.remaining > 0
    }

    /// Returns the remaining quota, or `-1` when the reader is unlimited.
    pub fn quota_left(&self) -> i64 {
        match self.limit {
            Some(_) => i64::try_from(self.remaining).unwrap_or(i64::MAX),
            None => strata_common::constants::UNLIMITED_QUOTA,
        }
    }

    /// Returns `true` once a read crossed the quota.
    pub const fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Always fails: the wrapped stream belongs to whoever opened it.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidOperation` on every call.
    pub fn close(&mut self) -> Result<()> {
        tracing::error!("close called on a quotaed reader");
        Err(StrataError::InvalidOperation {
            message: "a quotaed reader must not be closed, its stream is owned by the streamer",
        })
    }

    fn quota_error(&self) -> io::Error {
        io::Error::other(QuotaExceededError {
            limit: self.limit.unwrap_or(0),
        })
    }
}

impl<R: Read> Read for QuotaedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exceeded {
            return Err(self.quota_error());
        }
        if self.limit.is_none() || self.skip_validation {
            return self.inner.read(buf);
        }

        let allowed = usize::try_from(self.remaining.saturating_add(1)).unwrap_or(usize::MAX);
        let len = buf.len().min(allowed);
        let n = self.inner.read(&mut buf[..len])?;

        let read = n as u64;
        if read > self.remaining {
            self.remaining = 0;
            self.exceeded = true;
            return Err(self.quota_error());
        }
        self.remaining -= read;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Drains `reader` in `chunk`-sized reads, returning the bytes seen
    /// before the first error and that error.
    fn drain<R: Read>(reader: &mut R, chunk: usize) -> (usize, Option<io::Error>) {
        let mut total = 0;
        let mut buf = vec![0u8; chunk];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return (total, None),
                Ok(n) => total += n,
                Err(e) => return (total, Some(e)),
            }
        }
    }

    fn payload(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new(vec![7u8; len])
    }

    #[test]
    fn unlimited_reader_passes_everything_through() {
        let mut reader = QuotaedReader::new(payload(10_000), -1, false);
        let (total, err) = drain(&mut reader, 4096);
        assert_eq!(total, 10_000);
        assert!(err.is_none());
        assert!(!reader.any_quota_left());
        assert_eq!(reader.quota_left(), -1);
    }

    #[test]
    fn skipped_validation_ignores_quota() {
        let mut reader = QuotaedReader::new(payload(100), 10, true);
        let (total, err) = drain(&mut reader, 64);
        assert_eq!(total, 100);
        assert!(err.is_none());
        assert!(!reader.any_quota_left());
    }

    #[test]
    fn quota_equal_to_payload_succeeds() {
        let mut reader = QuotaedReader::new(payload(100), 100, false);
        let mut out = Vec::new();
        let read = reader.read_to_end(&mut out).expect("read");
        assert_eq!(read, 100);
        assert_eq!(reader.quota_left(), 0);
        assert!(!reader.any_quota_left());
    }

    #[test]
    fn quota_one_above_payload_succeeds() {
        let mut reader = QuotaedReader::new(payload(99), 100, false);
        let (total, err) = drain(&mut reader, 7);
        assert_eq!(total, 99);
        assert!(err.is_none());
        assert!(reader.any_quota_left());
        assert_eq!(reader.quota_left(), 1);
    }

    #[test]
    fn payload_one_above_quota_fails_on_crossing_read() {
        let mut reader = QuotaedReader::new(payload(101), 100, false);
        let (total, err) = drain(&mut reader, 1000);
        let err = err.expect("quota error");
        assert_eq!(quota_exceeded_limit(&err), Some(100));
        assert!(total <= 101);
        assert!(reader.exceeded());
    }

    #[test]
    fn crossing_read_is_clamped_to_quota_plus_one() {
        struct Recorder {
            requested: Vec<usize>,
            data: Cursor<Vec<u8>>,
        }
        impl Read for Recorder {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.requested.push(buf.len());
                self.data.read(buf)
            }
        }

        let mut reader = QuotaedReader::new(
            Recorder {
                requested: Vec::new(),
                data: payload(50),
            },
            10,
            false,
        );
        let mut buf = [0u8; 32];
        let err = reader.read(&mut buf).expect_err("over quota");
        assert_eq!(quota_exceeded_limit(&err), Some(10));
        assert_eq!(reader.inner.requested, vec![11]);
    }

    #[test]
    fn reader_stays_failed_after_crossing() {
        let mut reader = QuotaedReader::new(payload(20), 5, false);
        let mut buf = [0u8; 16];
        assert!(reader.read(&mut buf).is_err());
        assert!(reader.read(&mut buf).is_err());
        assert!(!reader.any_quota_left());
    }

    #[test]
    fn cumulative_bytes_never_exceed_quota_plus_one() {
        for chunk in [1, 3, 10, 64] {
            let mut reader = QuotaedReader::new(payload(500), 40, false);
            let (total, err) = drain(&mut reader, chunk);
            assert!(err.is_some(), "chunk {chunk}");
            assert!(total <= 41, "chunk {chunk} returned {total}");
        }
    }

    #[test]
    fn megabyte_quota_rejects_one_extra_byte() {
        let mut reader = QuotaedReader::new(payload(1_048_577), 1_048_576, false);
        let err = io::copy(&mut reader, &mut io::sink()).expect_err("quota error");
        assert_eq!(quota_exceeded_limit(&err), Some(1_048_576));
    }

    #[test]
    fn zero_quota_with_empty_stream_succeeds() {
        let mut reader = QuotaedReader::new(payload(0), 0, false);
        let (total, err) = drain(&mut reader, 8);
        assert_eq!(total, 0);
        assert!(err.is_none());
    }

    #[test]
    fn close_always_fails() {
        let mut reader = QuotaedReader::new(payload(1), -1, false);
        assert!(matches!(
            reader.close(),
            Err(StrataError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn quota_error_is_found_through_wrapping_errors() {
        #[derive(Debug, Error)]
        #[error("failed to unpack entry")]
        struct Wrapper(#[source] io::Error);

        let inner = io::Error::other(QuotaExceededError { limit: 3 });
        let wrapped = io::Error::other(Wrapper(inner));
        assert_eq!(quota_exceeded_limit(&wrapped), Some(3));
        assert_eq!(quota_exceeded_limit(&io::Error::other("plain")), None);
    }
}
