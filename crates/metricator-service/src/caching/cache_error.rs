use thiserror::Error;

/// An error that happens when reading from or writing to a cache store.
///
/// A missing or expired entry is not an error. Lookups report those as `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The caller passed a key or TTL the store cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The backing store could not be reached or failed to perform the operation.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    /// An entry exists, but its contents or metadata cannot be decoded.
    #[error("corrupt cache entry: {0}")]
    CorruptEntry(String),
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "cache store I/O failed");
        Self::StoreUnavailable(err.to_string())
    }
}

impl CacheError {
    /// A short, stable name used to tag metrics and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::InvalidArgument(_) => "invalid_argument",
            CacheError::StoreUnavailable(_) => "store_unavailable",
            CacheError::CorruptEntry(_) => "corrupt_entry",
        }
    }
}

/// The result of a cache operation.
pub type CacheContents<T = ()> = Result<T, CacheError>;

/// Rejects empty keys and zero TTLs, which no store accepts.
pub(super) fn validate_write(key: &str, ttl: std::time::Duration) -> CacheContents {
    validate_key(key)?;
    if ttl.is_zero() {
        return Err(CacheError::InvalidArgument("ttl must be positive".into()));
    }
    Ok(())
}

pub(super) fn validate_key(key: &str) -> CacheContents {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("cache key must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;

    #[test]
    fn io_errors_mean_unavailable() {
        let err = CacheError::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, CacheError::StoreUnavailable(_)));
        assert_eq!(err.kind(), "store_unavailable");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(validate_write("dataset", Duration::from_secs(1)).is_ok());
        assert!(matches!(
            validate_write("dataset", Duration::ZERO),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_write("", Duration::from_secs(1)),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
