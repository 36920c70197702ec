//! Error types and result definitions for sync operations.
//!
//! Provides an error system with classification, aggregation and captured
//! diagnostic metadata. [`SyncError`] represents single errors with optional
//! detail and source, or multiple aggregated errors when several entity
//! pipelines fail in the same run.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

/// Convenient result type for sync operations using [`SyncError`] as the error type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Detailed payload stored for single [`SyncError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    /// Server-provided wait hint, set on rate-limit responses that carry a
    /// `Retry-After` header.
    retry_after: Option<Duration>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type for sync operations.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, used when several entities fail in one run.
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Specific categories of errors that can occur during a sync run.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source fetch errors.
    /// Transport-level failure reaching the source (timeout, connect error).
    SourceConnectionFailed,
    /// The source answered with a 5xx status.
    SourceUnavailable,
    /// The source answered 429.
    SourceRateLimited,
    /// The source rejected the request with a non-retriable 4xx status.
    SourceRequestFailed,
    /// The source response body could not be decoded.
    SourceResponseInvalid,
    /// The fetch was canceled by the run shutdown signal.
    SourceOperationCanceled,

    // Warehouse errors.
    DestinationConnectionFailed,
    DestinationQueryFailed,
    /// The warehouse rejected an additive column addition.
    SchemaEvolutionFailed,
    /// Loading rows into the staging table failed.
    StagingLoadFailed,
    /// The atomic upsert against the target table failed.
    MergeFailed,

    // Data errors.
    ConversionError,
    InvalidData,
    SerializationError,
    DeserializationError,

    // Configuration and state errors.
    ConfigError,
    InvalidState,
    IoError,

    // Unknown / uncategorized.
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind is expected to recover on retry.
    ///
    /// Kept narrow on purpose: only transient connectivity and capacity
    /// failures qualify. Everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::SourceUnavailable
                | ErrorKind::SourceRateLimited
                | ErrorKind::DestinationConnectionFailed
        )
    }
}

impl SyncError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or
    /// [`ErrorKind::Unknown`] if the list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Whether this error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the server-provided retry hint, if one was captured.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.retry_after,
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] to this error.
    ///
    /// The stored source is preserved across clones and exposed via
    /// [`error::Error::source`]. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    /// Attaches a retry hint taken from a rate-limit response.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.retry_after = Some(retry_after);
        }
        self
    }

    /// Creates a [`SyncError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                retry_after: None,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail: {detail}")?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    for (line_index, line) in rendered.lines().enumerate() {
                        if line_index == 0 {
                            write!(f, "\n  {}. {}", index + 1, line)?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            // For aggregated errors, the first contained error is the source.
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates a [`SyncError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`SyncError`] from an error kind, static description and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Creates a [`SyncError`] from a vector of errors for aggregation.
///
/// A vector with exactly one error unwraps to that error directly.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();

        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            return errors.pop().expect("just checked length is 1");
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts [`std::io::Error`] to [`SyncError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`SyncError`] with the appropriate kind.
impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            _ => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`chrono::ParseError`] to [`SyncError`] with [`ErrorKind::ConversionError`].
impl From<chrono::ParseError> for SyncError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Datetime parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`reqwest::Error`] to [`SyncError`] with the appropriate kind.
///
/// Timeouts and connection failures are classified as transient; body decode
/// failures as invalid responses. Status-code handling happens in the fetch
/// layer before this conversion applies, so a status error reaching this
/// point keeps its permanent classification.
impl From<reqwest::Error> for SyncError {
    #[track_caller]
    fn from(err: reqwest::Error) -> SyncError {
        let (kind, description) = if err.is_timeout() || err.is_connect() {
            (
                ErrorKind::SourceConnectionFailed,
                "Source connection failed",
            )
        } else if err.is_decode() {
            (
                ErrorKind::SourceResponseInvalid,
                "Source response body could not be decoded",
            )
        } else {
            (ErrorKind::SourceRequestFailed, "Source request failed")
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts BigQuery client errors to [`SyncError`].
#[cfg(feature = "bigquery")]
impl From<gcp_bigquery_client::error::BQError> for SyncError {
    #[track_caller]
    fn from(err: gcp_bigquery_client::error::BQError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::DestinationQueryFailed,
            Cow::Borrowed("BigQuery operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_error;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let error = sync_error!(
            ErrorKind::SourceRequestFailed,
            "Request rejected",
            "status 404 from /users page 3"
        );

        assert_eq!(error.kind(), ErrorKind::SourceRequestFailed);
        assert_eq!(error.detail(), Some("status 404 from /users page 3"));
        assert!(!error.is_transient());
    }

    #[test]
    fn transient_classification_is_narrow() {
        assert!(ErrorKind::SourceConnectionFailed.is_transient());
        assert!(ErrorKind::SourceUnavailable.is_transient());
        assert!(ErrorKind::SourceRateLimited.is_transient());
        assert!(!ErrorKind::SourceRequestFailed.is_transient());
        assert!(!ErrorKind::SourceResponseInvalid.is_transient());
        assert!(!ErrorKind::MergeFailed.is_transient());
    }

    #[test]
    fn aggregation_of_one_error_unwraps() {
        let single = sync_error!(ErrorKind::MergeFailed, "Merge failed");
        let aggregated: SyncError = vec![single].into();

        assert_eq!(aggregated.kind(), ErrorKind::MergeFailed);
        assert_eq!(aggregated.kinds().len(), 1);
    }

    #[test]
    fn aggregation_keeps_all_kinds() {
        let errors = vec![
            sync_error!(ErrorKind::MergeFailed, "Merge failed"),
            sync_error!(ErrorKind::SourceUnavailable, "Source down"),
        ];
        let aggregated: SyncError = errors.into();

        assert_eq!(
            aggregated.kinds(),
            vec![ErrorKind::MergeFailed, ErrorKind::SourceUnavailable]
        );
    }

    #[test]
    fn retry_after_round_trips() {
        let error = sync_error!(ErrorKind::SourceRateLimited, "Rate limited")
            .with_retry_after(Duration::from_secs(7));

        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
    }
}
