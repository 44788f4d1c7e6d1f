use std::error::Error;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ShaperError {
    #[error("requested {requested} bytes but the burst is {burst} bytes")]
    UnsatisfiableRequest { requested: u64, burst: u64 },
    #[error("admission cancelled")]
    Cancelled,
    #[error("admission deadline exceeded")]
    DeadlineExceeded,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ShaperError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    /// True for errors raised by the admission controller itself
    /// (as opposed to errors of the wrapped transport).
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::UnsatisfiableRequest { .. } | Self::Cancelled | Self::DeadlineExceeded
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl From<ShaperError> for io::Error {
    fn from(error: ShaperError) -> Self {
        let kind = match error {
            // transport errors surface unchanged
            ShaperError::Io(e) => return e,
            ShaperError::UnsatisfiableRequest { .. } => io::ErrorKind::InvalidInput,
            ShaperError::DeadlineExceeded => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_errors_keep_their_source() {
        let err: io::Error = ShaperError::UnsatisfiableRequest {
            requested: 21,
            burst: 20,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<ShaperError>())
            .unwrap();
        assert!(matches!(
            inner,
            ShaperError::UnsatisfiableRequest {
                requested: 21,
                burst: 20
            }
        ));
    }

    #[test]
    fn test_io_errors_pass_through_unchanged() {
        let err: io::Error =
            ShaperError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.get_ref().unwrap().downcast_ref::<ShaperError>().is_none());
    }

    #[test]
    fn test_cancellation_kinds() {
        // not Interrupted, which callers are expected to retry
        let cancelled: io::Error = ShaperError::Cancelled.into();
        assert_eq!(cancelled.kind(), io::ErrorKind::Other);
        assert!(ShaperError::DeadlineExceeded.is_cancellation());
        assert!(!ShaperError::Config("x".into()).is_admission_error());
    }
}
