//! Error type shared by the store-agnostic parts of the queue.
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of queue failures.
///
/// Callers branch on the kind, never on the message: `Database` is
/// retryable infrastructure trouble, `LostLease` means another worker now
/// owns the job, the rest are caller mistakes.
pub enum ErrorKind {
    /// The backing store could not be reached or rejected the statement.
    Database,
    /// A payload could not be serialized.
    Encode,
    /// A stored payload or column could not be decoded.
    Decode,
    /// The request violates a precondition (e.g. `max_attempts = 0`).
    InvalidInput,
    /// The worker no longer owns the job (lease expired and reclaimed, or
    /// the job was resolved by someone else).
    LostLease,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            kind,
            inner: error.into(),
        }
    }

    pub fn encode(error: serde_json::Error) -> Self {
        Self::new(ErrorKind::Encode, error)
    }

    pub fn decode(error: serde_json::Error) -> Self {
        Self::new(ErrorKind::Decode, error)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message.into())
    }

    pub fn lost_lease(job_id: JobId) -> Self {
        Self::new(ErrorKind::LostLease, LostLeaseError { job_id })
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Split into kind and source, for wrapping by backend error types.
    pub fn into_parts(self) -> (ErrorKind, Box<dyn std::error::Error + Send + Sync + 'static>) {
        (self.kind, self.inner)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct LostLeaseError {
    job_id: JobId,
}

impl std::fmt::Display for LostLeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lost lease for job {}", self.job_id)
    }
}

impl std::error::Error for LostLeaseError {}
