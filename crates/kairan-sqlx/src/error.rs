use kairan_core::ErrorKind;

#[derive(Debug)]
/// Error returned by [`PostgresStore`](crate::PostgresStore) and the listener.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    pub(crate) fn new_database(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Error {
            kind: ErrorKind::Database,
            inner: error,
        }
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::new_database(Box::new(value))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Self::new_database(Box::new(value))
    }
}

impl From<kairan_core::Error> for Error {
    fn from(value: kairan_core::Error) -> Self {
        let (kind, inner) = value.into_parts();
        Self { kind, inner }
    }
}

impl From<Error> for kairan_core::Error {
    fn from(value: Error) -> Self {
        kairan_core::Error::new(value.kind, value.inner)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
            inner: Box::new(value),
        }
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
