use std::{fmt, rc::Rc};

/// Error produced by a user supplied query or mutation function.
///
/// Cheap to clone so it can live in cached state and be handed to every observer.
/// Any `std::error::Error` converts into it, so fetchers can use `?`.
#[derive(Clone)]
pub struct FetchError(Rc<dyn std::error::Error + 'static>);

impl FetchError {
    /// Creates an error from a display message.
    pub fn msg(message: impl fmt::Display) -> Self {
        FetchError(Rc::new(Message(message.to_string())))
    }

    /// The underlying error.
    pub fn inner(&self) -> &(dyn std::error::Error + 'static) {
        &*self.0
    }

    /// Attempts to downcast the underlying error.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl<E> From<E> for FetchError
where
    E: std::error::Error + 'static,
{
    fn from(error: E) -> Self {
        FetchError(Rc::new(error))
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// Signal used to reject a cancelled fetch. Never surfaced as a query error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("query was cancelled (revert: {revert}, silent: {silent})")]
pub struct CancelledError {
    /// Restore the state captured before the fetch started.
    pub revert: bool,
    /// Skip the state transition entirely.
    pub silent: bool,
}

/// Errors returned by the engine's operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The query or mutation function failed, after retries were exhausted.
    #[error("fetch failed: {0}")]
    Fetch(FetchError),
    /// The in-flight operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    /// A `select` or `combine` function failed while deriving a result.
    #[error("selector failed: {0}")]
    Selector(FetchError),
    /// The key could not be turned into a canonical hash.
    #[error("invalid query key: {0}")]
    InvalidKey(Rc<serde_json::Error>),
    /// The hash is already registered with a different value type.
    #[error("query {query_hash} is cached with a different value type")]
    TypeMismatch {
        /// Hash of the conflicting entry.
        query_hash: String,
    },
    /// Hydration, dehydration or broadcast payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(Rc<serde_json::Error>),
    /// A fetch was requested but no query function is known for the entry.
    #[error("missing query function for {query_hash}")]
    MissingQueryFn {
        /// Hash of the entry.
        query_hash: String,
    },
    /// A mutation was executed without a mutation function.
    #[error("missing mutation function")]
    MissingMutationFn,
}

impl QueryError {
    /// Whether this is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    /// The fetch error, when the operation failed with one.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            QueryError::Fetch(error) | QueryError::Selector(error) => Some(error),
            _ => None,
        }
    }
}

impl From<FetchError> for QueryError {
    fn from(error: FetchError) -> Self {
        QueryError::Fetch(error)
    }
}

impl QueryError {
    pub(crate) fn serialization(error: serde_json::Error) -> Self {
        QueryError::Serialization(Rc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("not found")]
    struct NotFound;

    fn lookup() -> Result<u32, FetchError> {
        let found: Result<u32, NotFound> = Err(NotFound);
        Ok(found?)
    }

    #[test]
    fn converts_std_errors() {
        let error = lookup().unwrap_err();
        assert_eq!(error.to_string(), "not found");
        assert!(error.downcast_ref::<NotFound>().is_some());
    }

    #[test]
    fn equality_is_identity() {
        let a = FetchError::msg("boom");
        let b = FetchError::msg("boom");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn cancelled_is_distinguished() {
        let error: QueryError = CancelledError::default().into();
        assert!(error.is_cancelled());
        assert!(error.fetch_error().is_none());
        assert!(!QueryError::Fetch(FetchError::msg("x")).is_cancelled());
    }
}
