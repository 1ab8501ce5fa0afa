use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by a running pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A stage function panicked while processing a value
    #[error("stage '{stage}' panicked: {message}")]
    StagePanic {
        /// Label of the failing stage (e.g. `filter#1`)
        stage: String,
        /// The panic payload, rendered as text
        message: String,
    },
}

/// Status of a failed pop operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The queue holds no value and is still open (non-blocking pops only)
    #[error("queue is empty")]
    Empty,

    /// The queue mutex could not be acquired without waiting
    /// (`nonblocking_pop` only)
    #[error("queue is busy")]
    Busy,

    /// The queue is closed and fully drained
    #[error("queue is closed")]
    Closed,
}

/// Status of a failed push operation; the rejected value is handed back
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError<T> {
    /// No slot is available and the queue is still open (non-blocking
    /// pushes only)
    #[error("queue is full")]
    Full(T),

    /// The queue mutex could not be acquired without waiting
    /// (`nonblocking_push` only)
    #[error("queue is busy")]
    Busy(T),

    /// The queue is closed; no further pushes are accepted
    #[error("queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the value that could not be pushed
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(value) | PushError::Busy(value) | PushError::Closed(value) => value,
        }
    }

    /// True if the push failed because the queue is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl PopError {
    /// True if the pop failed because the queue is closed and drained
    pub fn is_closed(&self) -> bool {
        matches!(self, PopError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_error_into_inner() {
        assert_eq!(PushError::Full(7).into_inner(), 7);
        assert_eq!(PushError::Closed("x").into_inner(), "x");
    }

    #[test]
    fn test_closed_predicates() {
        assert!(PushError::Closed(0).is_closed());
        assert!(!PushError::Full(0).is_closed());
        assert!(PopError::Closed.is_closed());
        assert!(!PopError::Empty.is_closed());
    }
}
