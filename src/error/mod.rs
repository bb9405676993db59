use std::sync::Arc;
use std::{error::Error, fmt};

const ERR_MSG_QUEUE_FULL: &str = "queue is full";
const ERR_MSG_QUEUE_EMPTY: &str = "queue is empty";
const ERR_MSG_QUEUE_CLOSED: &str = "queue is closed";
const ERR_MSG_TIMEOUT: &str = "result not ready before timeout";

pub type SyncResult<T> = Result<T, SyncError>;

/// Misuse of a synchronization primitive.
///
/// These are programming defects rather than runtime conditions: waiting on a
/// condition without holding its lock, firing a single-use waiter twice,
/// assigning a deferred result twice or passing a nonsensical argument.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SyncError {
    /// The caller does not hold the mutex the primitive is bound to.
    Ownership,
    /// A single-use object was used again.
    Usage(&'static str),
    InvalidArgument(&'static str),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Ownership => write!(f, "cannot operate on an un-acquired lock"),
            SyncError::Usage(msg) => write!(f, "usage error: {msg}"),
            SyncError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl Error for SyncError {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueueError {
    Full,
    Empty,
    Closed,
    /// Blocking call with a zero timeout.
    InvalidArgument,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            QueueError::Empty => write!(f, "{ERR_MSG_QUEUE_EMPTY}"),
            QueueError::Closed => write!(f, "{ERR_MSG_QUEUE_CLOSED}"),
            QueueError::InvalidArgument => write!(f, "'timeout' must be a positive duration"),
        }
    }
}

impl Error for QueueError {}

/// Failed `put`: the rejected item goes back to the caller.
pub struct PutError<T> {
    pub value: T,
    pub reason: QueueError,
}

impl<T> PutError<T> {
    pub fn full(value: T) -> Self {
        Self {
            value,
            reason: QueueError::Full,
        }
    }

    pub fn closed(value: T) -> Self {
        Self {
            value,
            reason: QueueError::Closed,
        }
    }

    pub fn invalid(value: T) -> Self {
        Self {
            value,
            reason: QueueError::InvalidArgument,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutError")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "put failed: {}", self.reason)
    }
}

impl<T> Error for PutError<T> {}

/// Outcome of observing a [`Deferred`](crate::sync::Deferred).
#[derive(Debug, Clone)]
pub enum TaskError {
    /// Nothing was assigned before the timeout expired.
    Timeout,
    /// The task returned an error.
    Failed(Arc<anyhow::Error>),
    /// The task panicked; carries the panic message.
    Panicked(String),
    /// The task was stopped before it ran.
    Cancelled,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            TaskError::Failed(err) => write!(f, "task failed: {err}"),
            TaskError::Panicked(msg) => write!(f, "task panicked: {msg}"),
            TaskError::Cancelled => write!(f, "task cancelled before start"),
        }
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TaskError::Failed(err) => {
                let inner: &anyhow::Error = err;
                Some(&**inner)
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(err))
    }
}
