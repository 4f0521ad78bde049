//! Per-key entry states and resolve outcomes.

use tokio::sync::watch;
use tokio::time::Instant;

use crate::fetch::FetchError;
use crate::storage::{StorageError, StoredObject};

/// Broadcast value of one in-flight fill: `None` until the fill resolves,
/// then the shared result every waiter observes.
pub(crate) type FillSlot = Option<Result<StoredObject, FetchFailure>>;

/// State of one cache key. Absence from the table is the implicit
/// `Absent` state; everything else is owned by the coordinator.
pub(crate) enum EntryState {
    /// An origin retrieval is in progress; callers attach to the handle.
    Fetching(watch::Receiver<FillSlot>),
    /// Stored durably; resolves are pure hits from here on.
    Present(StoredObject),
    /// The last fill failed; replayed to callers until the cooldown ends.
    Failed {
        failure: FetchFailure,
        failed_at: Instant,
    },
}

/// Result of [`CacheCoordinator::resolve`](super::CacheCoordinator::resolve).
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The object was already stored; no origin contact happened.
    Hit(StoredObject),
    /// The object was filled (by this caller or a fill it attached to).
    Miss(StoredObject),
    /// The fill failed, or a previous failure is still cooling down.
    Failure(FetchFailure),
}

/// Cloneable failure surfaced to every waiter of a fill.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Origin timed out or errored after exhausting retries.
    OriginUnavailable,
    /// Origin answered 4xx; retrying will not help.
    OriginRejected,
    /// Fetched bytes are not worth caching (HTML error page, undersized,
    /// oversized). Clients are forwarded to the origin instead.
    NotCacheable,
    /// The durable store refused the write.
    StorageWrite,
}

impl FetchFailure {
    pub(crate) fn not_cacheable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NotCacheable,
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::StorageWrite,
            message: message.into(),
        }
    }
}

impl From<&FetchError> for FetchFailure {
    fn from(err: &FetchError) -> Self {
        let kind = match err {
            FetchError::Unavailable { .. } => FailureKind::OriginUnavailable,
            FetchError::Rejected { .. } => FailureKind::OriginRejected,
            FetchError::TooLarge { .. } => FailureKind::NotCacheable,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<&StorageError> for FetchFailure {
    fn from(err: &StorageError) -> Self {
        Self {
            kind: FailureKind::StorageWrite,
            message: err.to_string(),
        }
    }
}
