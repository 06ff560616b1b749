use async_trait::async_trait;
use tracing::warn;

use crate::error::StorageError;
use crate::token::Token;
use crate::types::{Timestamp, TokenId};

// ─── Queries ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    ExecutedAt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    /// Nulls first.
    Ascending,
    /// Nulls last.
    Descending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionFilter {
    #[default]
    Any,
    Unexecuted,
}

/// A `where id in (...)` lookup.
///
/// Rows that tie on every sort key keep the order of `ids`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenQuery {
    pub ids: Vec<TokenId>,
    pub filter: ExecutionFilter,
    pub sort: Vec<SortSpec>,
    pub limit: Option<usize>,
}

impl TokenQuery {
    pub fn where_in(ids: impl IntoIterator<Item = TokenId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn unexecuted(mut self) -> Self {
        self.filter = ExecutionFilter::Unexecuted;
        self
    }

    pub fn sort_by(mut self, spec: SortSpec) -> Self {
        self.sort.push(spec);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of a conditional `executed_at` write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// `executed_at` was null and is now set. The stored record was stamped
    /// as a write and carries `version` from here on.
    Claimed { version: u64 },
    /// Another caller executed the token first.
    AlreadyClaimed,
    /// No such token in storage.
    Missing,
}

// ─── Ports ────────────────────────────────────────────────────

/// One unit of work against token storage.
///
/// Writes are staged by `persist`/`remove` and applied by `flush`.
/// `claim_execution` is the exception: it is an immediate, atomic conditional
/// update and is how at-most-once execution is enforced across callers.
#[async_trait]
pub trait StorageSession: Send + Sync {
    async fn find_by_id(&self, document: &str, id: &TokenId)
        -> Result<Option<Token>, StorageError>;

    async fn find_where_in(
        &self,
        document: &str,
        query: &TokenQuery,
    ) -> Result<Vec<Token>, StorageError>;

    /// Stamp storage bookkeeping on `token` and stage an upsert.
    async fn persist(&self, document: &str, token: &mut Token) -> Result<(), StorageError>;

    /// Stage a delete.
    async fn remove(&self, document: &str, token: &Token) -> Result<(), StorageError>;

    /// Apply all staged writes, all or nothing.
    async fn flush(&self) -> Result<(), StorageError>;

    /// Set `executed_at = at` only if it is currently null.
    ///
    /// A successful claim counts as a write: the stored version moves forward,
    /// so any copy loaded before the claim can no longer be flushed.
    async fn claim_execution(
        &self,
        document: &str,
        id: &TokenId,
        at: Timestamp,
    ) -> Result<ClaimOutcome, StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// Opens sessions owned by a single top-level call.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn StorageSession>, StorageError>;
}

// ─── Session scoping ──────────────────────────────────────────

/// A session that is either borrowed from the caller or owned by this call.
///
/// Borrowed sessions are never closed here. Owned sessions must be handed back
/// through [`SessionGuard::release`] on every exit path.
pub enum SessionGuard<'a> {
    Borrowed(&'a dyn StorageSession),
    Owned(Box<dyn StorageSession>),
}

impl<'a> SessionGuard<'a> {
    /// Use `provided` if given, otherwise open a fresh owned session.
    pub async fn ensure(
        provided: Option<&'a dyn StorageSession>,
        provider: &dyn SessionProvider,
    ) -> Result<SessionGuard<'a>, StorageError> {
        match provided {
            Some(session) => Ok(SessionGuard::Borrowed(session)),
            None => Ok(SessionGuard::Owned(provider.open().await?)),
        }
    }

    pub fn session(&self) -> &dyn StorageSession {
        match self {
            SessionGuard::Borrowed(session) => *session,
            SessionGuard::Owned(session) => session.as_ref(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, SessionGuard::Owned(_))
    }

    /// Close the session if this call owns it. Close failures are logged, not
    /// surfaced: the call's own result has already been decided.
    pub async fn release(self) {
        if let SessionGuard::Owned(session) = self {
            if let Err(e) = session.close().await {
                warn!(error = %e, "failed to close token storage session");
            }
        }
    }
}
