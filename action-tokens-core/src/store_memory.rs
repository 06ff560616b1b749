//! In-memory token storage
//!
//! Shared document map behind a `tokio::sync::RwLock`. Every session keeps its
//! own staged writes and applies them on `flush`. Used by tests and by the
//! standalone server.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::store::{
    ClaimOutcome, ExecutionFilter, SessionProvider, SortDirection, SortField, SortSpec,
    StorageSession, TokenQuery,
};
use crate::token::{Executable, Token};
use crate::types::{Timestamp, TokenId};

type Documents = HashMap<String, HashMap<TokenId, Token>>;

#[derive(Default)]
struct SessionCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-memory backend. Cloning shares the same underlying documents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<Documents>>,
    counters: Arc<SessionCounters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst) - self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Number of stored tokens in `document`.
    pub async fn len(&self, document: &str) -> usize {
        let docs = self.documents.read().await;
        docs.get(document).map_or(0, HashMap::len)
    }

    pub async fn is_empty(&self, document: &str) -> bool {
        self.len(document).await == 0
    }

    /// Open a session without going through the provider trait.
    pub fn session(&self) -> MemorySession {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        MemorySession {
            documents: Arc::clone(&self.documents),
            counters: Arc::clone(&self.counters),
            staged: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SessionProvider for MemoryStore {
    async fn open(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        Ok(Box::new(self.session()))
    }
}

#[derive(Debug)]
enum StagedWrite {
    Upsert { document: String, token: Token },
    Delete { document: String, id: TokenId },
}

/// A unit of work against a [`MemoryStore`].
pub struct MemorySession {
    documents: Arc<RwLock<Documents>>,
    counters: Arc<SessionCounters>,
    staged: Mutex<Vec<StagedWrite>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::SessionClosed);
        }
        Ok(())
    }

    fn stage(&self, write: StagedWrite) -> Result<(), StorageError> {
        self.staged
            .lock()
            .map_err(|_| StorageError::Backend("staged write list poisoned".to_string()))?
            .push(write);
        Ok(())
    }

    fn take_staged(&self) -> Result<Vec<StagedWrite>, StorageError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| StorageError::Backend("staged write list poisoned".to_string()))?;
        Ok(std::mem::take(&mut *staged))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn find_by_id(
        &self,
        document: &str,
        id: &TokenId,
    ) -> Result<Option<Token>, StorageError> {
        self.ensure_open()?;
        let docs = self.documents.read().await;
        Ok(docs.get(document).and_then(|d| d.get(id)).cloned())
    }

    async fn find_where_in(
        &self,
        document: &str,
        query: &TokenQuery,
    ) -> Result<Vec<Token>, StorageError> {
        self.ensure_open()?;
        let docs = self.documents.read().await;
        let Some(doc) = docs.get(document) else {
            return Ok(Vec::new());
        };

        let mut seen = Vec::with_capacity(query.ids.len());
        let mut rows: Vec<Token> = Vec::new();
        for id in &query.ids {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            let Some(token) = doc.get(id) else {
                continue;
            };
            if query.filter == ExecutionFilter::Unexecuted && token.is_executed() {
                continue;
            }
            rows.push(token.clone());
        }

        // Stable: ties keep the order of `query.ids`
        rows.sort_by(|a, b| compare_by(a, b, &query.sort));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        debug!(
            document,
            candidates = query.ids.len(),
            matched = rows.len(),
            "memory find_where_in"
        );
        Ok(rows)
    }

    async fn persist(&self, document: &str, token: &mut Token) -> Result<(), StorageError> {
        self.ensure_open()?;
        token.stamp_persisted(Utc::now());
        self.stage(StagedWrite::Upsert {
            document: document.to_string(),
            token: token.clone(),
        })
    }

    async fn remove(&self, document: &str, token: &Token) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.stage(StagedWrite::Delete {
            document: document.to_string(),
            id: token.id().clone(),
        })
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let staged = self.take_staged()?;
        if staged.is_empty() {
            return Ok(());
        }

        let mut docs = self.documents.write().await;

        // Check every upsert before applying any of them
        for write in &staged {
            if let StagedWrite::Upsert { document, token } = write {
                if let Some(stored) = docs.get(document).and_then(|d| d.get(token.id())) {
                    if stored.version() >= token.version() {
                        return Err(StorageError::Conflict {
                            id: token.id().clone(),
                            stored: stored.version(),
                            staged: token.version(),
                        });
                    }
                }
            }
        }

        for write in staged {
            match write {
                StagedWrite::Upsert { document, token } => {
                    docs.entry(document)
                        .or_default()
                        .insert(token.id().clone(), token);
                }
                StagedWrite::Delete { document, id } => {
                    if let Some(doc) = docs.get_mut(&document) {
                        doc.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn claim_execution(
        &self,
        document: &str,
        id: &TokenId,
        at: Timestamp,
    ) -> Result<ClaimOutcome, StorageError> {
        self.ensure_open()?;
        let mut docs = self.documents.write().await;
        let Some(stored) = docs.get_mut(document).and_then(|d| d.get_mut(id)) else {
            return Ok(ClaimOutcome::Missing);
        };
        if stored.is_executed() {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        stored.restore_executed_at(at);
        stored.stamp_persisted(at);
        Ok(ClaimOutcome::Claimed {
            version: stored.version(),
        })
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        let dropped = self.take_staged()?.len();
        if dropped > 0 {
            warn!(dropped, "closing token session with unflushed writes");
        }
        Ok(())
    }
}

fn compare_by(a: &Token, b: &Token, sort: &[SortSpec]) -> CmpOrdering {
    for spec in sort {
        let (left, right) = match spec.field {
            SortField::CreatedAt => (a.created_at(), b.created_at()),
            SortField::ExecutedAt => (a.executed_at(), b.executed_at()),
        };
        // Option orders None before Some: ascending puts nulls first
        let ord = match spec.direction {
            SortDirection::Ascending => left.cmp(&right),
            SortDirection::Descending => right.cmp(&left),
        };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    CmpOrdering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seed(session: &MemorySession, tokens: Vec<Token>) {
        for mut token in tokens {
            session.persist("tokens", &mut token).await.unwrap();
        }
        session.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_are_invisible_until_flush() {
        let store = MemoryStore::new();
        let session = store.session();

        let mut token = Token::simple("t1");
        session.persist("tokens", &mut token).await.unwrap();
        assert!(session
            .find_by_id("tokens", &"t1".into())
            .await
            .unwrap()
            .is_none());

        session.flush().await.unwrap();
        let found = session.find_by_id("tokens", &"t1".into()).await.unwrap();
        assert_eq!(found.unwrap().version(), 1);
        assert!(token.created_at().is_some());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let session = store.session();
        seed(&session, vec![Token::simple("t1")]).await;

        let mut first = session.find_by_id("tokens", &"t1".into()).await.unwrap().unwrap();
        let mut second = first.clone();

        session.persist("tokens", &mut first).await.unwrap();
        session.flush().await.unwrap();

        session.persist("tokens", &mut second).await.unwrap();
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { stored: 2, staged: 2, .. }));
    }

    #[tokio::test]
    async fn test_find_where_in_filters_sorts_and_limits() {
        let store = MemoryStore::new();
        let session = store.session();
        let base = Utc::now() - Duration::minutes(1);
        let tokens = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut token = Token::simple(*id);
                token.stamp_persisted(base + Duration::seconds(i as i64));
                token
            })
            .collect();
        seed(&session, tokens).await;

        let outcome = session
            .claim_execution("tokens", &"a".into(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed { version: 2 });

        let query = TokenQuery::where_in(vec!["c".into(), "a".into(), "b".into(), "zz".into()])
            .unexecuted()
            .sort_by(SortSpec::asc(SortField::CreatedAt))
            .sort_by(SortSpec::asc(SortField::ExecutedAt));
        let rows = session.find_where_in("tokens", &query).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let first = session
            .find_where_in("tokens", &query.clone().limit(1))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), &TokenId::from("b"));
    }

    #[test]
    fn test_descending_sort_puts_nulls_last() {
        let now = Utc::now();
        let mut executed = Token::simple("x");
        executed.execute(now).unwrap();
        let pending = Token::simple("y");

        let desc = [SortSpec::desc(SortField::ExecutedAt)];
        assert_eq!(compare_by(&executed, &pending, &desc), CmpOrdering::Less);

        let asc = [SortSpec::asc(SortField::ExecutedAt)];
        assert_eq!(compare_by(&executed, &pending, &asc), CmpOrdering::Greater);

        let mut later = Token::simple("z");
        later.execute(now + Duration::seconds(1)).unwrap();
        assert_eq!(compare_by(&executed, &later, &asc), CmpOrdering::Less);
    }

    #[tokio::test]
    async fn test_claim_execution_is_conditional() {
        let store = MemoryStore::new();
        let session = store.session();
        seed(&session, vec![Token::simple("t1")]).await;

        let at = Utc::now();
        let id = TokenId::from("t1");
        assert_eq!(
            session.claim_execution("tokens", &id, at).await.unwrap(),
            ClaimOutcome::Claimed { version: 2 }
        );
        assert_eq!(
            session
                .claim_execution("tokens", &id, at + Duration::seconds(1))
                .await
                .unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(
            session
                .claim_execution("tokens", &"nope".into(), at)
                .await
                .unwrap(),
            ClaimOutcome::Missing
        );

        let stored = session.find_by_id("tokens", &id).await.unwrap().unwrap();
        assert_eq!(stored.executed_at(), Some(at));
    }

    #[tokio::test]
    async fn test_claim_invalidates_copies_loaded_before_it() {
        let store = MemoryStore::new();
        let session = store.session();
        seed(&session, vec![Token::simple("t1")]).await;

        let id = TokenId::from("t1");
        let mut stale = session.find_by_id("tokens", &id).await.unwrap().unwrap();
        session
            .claim_execution("tokens", &id, Utc::now())
            .await
            .unwrap();

        session.persist("tokens", &mut stale).await.unwrap();
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { stored: 2, staged: 2, .. }));

        let stored = session.find_by_id("tokens", &id).await.unwrap().unwrap();
        assert!(stored.is_executed());
        assert_eq!(stored.version(), 2);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let store = MemoryStore::new();
        let session = store.session();
        assert_eq!(store.open_sessions(), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(store.open_sessions(), 0);

        let err = session.find_by_id("tokens", &"t1".into()).await.unwrap_err();
        assert!(matches!(err, StorageError::SessionClosed));
    }

    #[tokio::test]
    async fn test_remove_deletes_on_flush() {
        let store = MemoryStore::new();
        let session = store.session();
        seed(&session, vec![Token::simple("t1")]).await;
        assert_eq!(store.len("tokens").await, 1);

        let token = session.find_by_id("tokens", &"t1".into()).await.unwrap().unwrap();
        session.remove("tokens", &token).await.unwrap();
        assert_eq!(store.len("tokens").await, 1);
        session.flush().await.unwrap();
        assert!(store.is_empty("tokens").await);
    }
}
