//! Token Orchestrator
//!
//! The service every caller goes through. Each operation runs the same chain:
//!
//! ```text
//! acquire session -> fetch -> transition -> persist/flush -> emit -> release
//! ```
//!
//! Steps are strictly sequential within one call. Independent calls share no
//! lock; at-most-once execution across callers comes from the storage-level
//! conditional claim ([`StorageSession::claim_execution`]).
//!
//! Composite chains keep no cursor. The next member is recomputed from member
//! `executed_at` values on every call, so a retry or crash between steps can
//! never leave a composite pointing at the wrong member.

use async_trait::async_trait;
use chrono::Utc;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use crate::deserialize::{JsonTokenDeserializer, TokenDeserializer};
use crate::error::{StorageError, TokenError};
use crate::events::{event_name, EventSink, InboundContext, Lifecycle, TokenEvent};
use crate::id::generate_token_id;
use crate::store::{
    ClaimOutcome, SessionGuard, SessionProvider, SortField, SortSpec, StorageSession, TokenQuery,
};
use crate::token::{Chainable, Executable, MemberRef, Token, TokenDraft, Viewable};
use crate::types::{TokenId, TokenPayload};
use crate::validate::{TokenValidator, Validator};

// ─── Per-call arguments ───────────────────────────────────────

/// Side effects run inside a lifecycle transition.
///
/// Both run after the in-memory transition and before the event is emitted.
#[async_trait]
pub trait TokenHooks: Send + Sync {
    /// Runs after the execution marker has been claimed. A failure is reported
    /// as [`TokenError::Hook`]; the token stays executed.
    async fn on_execute(
        &self,
        _token: &Token,
        _context: Option<&InboundContext>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the view is counted in memory. A failure aborts the view
    /// before anything is persisted.
    async fn on_view(&self, _token: &Token, _context: Option<&InboundContext>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Optional arguments shared by every orchestrator operation.
#[derive(Default, Clone)]
pub struct CallScope<'a> {
    /// Caller-owned session. Never closed by the orchestrator.
    pub session: Option<&'a dyn StorageSession>,
    /// Storage document; the configured default when `None`.
    pub document: Option<&'a str>,
    /// Passed through to events and hooks untouched.
    pub context: Option<InboundContext>,
    pub hooks: Option<&'a dyn TokenHooks>,
}

impl<'a> CallScope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: &'a dyn StorageSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn in_document(mut self, document: &'a str) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_context(mut self, context: InboundContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_hooks(mut self, hooks: &'a dyn TokenHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

impl fmt::Debug for CallScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallScope")
            .field("session", &self.session.map(|_| ".."))
            .field("document", &self.document)
            .field("context", &self.context)
            .field("hooks", &self.hooks.map(|_| ".."))
            .finish()
    }
}

/// A token given by id, or an already-loaded entity.
#[derive(Debug, Clone)]
pub enum TokenTarget {
    Id(TokenId),
    Entity(Token),
}

impl From<TokenId> for TokenTarget {
    fn from(id: TokenId) -> Self {
        TokenTarget::Id(id)
    }
}

impl From<&str> for TokenTarget {
    fn from(id: &str) -> Self {
        TokenTarget::Id(TokenId::from(id))
    }
}

impl From<Token> for TokenTarget {
    fn from(token: Token) -> Self {
        TokenTarget::Entity(token)
    }
}

impl TryFrom<&Value> for TokenTarget {
    type Error = TokenError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(_) | Value::Object(_) => MemberRef::from(value)
                .resolve_id()
                .map(|id| TokenTarget::Id(TokenId::from(id)))
                .ok_or_else(|| {
                    TokenError::InvalidArgument("token object without an id".to_string())
                }),
            other => Err(TokenError::InvalidArgument(format!(
                "token id or entity expected, got {other}"
            ))),
        }
    }
}

// ─── Outcomes ─────────────────────────────────────────────────

/// Result of `execute_token`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    NotFound,
    /// The caller should act on `next_id` next.
    Next {
        #[serde(rename = "nextId")]
        next_id: TokenId,
        token: Token,
    },
    Executed {
        token: Token,
    },
}

impl ExecutionOutcome {
    pub fn token(&self) -> Option<&Token> {
        match self {
            ExecutionOutcome::NotFound => None,
            ExecutionOutcome::Next { token, .. } | ExecutionOutcome::Executed { token } => {
                Some(token)
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecutionOutcome::NotFound)
    }
}

/// Result of `view_token`.
#[derive(Debug, Clone)]
pub enum ViewOutcome {
    NotFound,
    Viewed { token: Token },
    /// The token was not viewable and was executed instead.
    Executed(ExecutionOutcome),
}

impl ViewOutcome {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ViewOutcome::NotFound | ViewOutcome::Executed(ExecutionOutcome::NotFound)
        )
    }
}

impl Serialize for ViewOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ViewOutcome::NotFound => ExecutionOutcome::NotFound.serialize(serializer),
            ViewOutcome::Viewed { token } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("status", "viewed")?;
                map.serialize_entry("token", token)?;
                map.end()
            }
            ViewOutcome::Executed(outcome) => outcome.serialize(serializer),
        }
    }
}

// ─── Orchestrator ─────────────────────────────────────────────

pub struct TokenOrchestrator {
    sessions: Arc<dyn SessionProvider>,
    events: Arc<dyn EventSink>,
    validator: Arc<dyn Validator>,
    deserializer: Arc<dyn TokenDeserializer>,
    config: TokenConfig,
}

impl TokenOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        events: Arc<dyn EventSink>,
        config: TokenConfig,
    ) -> Self {
        Self {
            sessions,
            events,
            validator: Arc::new(TokenValidator::new(config.max_id_len)),
            deserializer: Arc::new(JsonTokenDeserializer),
            config,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn TokenDeserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn document<'s>(&'s self, scope: &'s CallScope<'_>) -> &'s str {
        scope.document.unwrap_or(self.config.document_name.as_str())
    }

    fn validate(&self, token: &Token) -> Result<(), TokenError> {
        let violations = self.validator.validate(token);
        if violations.is_empty() {
            Ok(())
        } else {
            debug!(token = %token.id(), ?violations, "token failed validation");
            Err(TokenError::Validation(violations))
        }
    }

    fn event(&self, lifecycle: Lifecycle, token: &Token, scope: &CallScope<'_>) -> TokenEvent {
        TokenEvent::new(
            lifecycle,
            event_name(lifecycle, token, &self.config.event_names),
            token.clone(),
            scope.context.clone(),
        )
    }

    async fn emit(
        &self,
        lifecycle: Lifecycle,
        token: &Token,
        scope: &CallScope<'_>,
    ) -> Result<(), TokenError> {
        let event = self.event(lifecycle, token, scope);
        debug!(token = %token.id(), event = %event.name, "dispatching token event");
        self.events.dispatch(event).await?;
        Ok(())
    }

    async fn save(
        &self,
        session: &dyn StorageSession,
        document: &str,
        token: &mut Token,
    ) -> Result<(), TokenError> {
        session.persist(document, token).await?;
        session.flush().await?;
        Ok(())
    }

    // ── create ──

    /// Build, validate and persist a new token.
    ///
    /// An id that is already taken is reported as a validation failure. A
    /// failed `create` event is logged and does not fail the call.
    pub async fn create_token(
        &self,
        draft: TokenDraft,
        payload: Option<TokenPayload>,
        scope: &CallScope<'_>,
    ) -> Result<Token, TokenError> {
        let id = draft.id.clone().unwrap_or_else(generate_token_id);
        let mut token = draft.into_token(id, self.config.default_kind);
        if let Some(payload) = payload {
            token.set_payload(payload);
        }
        self.validate(&token)?;

        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let result = self
            .save(guard.session(), self.document(scope), &mut token)
            .await;
        guard.release().await;
        // A fresh token conflicts only with a stored token of the same id
        result.map_err(|e| match e {
            TokenError::Storage(StorageError::Conflict { id, .. }) => {
                TokenError::Validation(vec![format!("token id {id} is already in use")])
            }
            e => e,
        })?;

        info!(token = %token.id(), kind = %token.kind(), "token created");
        if let Err(e) = self.emit(Lifecycle::Create, &token, scope).await {
            warn!(token = %token.id(), error = %e, "create event dispatch failed");
        }
        Ok(token)
    }

    // ── get ──

    pub async fn get_token(
        &self,
        id: &TokenId,
        scope: &CallScope<'_>,
    ) -> Result<Option<Token>, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let result = guard.session().find_by_id(self.document(scope), id).await;
        guard.release().await;

        let found = result?;
        if found.is_none() {
            debug!(token = %id, "token not found");
        }
        Ok(found)
    }

    // ── update ──

    /// Merge `data` onto a token, re-validate and persist.
    ///
    /// An `Entity` target skips the fetch. Nothing is persisted when the merge
    /// or validation fails.
    pub async fn update_token(
        &self,
        target: TokenTarget,
        data: &Value,
        scope: &CallScope<'_>,
    ) -> Result<Option<Token>, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let result = self
            .update_in(guard.session(), self.document(scope), target, data, scope)
            .await;
        guard.release().await;
        result
    }

    async fn update_in(
        &self,
        session: &dyn StorageSession,
        document: &str,
        target: TokenTarget,
        data: &Value,
        scope: &CallScope<'_>,
    ) -> Result<Option<Token>, TokenError> {
        let mut token = match target {
            TokenTarget::Entity(token) => token,
            TokenTarget::Id(id) => match session.find_by_id(document, &id).await? {
                Some(token) => token,
                None => {
                    debug!(token = %id, "update target not found");
                    return Ok(None);
                }
            },
        };

        self.deserializer.deserialize(&mut token, data)?;
        self.validate(&token)?;
        self.save(session, document, &mut token).await?;

        info!(token = %token.id(), version = token.version(), "token updated");
        self.emit(Lifecycle::Update, &token, scope).await?;
        Ok(Some(token))
    }

    // ── remove ──

    pub async fn remove_token(
        &self,
        id: &TokenId,
        scope: &CallScope<'_>,
    ) -> Result<Option<Token>, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let result = self
            .remove_in(guard.session(), self.document(scope), id, scope)
            .await;
        guard.release().await;
        result
    }

    async fn remove_in(
        &self,
        session: &dyn StorageSession,
        document: &str,
        id: &TokenId,
        scope: &CallScope<'_>,
    ) -> Result<Option<Token>, TokenError> {
        let Some(token) = session.find_by_id(document, id).await? else {
            debug!(token = %id, "remove target not found");
            return Ok(None);
        };
        session.remove(document, &token).await?;
        session.flush().await?;

        info!(token = %id, "token removed");
        self.emit(Lifecycle::Remove, &token, scope).await?;
        Ok(Some(token))
    }

    // ── composite chain ──

    /// The unexecuted member with the earliest `created_at`, ties broken by
    /// `executed_at` then by member-list order. `None` once every member ran.
    pub async fn find_next_token_from_composite(
        &self,
        composite: &Token,
        scope: &CallScope<'_>,
    ) -> Result<Option<TokenId>, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let result = next_member(guard.session(), self.document(scope), composite, None).await;
        guard.release().await;
        Ok(result?)
    }

    /// Best-effort lookup of the member that follows `member` in its owning
    /// composite. Any failure is logged and treated as "chain finished".
    async fn next_after_member(
        &self,
        session: &dyn StorageSession,
        document: &str,
        member: &Token,
    ) -> Option<TokenId> {
        let parent_id = member.from_composite()?;
        match session.find_by_id(document, parent_id).await {
            Ok(Some(parent)) => {
                match next_member(session, document, &parent, Some(member.id())).await {
                    Ok(next) => next,
                    Err(e) => {
                        warn!(token = %member.id(), composite = %parent_id, error = %e,
                            "composite resume lookup failed");
                        None
                    }
                }
            }
            Ok(None) => {
                debug!(token = %member.id(), composite = %parent_id, "owning composite is gone");
                None
            }
            Err(e) => {
                warn!(token = %member.id(), composite = %parent_id, error = %e,
                    "owning composite lookup failed");
                None
            }
        }
    }

    // ── execute ──

    /// Execute a token, or advance a composite to its next member.
    pub async fn execute_token(
        &self,
        id: &TokenId,
        scope: &CallScope<'_>,
    ) -> Result<ExecutionOutcome, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let session = guard.session();
        let document = self.document(scope);
        let result = match session.find_by_id(document, id).await {
            Ok(Some(token)) => self.execute_in(session, document, token, scope).await,
            Ok(None) => {
                debug!(token = %id, "execute target not found");
                Ok(ExecutionOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        };
        guard.release().await;
        result
    }

    async fn execute_in(
        &self,
        session: &dyn StorageSession,
        document: &str,
        mut token: Token,
        scope: &CallScope<'_>,
    ) -> Result<ExecutionOutcome, TokenError> {
        if token.is_expired() {
            return Err(TokenError::Expired(token.id().clone()));
        }

        if token.is_composite() {
            return Ok(match next_member(session, document, &token, None).await? {
                Some(next_id) => {
                    debug!(composite = %token.id(), next = %next_id, "composite advances");
                    ExecutionOutcome::Next { next_id, token }
                }
                None => ExecutionOutcome::Executed { token },
            });
        }

        let at = Utc::now();
        token.execute(at)?;
        match session.claim_execution(document, token.id(), at).await? {
            ClaimOutcome::Claimed { version } => token.restore_version(version, at),
            ClaimOutcome::AlreadyClaimed => {
                return Err(TokenError::AlreadyExecuted(token.id().clone()));
            }
            ClaimOutcome::Missing => {
                debug!(token = %token.id(), "token removed before it could be claimed");
                return Ok(ExecutionOutcome::NotFound);
            }
        }

        if let Some(hooks) = scope.hooks {
            hooks
                .on_execute(&token, scope.context.as_ref())
                .await
                .map_err(TokenError::Hook)?;
        }
        self.save(session, document, &mut token).await?;

        info!(token = %token.id(), "token executed");
        self.emit(Lifecycle::Execute, &token, scope).await?;

        Ok(match self.next_after_member(session, document, &token).await {
            Some(next_id) => ExecutionOutcome::Next { next_id, token },
            None => ExecutionOutcome::Executed { token },
        })
    }

    // ── view ──

    /// Count one view of a viewable token. Tokens that are not viewable are
    /// executed instead.
    pub async fn view_token(
        &self,
        id: &TokenId,
        scope: &CallScope<'_>,
    ) -> Result<ViewOutcome, TokenError> {
        let guard = SessionGuard::ensure(scope.session, self.sessions.as_ref()).await?;
        let session = guard.session();
        let document = self.document(scope);
        let result = match session.find_by_id(document, id).await {
            Ok(Some(token)) if token.is_viewable() => {
                self.view_in(session, document, token, scope).await
            }
            Ok(Some(token)) => self
                .execute_in(session, document, token, scope)
                .await
                .map(|outcome| match outcome {
                    ExecutionOutcome::NotFound => ViewOutcome::NotFound,
                    outcome => ViewOutcome::Executed(outcome),
                }),
            Ok(None) => {
                debug!(token = %id, "view target not found");
                Ok(ViewOutcome::NotFound)
            }
            Err(e) => Err(e.into()),
        };
        guard.release().await;
        result
    }

    async fn view_in(
        &self,
        session: &dyn StorageSession,
        document: &str,
        mut token: Token,
        scope: &CallScope<'_>,
    ) -> Result<ViewOutcome, TokenError> {
        if token.is_expired() {
            return Err(TokenError::Expired(token.id().clone()));
        }

        let views = token.view(Utc::now())?;
        if let Some(hooks) = scope.hooks {
            hooks
                .on_view(&token, scope.context.as_ref())
                .await
                .map_err(TokenError::Hook)?;
        }
        self.save(session, document, &mut token).await?;

        info!(token = %token.id(), views, "token viewed");
        self.emit(Lifecycle::View, &token, scope).await?;
        Ok(ViewOutcome::Viewed { token })
    }
}

async fn next_member(
    session: &dyn StorageSession,
    document: &str,
    composite: &Token,
    exclude: Option<&TokenId>,
) -> Result<Option<TokenId>, StorageError> {
    let candidates: Vec<TokenId> = composite
        .members()
        .iter()
        .filter(|id| Some(*id) != exclude)
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    let query = TokenQuery::where_in(candidates)
        .unexecuted()
        .sort_by(SortSpec::asc(SortField::CreatedAt))
        .sort_by(SortSpec::asc(SortField::ExecutedAt))
        .limit(1);
    let rows = session.find_where_in(document, &query).await?;
    Ok(rows.into_iter().next().map(|token| token.id().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_target_from_json() {
        assert!(matches!(
            TokenTarget::try_from(&json!("abc")),
            Ok(TokenTarget::Id(id)) if id == "abc"
        ));
        assert!(matches!(
            TokenTarget::try_from(&json!({"token": "abc"})),
            Ok(TokenTarget::Id(id)) if id == "abc"
        ));
        assert!(matches!(
            TokenTarget::try_from(&json!(42)),
            Err(TokenError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenTarget::try_from(&json!({"name": "abc"})),
            Err(TokenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_outcome_json_shapes() {
        let token = Token::simple("a");
        assert_eq!(
            serde_json::to_value(ExecutionOutcome::NotFound).unwrap(),
            json!({"status": "not_found"})
        );
        assert_eq!(
            serde_json::to_value(ExecutionOutcome::Next {
                next_id: "b".into(),
                token: Token::composite("c", vec![]),
            })
            .unwrap(),
            json!({"status": "next", "nextId": "b", "token": "c"})
        );
        assert_eq!(
            serde_json::to_value(ExecutionOutcome::Executed {
                token: token.clone()
            })
            .unwrap(),
            json!({"status": "executed", "token": "a"})
        );
        assert_eq!(
            serde_json::to_value(ViewOutcome::Viewed { token }).unwrap(),
            json!({"status": "viewed", "token": "a"})
        );
        assert_eq!(
            serde_json::to_value(ViewOutcome::NotFound).unwrap(),
            json!({"status": "not_found"})
        );
    }

    #[tokio::test]
    async fn test_caller_session_is_used_and_left_open() {
        let store = MemoryStore::new();
        let orchestrator = TokenOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(crate::events::BroadcastEventSink::default()),
            TokenConfig::default(),
        );

        let session = store.session();
        let scope = CallScope::new().with_session(&session);
        let token = orchestrator
            .create_token(TokenDraft::default(), None, &scope)
            .await
            .unwrap();
        orchestrator.get_token(token.id(), &scope).await.unwrap();

        // Only the caller's session was ever opened, and it is still usable
        assert_eq!(store.sessions_opened(), 1);
        assert_eq!(store.open_sessions(), 1);
        assert!(session.find_by_id("tokens", token.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_document_override() {
        let store = MemoryStore::new();
        let orchestrator = TokenOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(crate::events::BroadcastEventSink::default()),
            TokenConfig::default(),
        );

        let scope = CallScope::new().in_document("invites");
        let token = orchestrator
            .create_token(TokenDraft::default(), None, &scope)
            .await
            .unwrap();

        assert_eq!(store.len("invites").await, 1);
        assert!(store.is_empty("tokens").await);
        assert!(orchestrator
            .get_token(token.id(), &CallScope::new())
            .await
            .unwrap()
            .is_none());
    }
}
