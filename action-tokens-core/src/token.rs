//! Token Entities
//!
//! One `Token` record covers every entity family. The family lives in
//! [`TokenVariant`]; behavior is reached through three small capability traits:
//!
//! - [`Executable`]: the one-way `unexecuted -> executed` transition
//! - [`Viewable`]: the bounded view gate
//! - [`Chainable`]: the ordered member list of a composite token
//!
//! Tokens hold no closures. Per-call side effects live in
//! [`crate::orchestrator::TokenHooks`].

use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::TokenError;
use crate::types::{Timestamp, TokenId, TokenKind, TokenPayload};

// ─── Capability traits ────────────────────────────────────────

/// The one-way execution transition.
pub trait Executable {
    fn is_executed(&self) -> bool;

    /// Mark the token executed at `at`.
    ///
    /// Fails with [`TokenError::AlreadyExecuted`] if it already was; the
    /// original timestamp is kept.
    fn execute(&mut self, at: Timestamp) -> Result<(), TokenError>;
}

/// The bounded view gate.
pub trait Viewable {
    fn is_viewable(&self) -> bool;

    /// Record one view at `at` and return the new view count.
    fn view(&mut self, at: Timestamp) -> Result<u32, TokenError>;
}

/// Ordered membership of a composite token.
pub trait Chainable {
    fn members(&self) -> &[TokenId];

    /// Append a member. Returns false if it was already present.
    fn add_token(&mut self, member: MemberRef<'_>) -> Result<bool, TokenError>;

    /// Remove a member. Unknown members and unrecognized shapes are a no-op.
    fn remove_token(&mut self, member: MemberRef<'_>) -> bool;

    fn has_token(&self, member: MemberRef<'_>) -> bool;

    /// The member that follows `member` in list order, if any.
    fn next_token(&self, member: MemberRef<'_>) -> Option<&TokenId>;
}

// ─── Member references ────────────────────────────────────────

/// The argument shapes accepted by [`Chainable`] operations.
#[derive(Clone, Copy, Debug)]
pub enum MemberRef<'a> {
    Token(&'a Token),
    Id(&'a str),
    Json(&'a Value),
}

impl<'a> MemberRef<'a> {
    /// Resolve the member id, or `None` when the shape carries no id.
    pub fn resolve_id(&self) -> Option<&'a str> {
        match *self {
            MemberRef::Token(token) => Some(token.id.as_str()),
            MemberRef::Id(id) => Some(id),
            MemberRef::Json(Value::String(id)) => Some(id.as_str()),
            MemberRef::Json(Value::Object(map)) => map
                .get("id")
                .or_else(|| map.get("token"))
                .and_then(Value::as_str),
            MemberRef::Json(_) => None,
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            MemberRef::Token(_) => "token",
            MemberRef::Id(_) => "id string",
            MemberRef::Json(Value::Object(_)) => "object",
            MemberRef::Json(_) => "json value",
        }
    }
}

impl<'a> From<&'a Token> for MemberRef<'a> {
    fn from(token: &'a Token) -> Self {
        MemberRef::Token(token)
    }
}

impl<'a> From<&'a str> for MemberRef<'a> {
    fn from(id: &'a str) -> Self {
        MemberRef::Id(id)
    }
}

impl<'a> From<&'a TokenId> for MemberRef<'a> {
    fn from(id: &'a TokenId) -> Self {
        MemberRef::Id(id.as_str())
    }
}

impl<'a> From<&'a Value> for MemberRef<'a> {
    fn from(value: &'a Value) -> Self {
        MemberRef::Json(value)
    }
}

// ─── Variant state ────────────────────────────────────────────

/// View gate state shared by viewable and composite tokens.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewState {
    pub is_viewable: bool,
    /// `None`, zero or negative means unlimited.
    pub view_limit: Option<i64>,
    pub num_views: u32,
    /// One entry per successful view.
    pub viewed_at: Vec<Timestamp>,
}

impl ViewState {
    pub fn new(is_viewable: bool, view_limit: Option<i64>) -> Self {
        Self {
            is_viewable,
            view_limit,
            num_views: 0,
            viewed_at: Vec::new(),
        }
    }

    /// The configured limit when it is a positive bound.
    pub fn bound(&self) -> Option<i64> {
        self.view_limit.filter(|limit| *limit > 0)
    }
}

/// Member list of a composite token. Holds ids only; members are independent
/// entities and are never owned or cascade-deleted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeState {
    pub view: ViewState,
    tokens: Vec<TokenId>,
}

impl CompositeState {
    pub fn new(members: impl IntoIterator<Item = TokenId>) -> Self {
        let mut state = Self {
            view: ViewState::new(false, None),
            tokens: Vec::new(),
        };
        state.replace_members(members);
        state
    }

    /// Replace the member list, dropping duplicates but keeping first-seen order.
    pub fn replace_members(&mut self, members: impl IntoIterator<Item = TokenId>) {
        self.tokens.clear();
        for id in members {
            if !self.tokens.contains(&id) {
                self.tokens.push(id);
            }
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tokens.iter().position(|t| t.as_str() == id)
    }
}

/// Entity family plus its family-specific state.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenVariant {
    Simple,
    Viewable(ViewState),
    Composite(CompositeState),
}

impl TokenVariant {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenVariant::Simple => TokenKind::Simple,
            TokenVariant::Viewable(_) => TokenKind::Viewable,
            TokenVariant::Composite(_) => TokenKind::Composite,
        }
    }
}

// ─── Token ────────────────────────────────────────────────────

/// An action token.
///
/// Fields are private; they change only through the operations below so that
/// `executed_at` is set exactly once and `num_views` only grows.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    id: TokenId,
    type_name: Option<String>,
    payload: TokenPayload,
    required_input: BTreeMap<String, Value>,
    from_composite: Option<TokenId>,
    expires_at: Option<Timestamp>,
    executed_at: Option<Timestamp>,
    created_at: Option<Timestamp>,
    updated_at: Option<Timestamp>,
    version: u64,
    variant: TokenVariant,
}

impl Token {
    fn with_variant(id: TokenId, variant: TokenVariant) -> Self {
        Self {
            id,
            type_name: None,
            payload: TokenPayload::new(),
            required_input: BTreeMap::new(),
            from_composite: None,
            expires_at: None,
            executed_at: None,
            created_at: None,
            updated_at: None,
            version: 0,
            variant,
        }
    }

    pub fn simple(id: impl Into<TokenId>) -> Self {
        Self::with_variant(id.into(), TokenVariant::Simple)
    }

    pub fn viewable(id: impl Into<TokenId>, view_limit: Option<i64>) -> Self {
        Self::with_variant(
            id.into(),
            TokenVariant::Viewable(ViewState::new(true, view_limit)),
        )
    }

    pub fn composite(id: impl Into<TokenId>, members: impl IntoIterator<Item = TokenId>) -> Self {
        Self::with_variant(
            id.into(),
            TokenVariant::Composite(CompositeState::new(members)),
        )
    }

    pub fn with_payload(mut self, payload: TokenPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_parent(mut self, composite: impl Into<TokenId>) -> Self {
        self.from_composite = Some(composite.into());
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    // ── Accessors ──

    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn kind(&self) -> TokenKind {
        self.variant.kind()
    }

    pub fn variant(&self) -> &TokenVariant {
        &self.variant
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn payload(&self) -> &TokenPayload {
        &self.payload
    }

    pub fn required_input(&self) -> &BTreeMap<String, Value> {
        &self.required_input
    }

    pub fn from_composite(&self) -> Option<&TokenId> {
        self.from_composite.as_ref()
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    pub fn executed_at(&self) -> Option<Timestamp> {
        self.executed_at
    }

    pub fn created_at(&self) -> Option<Timestamp> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<Timestamp> {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.variant, TokenVariant::Composite(_))
    }

    pub fn view_state(&self) -> Option<&ViewState> {
        match &self.variant {
            TokenVariant::Simple => None,
            TokenVariant::Viewable(view) => Some(view),
            TokenVariant::Composite(composite) => Some(&composite.view),
        }
    }

    fn view_state_mut(&mut self) -> Option<&mut ViewState> {
        match &mut self.variant {
            TokenVariant::Simple => None,
            TokenVariant::Viewable(view) => Some(view),
            TokenVariant::Composite(composite) => Some(&mut composite.view),
        }
    }

    pub fn num_views(&self) -> u32 {
        self.view_state().map_or(0, |v| v.num_views)
    }

    // ── Mutators ──

    /// Replace the payload data. The only way a payload changes.
    pub fn set_payload(&mut self, payload: TokenPayload) {
        self.payload = payload;
    }

    pub fn set_type_name(&mut self, type_name: Option<String>) {
        self.type_name = type_name;
    }

    pub fn set_required_input(&mut self, required_input: BTreeMap<String, Value>) {
        self.required_input = required_input;
    }

    pub fn set_from_composite(&mut self, composite: Option<TokenId>) {
        self.from_composite = composite;
    }

    pub fn set_expires_at(&mut self, expires_at: Option<Timestamp>) {
        self.expires_at = expires_at;
    }

    /// Change the view limit. Ignored for simple tokens.
    pub fn set_view_limit(&mut self, view_limit: Option<i64>) -> bool {
        match self.view_state_mut() {
            Some(view) => {
                view.view_limit = view_limit;
                true
            }
            None => false,
        }
    }

    /// Toggle the viewable flag. Ignored for simple tokens.
    pub fn set_viewable(&mut self, is_viewable: bool) -> bool {
        match self.view_state_mut() {
            Some(view) => {
                view.is_viewable = is_viewable;
                true
            }
            None => false,
        }
    }

    /// Replace a composite's member list. Ignored for other kinds.
    pub fn set_members(&mut self, members: impl IntoIterator<Item = TokenId>) -> bool {
        match &mut self.variant {
            TokenVariant::Composite(composite) => {
                composite.replace_members(members);
                true
            }
            _ => false,
        }
    }

    /// Storage-layer bookkeeping, called by backends on each persist.
    pub fn stamp_persisted(&mut self, at: Timestamp) {
        if self.created_at.is_none() {
            self.created_at = Some(at);
        }
        self.updated_at = Some(at);
        self.version += 1;
    }

    /// Storage-layer write of a conditionally claimed execution marker.
    pub fn restore_executed_at(&mut self, at: Timestamp) {
        if self.executed_at.is_none() {
            self.executed_at = Some(at);
        }
    }

    /// Adopt the version storage assigned to this token outside a persist.
    pub fn restore_version(&mut self, version: u64, at: Timestamp) {
        self.version = version;
        self.updated_at = Some(at);
    }

    // ── Expiry ──

    pub fn is_expires(&self) -> bool {
        self.expires_at.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl Executable for Token {
    fn is_executed(&self) -> bool {
        self.executed_at.is_some()
    }

    fn execute(&mut self, at: Timestamp) -> Result<(), TokenError> {
        if self.is_composite() {
            return Err(TokenError::InvalidArgument(format!(
                "composite token {} executes through its members",
                self.id
            )));
        }
        if self.is_executed() {
            return Err(TokenError::AlreadyExecuted(self.id.clone()));
        }
        self.executed_at = Some(at);
        Ok(())
    }
}

impl Viewable for Token {
    fn is_viewable(&self) -> bool {
        self.view_state().is_some_and(|v| v.is_viewable)
    }

    fn view(&mut self, at: Timestamp) -> Result<u32, TokenError> {
        let id = self.id.clone();
        let Some(view) = self.view_state_mut() else {
            return Err(TokenError::InvalidArgument(format!(
                "token {id} is not a viewable token"
            )));
        };

        // Increment-then-compare: with limit L, views 1..L-1 pass and view L fails.
        let Some(candidate) = view.num_views.checked_add(1) else {
            return Err(TokenError::ViewLimitExceeded {
                id,
                limit: i64::from(u32::MAX),
            });
        };
        if let Some(limit) = view.bound() {
            if i64::from(candidate) >= limit {
                return Err(TokenError::ViewLimitExceeded { id, limit });
            }
        }

        view.num_views = candidate;
        view.viewed_at.push(at);
        Ok(candidate)
    }
}

impl Chainable for Token {
    fn members(&self) -> &[TokenId] {
        match &self.variant {
            TokenVariant::Composite(composite) => &composite.tokens,
            _ => &[],
        }
    }

    fn add_token(&mut self, member: MemberRef<'_>) -> Result<bool, TokenError> {
        let MemberRef::Token(token) = member else {
            return Err(TokenError::InvalidArgument(format!(
                "token expected, {} given",
                member.shape()
            )));
        };
        if token.id == self.id {
            return Err(TokenError::InvalidArgument(format!(
                "composite token {} cannot contain itself",
                self.id
            )));
        }
        let self_id = self.id.clone();
        let TokenVariant::Composite(composite) = &mut self.variant else {
            return Err(TokenError::InvalidArgument(format!(
                "token {self_id} is not a composite token"
            )));
        };
        if composite.position(token.id.as_str()).is_some() {
            return Ok(false);
        }
        composite.tokens.push(token.id.clone());
        Ok(true)
    }

    fn remove_token(&mut self, member: MemberRef<'_>) -> bool {
        let Some(id) = member.resolve_id() else {
            return false;
        };
        let TokenVariant::Composite(composite) = &mut self.variant else {
            return false;
        };
        match composite.position(id) {
            Some(idx) => {
                composite.tokens.remove(idx);
                true
            }
            None => false,
        }
    }

    fn has_token(&self, member: MemberRef<'_>) -> bool {
        let Some(id) = member.resolve_id() else {
            return false;
        };
        self.members().iter().any(|t| t.as_str() == id)
    }

    fn next_token(&self, member: MemberRef<'_>) -> Option<&TokenId> {
        let id = member.resolve_id()?;
        let members = self.members();
        let idx = members.iter().position(|t| t.as_str() == id)?;
        members.get(idx + 1)
    }
}

/// A token's external identity is its id; serializing yields just that string.
impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

// ─── Draft ────────────────────────────────────────────────────

/// Creation data for a new token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenDraft {
    /// Generated when absent.
    pub id: Option<TokenId>,
    /// Falls back to the configured default kind.
    pub kind: Option<TokenKind>,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub from_composite: Option<TokenId>,
    pub expires_at: Option<Timestamp>,
    pub view_limit: Option<i64>,
    pub is_viewable: Option<bool>,
    pub tokens: Vec<TokenId>,
    pub required_input: BTreeMap<String, Value>,
}

impl TokenDraft {
    pub fn of_kind(kind: TokenKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Build the entity. Fields that do not apply to the resolved kind are dropped.
    pub fn into_token(self, id: TokenId, default_kind: TokenKind) -> Token {
        let kind = self.kind.unwrap_or(default_kind);
        let mut token = match kind {
            TokenKind::Simple => Token::simple(id),
            TokenKind::Viewable => Token::viewable(id, self.view_limit),
            TokenKind::Composite => {
                let mut token = Token::composite(id, self.tokens);
                token.set_view_limit(self.view_limit);
                token
            }
        };
        if let Some(is_viewable) = self.is_viewable {
            token.set_viewable(is_viewable);
        }
        token.type_name = self.type_name;
        token.from_composite = self.from_composite;
        token.expires_at = self.expires_at;
        token.required_input = self.required_input;
        token
    }
}
