//! Action token lifecycle
//!
//! Single-use tokens that authorize a deferred action (confirm an email,
//! reset a password, walk a multi-step flow):
//!
//! - `Token` / `TokenVariant` - one entity record, three families
//!   (simple, viewable, composite) behind the `Executable`, `Viewable` and
//!   `Chainable` capability traits
//! - `TokenOrchestrator` - create, get, update, remove, execute and view over
//!   an injected storage session and event sink
//! - `MemoryStore` / `BroadcastEventSink` - in-process implementations of
//!   the storage and event ports

pub mod config;
pub mod deserialize;
pub mod error;
pub mod events;
pub mod id;
pub mod orchestrator;
pub mod store;
pub mod store_memory;
pub mod token;
pub mod types;
pub mod validate;

pub use config::{ConfigError, TokenConfig};
pub use deserialize::{JsonTokenDeserializer, TokenDeserializer};
pub use error::{ErrorClass, EventError, StorageError, TokenError};
pub use events::{BroadcastEventSink, EventSink, InboundContext, Lifecycle, TokenEvent};
pub use id::generate_token_id;
pub use orchestrator::{
    CallScope, ExecutionOutcome, TokenHooks, TokenOrchestrator, TokenTarget, ViewOutcome,
};
pub use store::{ClaimOutcome, SessionGuard, SessionProvider, StorageSession, TokenQuery};
pub use store_memory::{MemorySession, MemoryStore};
pub use token::{Chainable, Executable, MemberRef, Token, TokenDraft, TokenVariant, Viewable};
pub use types::{Timestamp, TokenId, TokenKind, TokenPayload};
pub use validate::{TokenValidator, Validator};
