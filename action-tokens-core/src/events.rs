//! Token lifecycle events
//!
//! The orchestrator publishes a typed [`TokenEvent`] to an injected
//! [`EventSink`] after each committed transition. Subscribers belong to the
//! surrounding system; the core never looks them up.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventError;
use crate::token::Token;
use crate::types::Timestamp;

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-\s]+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Create,
    Update,
    Remove,
    Execute,
    View,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Execute => "execute",
            Self::View => "view",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full event name: the lifecycle name, suffixed with a per-type discriminator
/// when the token declares a type.
///
/// A configured mapping wins. Otherwise a non-numeric type is used with runs of
/// `-` and whitespace collapsed to `_`. Numeric types without a mapping add no suffix.
pub fn event_name(
    lifecycle: Lifecycle,
    token: &Token,
    discriminators: &BTreeMap<String, String>,
) -> String {
    let base = lifecycle.as_str();
    let Some(type_name) = token.type_name() else {
        return base.to_string();
    };
    if let Some(mapped) = discriminators.get(type_name) {
        return format!("{base}.{mapped}");
    }
    if is_numeric_type(type_name) {
        return base.to_string();
    }
    format!("{base}.{}", SEPARATOR_RE.replace_all(type_name, "_"))
}

/// True when the type reads as a number: decimal or `0x`/`0o`/`0b` literals,
/// a spelled-out `Infinity`, or blank. `NaN`, `inf` and friends are not numbers.
fn is_numeric_type(type_name: &str) -> bool {
    let trimmed = type_name.trim();
    if trimmed.is_empty() {
        return true;
    }
    let unsigned = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
    if unsigned == "Infinity" {
        return true;
    }
    let radix = match trimmed.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return u128::from_str_radix(&trimmed[2..], radix).is_ok();
    }
    trimmed.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Opaque context of the call that triggered an event (e.g. an inbound request).
///
/// Passed through to listeners untouched.
#[derive(Clone)]
pub struct InboundContext(Arc<dyn Any + Send + Sync>);

impl InboundContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for InboundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InboundContext(..)")
    }
}

/// A lifecycle event. `token` serializes as its id.
#[derive(Debug, Clone, Serialize)]
pub struct TokenEvent {
    pub event_id: Uuid,
    pub name: String,
    pub lifecycle: Lifecycle,
    pub token: Token,
    #[serde(skip)]
    pub context: Option<InboundContext>,
    pub occurred_at: Timestamp,
}

impl TokenEvent {
    pub fn new(
        lifecycle: Lifecycle,
        name: String,
        token: Token,
        context: Option<InboundContext>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            name,
            lifecycle,
            token,
            context,
            occurred_at: Utc::now(),
        }
    }
}

/// Where lifecycle events go.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: TokenEvent) -> Result<(), EventError>;
}

/// In-process sink based on a tokio broadcast channel.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TokenEvent>,
    capacity: usize,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn dispatch(&self, event: TokenEvent) -> Result<(), EventError> {
        // No receivers is not an error; storage remains the source of truth.
        match self.tx.send(event) {
            Ok(_) => Ok(()),
            Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }
}
