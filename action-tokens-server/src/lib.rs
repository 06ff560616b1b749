//! HTTP controller for action tokens.

pub mod error;
pub mod handlers;
pub mod listener;
pub mod router;

use std::sync::Arc;

use action_tokens_core::{TokenConfig, TokenOrchestrator};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TokenOrchestrator>,
    pub config: Arc<TokenConfig>,
}

impl AppState {
    pub fn new(orchestrator: Arc<TokenOrchestrator>) -> Self {
        let config = Arc::new(orchestrator.config().clone());
        Self {
            orchestrator,
            config,
        }
    }
}
