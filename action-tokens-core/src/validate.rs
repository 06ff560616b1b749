use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::token::{Chainable, Token};

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]+$").unwrap());

/// Checks a token before it is persisted.
pub trait Validator: Send + Sync {
    /// All violations found; empty means valid.
    fn validate(&self, token: &Token) -> Vec<String>;
}

/// Structural rules every token must satisfy.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    pub max_id_len: usize,
}

impl Default for TokenValidator {
    fn default() -> Self {
        Self { max_id_len: 128 }
    }
}

impl TokenValidator {
    pub fn new(max_id_len: usize) -> Self {
        Self { max_id_len }
    }

    fn check_id(&self, token: &Token, violations: &mut Vec<String>) {
        let id = token.id().as_str();
        if id.is_empty() {
            violations.push("id must not be empty".to_string());
            return;
        }
        if id.len() > self.max_id_len {
            violations.push(format!(
                "id is {} characters long, at most {} allowed",
                id.len(),
                self.max_id_len
            ));
        }
        if !ID_RE.is_match(id) {
            violations.push(format!("id '{id}' contains characters outside [A-Za-z0-9_.:-]"));
        }
    }

    fn check_members(&self, token: &Token, violations: &mut Vec<String>) {
        if token.from_composite() == Some(token.id()) {
            violations.push(format!("token {} cannot belong to itself", token.id()));
        }

        let mut seen = HashSet::new();
        for member in token.members() {
            if member == token.id() {
                violations.push(format!("composite {} lists itself as a member", token.id()));
            }
            if !seen.insert(member) {
                violations.push(format!("member {member} is listed more than once"));
            }
        }
    }

    fn check_views(&self, token: &Token, violations: &mut Vec<String>) {
        let Some(view) = token.view_state() else {
            return;
        };
        if let Some(limit) = view.bound() {
            if i64::from(view.num_views) >= limit {
                violations.push(format!(
                    "num_views {} is outside the view limit of {limit}",
                    view.num_views
                ));
            }
        }
        if view.viewed_at.len() != view.num_views as usize {
            violations.push(format!(
                "viewed_at has {} entries but num_views is {}",
                view.viewed_at.len(),
                view.num_views
            ));
        }
    }
}

impl Validator for TokenValidator {
    fn validate(&self, token: &Token) -> Vec<String> {
        let mut violations = Vec::new();
        self.check_id(token, &mut violations);
        self.check_members(token, &mut violations);
        self.check_views(token, &mut violations);
        violations
    }
}
