//! Merging external input onto an existing token.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::TokenError;
use crate::token::{MemberRef, Token};
use crate::types::{Timestamp, TokenId, TokenPayload};

/// Merges raw external data onto a token in place.
pub trait TokenDeserializer: Send + Sync {
    fn deserialize(&self, token: &mut Token, data: &Value) -> Result<(), TokenError>;
}

/// JSON patch merge with snake_case keys.
///
/// Every key is checked before anything is applied, so a rejected patch
/// leaves the token untouched. Keys maintained by the lifecycle or by storage
/// (`id`, `executed_at`, `num_views`, ...) and unknown keys are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTokenDeserializer;

/// `None` = key absent, `Some(None)` = explicit null.
type Field<T> = Option<Option<T>>;

#[derive(Default)]
struct Patch {
    payload: Field<BTreeMap<String, Value>>,
    expires_at: Field<Timestamp>,
    from_composite: Field<TokenId>,
    type_name: Field<String>,
    required_input: Field<BTreeMap<String, Value>>,
    view_limit: Field<i64>,
    is_viewable: Option<bool>,
    tokens: Option<Vec<TokenId>>,
}

impl Patch {
    fn parse(data: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut patch = Patch::default();
        let mut violations = Vec::new();

        for (key, value) in data {
            match key.as_str() {
                "payload" => patch.payload = nullable(key, value, object, &mut violations),
                "expires_at" => patch.expires_at = nullable(key, value, timestamp, &mut violations),
                "from_composite" => {
                    patch.from_composite = nullable(key, value, token_id, &mut violations)
                }
                "type" => patch.type_name = nullable(key, value, string, &mut violations),
                "required_input" => {
                    patch.required_input = nullable(key, value, object, &mut violations)
                }
                "view_limit" => patch.view_limit = nullable(key, value, integer, &mut violations),
                "is_viewable" => match value.as_bool() {
                    Some(flag) => patch.is_viewable = Some(flag),
                    None => violations.push(format!("{key} must be a boolean")),
                },
                "tokens" => match members(value) {
                    Ok(ids) => patch.tokens = Some(ids),
                    Err(e) => violations.push(format!("{key} {e}")),
                },
                _ => {}
            }
        }

        if violations.is_empty() {
            Ok(patch)
        } else {
            Err(violations)
        }
    }

    fn apply(self, token: &mut Token) {
        if let Some(payload) = self.payload {
            token.set_payload(TokenPayload::from_map(payload.unwrap_or_default()));
        }
        if let Some(expires_at) = self.expires_at {
            token.set_expires_at(expires_at);
        }
        if let Some(from_composite) = self.from_composite {
            token.set_from_composite(from_composite);
        }
        if let Some(type_name) = self.type_name {
            token.set_type_name(type_name);
        }
        if let Some(required_input) = self.required_input {
            token.set_required_input(required_input.unwrap_or_default());
        }
        if let Some(view_limit) = self.view_limit {
            token.set_view_limit(view_limit);
        }
        if let Some(is_viewable) = self.is_viewable {
            token.set_viewable(is_viewable);
        }
        if let Some(tokens) = self.tokens {
            token.set_members(tokens);
        }
    }
}

impl TokenDeserializer for JsonTokenDeserializer {
    fn deserialize(&self, token: &mut Token, data: &Value) -> Result<(), TokenError> {
        let Value::Object(map) = data else {
            return Err(TokenError::Validation(vec![
                "token data must be a JSON object".to_string(),
            ]));
        };
        let patch = Patch::parse(map).map_err(TokenError::Validation)?;
        patch.apply(token);
        Ok(())
    }
}

fn nullable<T>(
    key: &str,
    value: &Value,
    parse: fn(&Value) -> Result<T, &'static str>,
    violations: &mut Vec<String>,
) -> Field<T> {
    if value.is_null() {
        return Some(None);
    }
    match parse(value) {
        Ok(parsed) => Some(Some(parsed)),
        Err(expected) => {
            violations.push(format!("{key} must be {expected}"));
            None
        }
    }
}

fn object(value: &Value) -> Result<BTreeMap<String, Value>, &'static str> {
    match value {
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        _ => Err("an object"),
    }
}

fn string(value: &Value) -> Result<String, &'static str> {
    value.as_str().map(str::to_string).ok_or("a string")
}

fn token_id(value: &Value) -> Result<TokenId, &'static str> {
    value.as_str().map(TokenId::from).ok_or("a token id string")
}

fn integer(value: &Value) -> Result<i64, &'static str> {
    value.as_i64().ok_or("an integer")
}

fn timestamp(value: &Value) -> Result<Timestamp, &'static str> {
    value
        .as_str()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
        .ok_or("an RFC 3339 timestamp")
}

fn members(value: &Value) -> Result<Vec<TokenId>, &'static str> {
    let Value::Array(items) = value else {
        return Err("must be an array of token ids");
    };
    items
        .iter()
        .map(|item| {
            MemberRef::from(item)
                .resolve_id()
                .map(TokenId::from)
                .ok_or("must only contain token ids or objects with an id")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Chainable, Viewable};
    use serde_json::json;

    #[test]
    fn test_merges_known_fields() {
        let mut token = Token::viewable("v1", Some(5));
        JsonTokenDeserializer
            .deserialize(
                &mut token,
                &json!({
                    "payload": {"foo": "bar"},
                    "expires_at": "2030-01-01T00:00:00Z",
                    "type": "password-reset",
                    "view_limit": 10,
                    "is_viewable": false,
                }),
            )
            .unwrap();

        assert_eq!(token.payload().get("foo"), Some(&json!("bar")));
        assert!(token.is_expires());
        assert_eq!(token.type_name(), Some("password-reset"));
        assert_eq!(token.view_state().unwrap().view_limit, Some(10));
        assert!(!token.is_viewable());
    }

    #[test]
    fn test_null_clears_optional_fields() {
        let mut token = Token::simple("t1")
            .with_parent("c1")
            .with_type_name("invite");
        JsonTokenDeserializer
            .deserialize(&mut token, &json!({"from_composite": null, "type": null}))
            .unwrap();
        assert!(token.from_composite().is_none());
        assert!(token.type_name().is_none());
    }

    #[test]
    fn test_wrong_shapes_are_all_reported_and_nothing_applies() {
        let mut token = Token::simple("t1");
        let err = JsonTokenDeserializer
            .deserialize(
                &mut token,
                &json!({
                    "payload": {"foo": "bar"},
                    "expires_at": "next tuesday",
                    "view_limit": "three",
                    "tokens": [1, 2],
                }),
            )
            .unwrap_err();

        let TokenError::Validation(violations) = err else {
            panic!("expected validation error");
        };
        assert_eq!(violations.len(), 3);
        assert!(token.payload().is_empty());
    }

    #[test]
    fn test_protected_and_unknown_keys_are_ignored() {
        let mut token = Token::simple("t1");
        JsonTokenDeserializer
            .deserialize(
                &mut token,
                &json!({
                    "id": "hijack",
                    "executed_at": "2030-01-01T00:00:00Z",
                    "num_views": 99,
                    "colour": "blue",
                }),
            )
            .unwrap();
        assert_eq!(token.id().as_str(), "t1");
        assert!(token.executed_at().is_none());
    }

    #[test]
    fn test_tokens_accepts_ids_and_objects() {
        let mut token = Token::composite("c1", vec![]);
        JsonTokenDeserializer
            .deserialize(&mut token, &json!({"tokens": ["a", {"id": "b"}, "a"]}))
            .unwrap();
        assert_eq!(token.members(), &[TokenId::from("a"), TokenId::from("b")]);
    }

    #[test]
    fn test_non_object_data_is_rejected() {
        let mut token = Token::simple("t1");
        assert!(matches!(
            JsonTokenDeserializer.deserialize(&mut token, &json!("nope")),
            Err(TokenError::Validation(_))
        ));
    }
}
