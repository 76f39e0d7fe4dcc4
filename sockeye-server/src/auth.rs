//! Identity resolution for `authenticate` frames.
//!
//! The relay does not know how tokens are issued. It hands the opaque token
//! to an [`Authenticator`] and only interprets the answer: a non-empty
//! identifier is a success, anything else is a rejection.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::Identifier;

// Authenticator faults are caught with `catch_unwind`; under `panic = "abort"`
// one bad token would take the whole relay down.
#[cfg(panic = "abort")]
compile_error!("sockeye-server must be built with panic = \"unwind\"");

/// Maps an opaque token to the identifier it authenticates, if any.
///
/// Implemented for any `Fn(&Value) -> Option<String>`, so a closure can be
/// passed straight to the server.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &Value) -> Option<Identifier>;
}

impl<F> Authenticator for F
where
    F: Fn(&Value) -> Option<Identifier> + Send + Sync,
{
    fn authenticate(&self, token: &Value) -> Option<Identifier> {
        self(token)
    }
}

/// Rejects every token. Used when no authentication method is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn authenticate(&self, _token: &Value) -> Option<Identifier> {
        None
    }
}

/// Fixed token → identifier table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identifier>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, identifier: impl Into<Identifier>) {
        self.tokens.insert(token.into(), identifier.into());
    }

    /// Parse a `TOKEN=IDENTIFIER` pair.
    pub fn parse_pair(pair: &str) -> Option<(String, Identifier)> {
        let (token, identifier) = pair.split_once('=')?;
        if token.is_empty() || identifier.is_empty() {
            return None;
        }
        Some((token.to_string(), identifier.to_string()))
    }

    /// Load from a JSON object of `{"token": "identifier", ...}`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let tokens: HashMap<String, Identifier> = serde_json::from_str(text)?;
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &Value) -> Option<Identifier> {
        self.tokens.get(token.as_str()?).cloned()
    }
}

impl<S: Into<String>, I: Into<Identifier>> FromIterator<(S, I)> for StaticTokens {
    fn from_iter<T: IntoIterator<Item = (S, I)>>(iter: T) -> Self {
        Self {
            tokens: iter
                .into_iter()
                .map(|(token, identifier)| (token.into(), identifier.into()))
                .collect(),
        }
    }
}

/// Why a token did not produce an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("token rejected")]
    Denied,
    #[error("authenticator returned an empty identifier")]
    Empty,
    #[error("authenticator panicked")]
    Faulted,
}

/// Stateless wrapper around the configured [`Authenticator`].
#[derive(Clone)]
pub struct IdentityResolver {
    method: Arc<dyn Authenticator>,
}

impl IdentityResolver {
    pub fn new(method: Arc<dyn Authenticator>) -> Self {
        Self { method }
    }

    /// Resolve a token. A panicking authenticator counts as a rejection.
    pub fn resolve(&self, token: &Value) -> Result<Identifier, Rejection> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.method.authenticate(token)));
        match outcome {
            Ok(Some(identifier)) if !identifier.is_empty() => Ok(identifier),
            Ok(Some(_)) => Err(Rejection::Empty),
            Ok(None) => Err(Rejection::Denied),
            Err(_) => {
                log::error!("Authentication method panicked; treating token as rejected");
                Err(Rejection::Faulted)
            }
        }
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(Arc::new(DenyAll))
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver<A: Authenticator + 'static>(method: A) -> IdentityResolver {
        IdentityResolver::new(Arc::new(method))
    }

    #[test]
    fn test_closure_authenticator() {
        let r = resolver(|token: &Value| {
            (token.as_str() == Some("tok1")).then(|| "user-42".to_string())
        });
        assert_eq!(r.resolve(&json!("tok1")), Ok("user-42".to_string()));
        assert_eq!(r.resolve(&json!("bad")), Err(Rejection::Denied));
    }

    #[test]
    fn test_empty_identifier_is_rejection() {
        let r = resolver(|_: &Value| Some(String::new()));
        assert_eq!(r.resolve(&json!("anything")), Err(Rejection::Empty));
    }

    #[test]
    fn test_panicking_authenticator_is_rejection() {
        let r = resolver(|_: &Value| -> Option<Identifier> { panic!("backend unavailable") });
        assert_eq!(r.resolve(&json!("tok")), Err(Rejection::Faulted));
    }

    #[test]
    fn test_resolver_usable_after_fault() {
        let r = resolver(|token: &Value| match token.as_str() {
            Some("boom") => panic!("backend unavailable"),
            Some(t) => Some(format!("user-{t}")),
            None => None,
        });
        assert_eq!(r.resolve(&json!("boom")), Err(Rejection::Faulted));
        assert_eq!(r.resolve(&json!("1")), Ok("user-1".to_string()));
    }

    #[test]
    fn test_default_denies_everything() {
        let r = IdentityResolver::default();
        assert_eq!(r.resolve(&json!("tok1")), Err(Rejection::Denied));
        assert_eq!(r.resolve(&Value::Null), Err(Rejection::Denied));
    }

    #[test]
    fn test_static_tokens() {
        let tokens: StaticTokens = [("tok1", "user-42"), ("tok2", "user-7")].into_iter().collect();
        assert_eq!(tokens.len(), 2);
        let r = resolver(tokens);
        assert_eq!(r.resolve(&json!("tok2")), Ok("user-7".to_string()));
        assert_eq!(r.resolve(&json!(42)), Err(Rejection::Denied));
    }

    #[test]
    fn test_static_tokens_from_json() {
        let tokens = StaticTokens::from_json(r#"{"abc": "device-1"}"#).unwrap();
        assert_eq!(tokens.authenticate(&json!("abc")), Some("device-1".to_string()));
        assert!(StaticTokens::from_json("[1]").is_err());
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            StaticTokens::parse_pair("tok1=user-42"),
            Some(("tok1".to_string(), "user-42".to_string()))
        );
        assert_eq!(StaticTokens::parse_pair("a=b=c"), Some(("a".into(), "b=c".into())));
        assert_eq!(StaticTokens::parse_pair("missing"), None);
        assert_eq!(StaticTokens::parse_pair("=user"), None);
        assert_eq!(StaticTokens::parse_pair("tok="), None);
    }
}
