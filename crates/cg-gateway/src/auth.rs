//! Auth context resolution
//!
//! A small chain-of-responsibility over the request headers. The gateway
//! never validates tokens - that is the identity service's job behind the
//! bus. What it does is decode the bearer token's payload segment
//! best-effort, so routed payloads can carry the caller's subject.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;

/// Interface-typed auth context the interception pipeline reads. `claims` is
/// whatever payload the resolver produced; no cryptographic validation
/// happens in the gateway.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub claims: Option<Value>,
}

impl AuthContext {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.claims.is_none()
    }
}

/// One resolver in the chain. Returning `None` passes to the next.
pub trait AuthResolver: Send + Sync {
    fn resolve(&self, headers: &HashMap<String, String>) -> Option<AuthContext>;
}

/// Ordered resolver chain; the first resolver that produces a context wins.
pub struct AuthResolverChain {
    resolvers: Vec<Box<dyn AuthResolver>>,
}

impl AuthResolverChain {
    pub fn new(resolvers: Vec<Box<dyn AuthResolver>>) -> Self {
        Self { resolvers }
    }

    /// The standard chain: bearer payload decoding only.
    pub fn standard() -> Self {
        Self::new(vec![Box::new(BearerPayloadResolver)])
    }

    pub fn resolve(&self, headers: &HashMap<String, String>) -> AuthContext {
        for resolver in &self.resolvers {
            if let Some(context) = resolver.resolve(headers) {
                return context;
            }
        }
        AuthContext::default()
    }
}

/// Decodes the second segment of a bearer token as base64-URL JSON and pulls
/// `sub | userId | id` out of it. Any failure leaves the context empty.
pub struct BearerPayloadResolver;

impl AuthResolver for BearerPayloadResolver {
    fn resolve(&self, headers: &HashMap<String, String>) -> Option<AuthContext> {
        let authorization = headers.get("authorization")?;
        let token = strip_bearer(authorization)?;
        let claims = decode_payload_segment(token)?;

        let user_id = claims
            .get("sub")
            .or_else(|| claims.get("userId"))
            .or_else(|| claims.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Some(AuthContext {
            user_id,
            claims: Some(claims),
        })
    }
}

fn strip_bearer(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.len() > 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
        Some(trimmed[7..].trim())
    } else {
        None
    }
}

fn decode_payload_segment(token: &str) -> Option<Value> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bearer_for(claims: &Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("Bearer header.{}.signature", payload)
    }

    fn headers_with_auth(value: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), value.to_string());
        headers
    }

    #[test]
    fn extracts_sub_from_bearer_payload() {
        let headers = headers_with_auth(&bearer_for(&json!({"sub": "u1", "role": "student"})));
        let context = AuthResolverChain::standard().resolve(&headers);
        assert_eq!(context.user_id.as_deref(), Some("u1"));
        assert_eq!(context.claims.unwrap()["role"], "student");
    }

    #[test]
    fn falls_back_to_user_id_and_id_claims() {
        let headers = headers_with_auth(&bearer_for(&json!({"userId": "u2"})));
        let context = AuthResolverChain::standard().resolve(&headers);
        assert_eq!(context.user_id.as_deref(), Some("u2"));

        let headers = headers_with_auth(&bearer_for(&json!({"id": "u3"})));
        let context = AuthResolverChain::standard().resolve(&headers);
        assert_eq!(context.user_id.as_deref(), Some("u3"));
    }

    #[test]
    fn malformed_tokens_resolve_to_empty_context() {
        for value in [
            "Bearer not-a-jwt",
            "Bearer a.!!!.c",
            "Basic dXNlcjpwYXNz",
            "",
        ] {
            let context = AuthResolverChain::standard().resolve(&headers_with_auth(value));
            assert!(context.is_empty(), "expected empty context for {:?}", value);
        }
    }

    #[test]
    fn bearer_prefix_is_case_insensitive() {
        let token = bearer_for(&json!({"sub": "u1"}));
        let lower = token.replacen("Bearer", "bearer", 1);
        let context = AuthResolverChain::standard().resolve(&headers_with_auth(&lower));
        assert_eq!(context.user_id.as_deref(), Some("u1"));
    }
}
