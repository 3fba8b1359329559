//! Routing table - deterministic resolution of HTTP requests into bus calls
//!
//! Rules are declared as ordered `(verb, path-template, subject, payload)`
//! tuples. Matching is exact on verb and segment-by-segment on path; the
//! first matching rule in declaration order wins, with no backtracking.
//! Payload builders are pure functions of the job, declared as data through
//! a small combinator set ([`PayloadSpec`]) instead of one closure per rule.

use cg_common::{normalize_path, Job};
use serde_json::{json, Value};
use tracing::debug;

mod table;

pub use table::default_rules;

/// Resolution-time failure: a required route param, query param, header or
/// auth context was absent. The interception pipeline treats this as "no
/// async routing" and falls back to the synchronous handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// A resolved dispatch: the bus subject and the payload to send.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub subject: String,
    pub payload: Value,
    /// Completion event subject, `<subject>.completed` unless overridden.
    pub completion_subject: String,
}

// ============================================================================
// Path Templates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// A parsed path template: literal and `:name` parameter segments, plus `*`
/// matching exactly one segment.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Self {
        let normalized = normalize_path(template);
        let segments = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else if s == "*" {
                    Segment::Wildcard
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    /// Match a normalized path, binding parameter segments.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts.iter()) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.push((name.clone(), (*part).to_string()));
                }
                Segment::Wildcard => {}
            }
        }
        Some(params)
    }
}

// ============================================================================
// Payload Combinators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BodyMode {
    #[default]
    Omit,
    /// Payload is the body itself (empty object when absent).
    Raw,
    /// Body fields are merged into the payload object.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum UserMode {
    #[default]
    None,
    /// Include `userId` when known.
    Optional,
    /// Fail with `MissingField` when neither the token subject nor the
    /// validated-auth context provides one.
    Required,
}

/// Declarative payload builder. Combinators compose: route params, body,
/// query, required headers, the user id, and the validated-auth context.
#[derive(Debug, Clone, Default)]
pub struct PayloadSpec {
    params: &'static [&'static str],
    body: BodyMode,
    include_query: bool,
    required_query: &'static [&'static str],
    /// `(header name, payload key)` pairs, all required.
    headers: &'static [(&'static str, &'static str)],
    user: UserMode,
    require_auth: bool,
}

impl PayloadSpec {
    /// Empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload is the request body as-is.
    pub fn body() -> Self {
        Self {
            body: BodyMode::Raw,
            ..Self::default()
        }
    }

    /// Payload starts from the named route params.
    pub fn params(params: &'static [&'static str]) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Merge the request body's fields into the payload.
    pub fn with_body(mut self) -> Self {
        self.body = BodyMode::Merge;
        self
    }

    /// Include every query parameter (first value per key).
    pub fn with_query(mut self) -> Self {
        self.include_query = true;
        self
    }

    /// Require the named query keys to be present and non-empty.
    pub fn require_query(mut self, keys: &'static [&'static str]) -> Self {
        self.required_query = keys;
        self
    }

    /// Require a header, mapping it into the payload under the given key.
    pub fn require_header(mut self, headers: &'static [(&'static str, &'static str)]) -> Self {
        self.headers = headers;
        self
    }

    /// Include `userId` when the job carries one.
    pub fn with_user(mut self) -> Self {
        self.user = UserMode::Optional;
        self
    }

    /// Require a user id: `job.user_id`, else the subject field of the
    /// validated-auth context.
    pub fn require_user(mut self) -> Self {
        self.user = UserMode::Required;
        self
    }

    /// Require the validated-auth context, included under `auth`.
    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Build the payload from the job. Pure: no side effects, same job in,
    /// same payload out.
    pub fn build(&self, job: &Job) -> Result<Value, RoutingError> {
        // Fast path: a bare body spec sends the body verbatim.
        if self.is_bare_body() {
            return Ok(job.body.clone().unwrap_or_else(|| json!({})));
        }

        let mut payload = serde_json::Map::new();

        for name in self.params {
            let value = job
                .route_params
                .get(*name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RoutingError::MissingField((*name).to_string()))?;
            payload.insert((*name).to_string(), Value::String(value.clone()));
        }

        if self.body != BodyMode::Omit {
            match &job.body {
                Some(Value::Object(map)) => {
                    for (k, v) in map {
                        payload.insert(k.clone(), v.clone());
                    }
                }
                Some(other) => {
                    payload.insert("data".to_string(), other.clone());
                }
                None => {}
            }
        }

        for key in self.required_query {
            let value = first_query_value(job, key)
                .ok_or_else(|| RoutingError::MissingField((*key).to_string()))?;
            payload.insert((*key).to_string(), Value::String(value));
        }

        if self.include_query {
            for (key, values) in &job.query_params {
                if self.required_query.contains(&key.as_str()) {
                    continue;
                }
                if let Some(first) = values.first() {
                    payload.insert(key.clone(), Value::String(first.clone()));
                }
            }
        }

        for (header, key) in self.headers {
            let value = job
                .headers
                .get(*header)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| RoutingError::MissingField((*header).to_string()))?;
            payload.insert((*key).to_string(), Value::String(value.clone()));
        }

        match self.user {
            UserMode::None => {}
            UserMode::Optional => {
                if let Some(user_id) = resolve_user_id(job) {
                    payload.insert("userId".to_string(), Value::String(user_id));
                }
            }
            UserMode::Required => {
                let user_id = resolve_user_id(job)
                    .ok_or_else(|| RoutingError::MissingField("userId".to_string()))?;
                payload.insert("userId".to_string(), Value::String(user_id));
            }
        }

        if self.require_auth {
            let context = job
                .context
                .clone()
                .ok_or_else(|| RoutingError::MissingField("auth".to_string()))?;
            payload.insert("auth".to_string(), context);
        }

        Ok(Value::Object(payload))
    }

    fn is_bare_body(&self) -> bool {
        self.body == BodyMode::Raw
            && self.params.is_empty()
            && !self.include_query
            && self.required_query.is_empty()
            && self.headers.is_empty()
            && self.user == UserMode::None
            && !self.require_auth
    }
}

/// `job.user_id` if present, else the subject field of the validated-auth
/// context.
fn resolve_user_id(job: &Job) -> Option<String> {
    if let Some(user_id) = &job.user_id {
        return Some(user_id.clone());
    }
    job.context.as_ref().and_then(|ctx| {
        ctx.get("sub")
            .or_else(|| ctx.get("userId"))
            .or_else(|| ctx.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    })
}

/// A multi-value query reduces to its first element.
fn first_query_value(job: &Job, key: &str) -> Option<String> {
    job.query_params
        .get(key)
        .and_then(|values| values.first())
        .filter(|v| !v.is_empty())
        .cloned()
}

// ============================================================================
// Rules and Table
// ============================================================================

/// One declared routing rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub verb: cg_common::Verb,
    pub template: PathTemplate,
    pub subject: &'static str,
    pub payload: PayloadSpec,
    /// Completion event subject override.
    pub completion: Option<&'static str>,
}

impl RouteRule {
    pub fn new(
        verb: cg_common::Verb,
        template: &str,
        subject: &'static str,
        payload: PayloadSpec,
    ) -> Self {
        Self {
            verb,
            template: PathTemplate::parse(template),
            subject,
            payload,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: &'static str) -> Self {
        self.completion = Some(completion);
        self
    }
}

/// The ordered routing table.
pub struct RoutingTable {
    rules: Vec<RouteRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// Table with the full production rule set.
    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a job into a bus dispatch. Binds route params on the job as a
    /// side effect of matching. Returns `Ok(None)` when no rule matches and
    /// `Err(MissingField)` when the winning rule's builder lacked a required
    /// field; there is no backtracking past the first match.
    pub fn resolve(&self, job: &mut Job) -> Result<Option<Resolution>, RoutingError> {
        for rule in &self.rules {
            if rule.verb != job.verb {
                continue;
            }
            let Some(params) = rule.template.matches(&job.normalized_path) else {
                continue;
            };

            for (name, value) in params {
                job.route_params.insert(name, value);
            }

            let payload = rule.payload.build(job)?;
            let completion_subject = rule
                .completion
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("{}.completed", rule.subject));

            debug!(
                verb = %job.verb,
                path = %job.normalized_path,
                subject = %rule.subject,
                "Resolved route"
            );

            return Ok(Some(Resolution {
                subject: rule.subject.to_string(),
                payload,
                completion_subject,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_common::Verb;
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn make_job(verb: Verb, path: &str) -> Job {
        Job {
            id: "j1".to_string(),
            verb,
            normalized_path: normalize_path(path),
            raw_url: path.to_string(),
            body: None,
            query_params: IndexMap::new(),
            route_params: HashMap::new(),
            headers: HashMap::new(),
            user_id: None,
            client_ip: "127.0.0.1".to_string(),
            created_at: 0,
            context: None,
            subject: None,
            payload: None,
            attempts: 0,
            queue_name: None,
            worker_id: None,
        }
    }

    #[test]
    fn template_binds_params() {
        let template = PathTemplate::parse("/courses/:id");
        let bound = template.matches("/courses/c42").unwrap();
        assert_eq!(bound, vec![("id".to_string(), "c42".to_string())]);
        assert!(template.matches("/courses").is_none());
        assert!(template.matches("/courses/c42/extra").is_none());
    }

    #[test]
    fn wildcard_matches_one_segment() {
        let template = PathTemplate::parse("/files/*/raw");
        assert!(template.matches("/files/abc/raw").is_some());
        assert!(template.matches("/files/raw").is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            RouteRule::new(Verb::GET, "/courses/:id", "first.subject", PayloadSpec::params(&["id"])),
            RouteRule::new(Verb::GET, "/courses/:code", "second.subject", PayloadSpec::params(&["code"])),
        ];
        let table = RoutingTable::new(rules);
        let mut job = make_job(Verb::GET, "/courses/c1");
        let resolution = table.resolve(&mut job).unwrap().unwrap();
        assert_eq!(resolution.subject, "first.subject");
        assert_eq!(job.route_params.get("id").unwrap(), "c1");
    }

    #[test]
    fn resolution_is_deterministic() {
        let table = RoutingTable::with_default_rules();
        let mut a = make_job(Verb::POST, "/courses");
        a.body = Some(serde_json::json!({"code": "INF110"}));
        let mut b = a.clone();

        let ra = table.resolve(&mut a).unwrap().unwrap();
        let rb = table.resolve(&mut b).unwrap().unwrap();
        assert_eq!(ra.subject, rb.subject);
        assert_eq!(ra.payload, rb.payload);
    }

    #[test]
    fn bare_body_spec_sends_body_verbatim() {
        let mut job = make_job(Verb::POST, "/courses");
        job.body = Some(serde_json::json!({"code": "INF110", "credits": 6}));
        let payload = PayloadSpec::body().build(&job).unwrap();
        assert_eq!(payload, serde_json::json!({"code": "INF110", "credits": 6}));
    }

    #[test]
    fn params_with_body_merges() {
        let mut job = make_job(Verb::PUT, "/courses/c1");
        job.route_params.insert("id".to_string(), "c1".to_string());
        job.body = Some(serde_json::json!({"credits": 8}));
        let payload = PayloadSpec::params(&["id"]).with_body().build(&job).unwrap();
        assert_eq!(payload, serde_json::json!({"id": "c1", "credits": 8}));
    }

    #[test]
    fn missing_param_fails_resolution() {
        let job = make_job(Verb::GET, "/courses");
        let err = PayloadSpec::params(&["id"]).build(&job).unwrap_err();
        assert!(matches!(err, RoutingError::MissingField(f) if f == "id"));
    }

    #[test]
    fn required_header_is_enforced() {
        let mut job = make_job(Verb::POST, "/atomic-enrollment/enroll");
        job.body = Some(serde_json::json!({"enrollment_id": "e1"}));
        let spec = PayloadSpec::empty()
            .with_body()
            .require_header(&[("x-idempotency-key", "idempotencyKey")]);

        let err = spec.build(&job).unwrap_err();
        assert!(matches!(err, RoutingError::MissingField(f) if f == "x-idempotency-key"));

        job.headers
            .insert("x-idempotency-key".to_string(), "k1".to_string());
        let payload = spec.build(&job).unwrap();
        assert_eq!(payload["idempotencyKey"], "k1");
        assert_eq!(payload["enrollment_id"], "e1");
    }

    #[test]
    fn require_user_falls_back_to_context_subject() {
        let mut job = make_job(Verb::GET, "/auth/profile");
        let err = PayloadSpec::empty().require_user().build(&job).unwrap_err();
        assert!(matches!(err, RoutingError::MissingField(f) if f == "userId"));

        job.context = Some(serde_json::json!({"sub": "u9"}));
        let payload = PayloadSpec::empty().require_user().build(&job).unwrap();
        assert_eq!(payload["userId"], "u9");
    }

    #[test]
    fn multi_value_query_reduces_to_first() {
        let mut job = make_job(Verb::GET, "/courses");
        job.query_params
            .insert("tag".to_string(), vec!["a".to_string(), "b".to_string()]);
        let payload = PayloadSpec::empty()
            .require_query(&["tag"])
            .build(&job)
            .unwrap();
        assert_eq!(payload["tag"], "a");
    }

    #[test]
    fn completion_subject_defaults_and_overrides() {
        let rule = RouteRule::new(Verb::GET, "/x", "domain.op", PayloadSpec::empty());
        let table = RoutingTable::new(vec![rule]);
        let mut job = make_job(Verb::GET, "/x");
        let res = table.resolve(&mut job).unwrap().unwrap();
        assert_eq!(res.completion_subject, "domain.op.completed");

        let rule = RouteRule::new(Verb::GET, "/x", "domain.op", PayloadSpec::empty())
            .with_completion("domain.op.done");
        let table = RoutingTable::new(vec![rule]);
        let mut job = make_job(Verb::GET, "/x");
        let res = table.resolve(&mut job).unwrap().unwrap();
        assert_eq!(res.completion_subject, "domain.op.done");
    }
}
