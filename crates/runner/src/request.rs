//! Request descriptors and the fluent builder that materializes them.
//!
//! [`ParallelRequest`] is immutable: every configuration call returns a new
//! value, so one configured builder can be reused freely across batches. The
//! cookie jar and previous URL are the only shared state, and they are shared
//! only with builders derived from the same [`Runner::create`] call.

use chrono::{DateTime, FixedOffset};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatcher::Session;
use crate::identity::{ActingAs, Identity};
use crate::{Clock, ResponseHandle, Runner, RunnerError};

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    /// Already `application/x-www-form-urlencoded`.
    Form(String),
    Json(Value),
}

impl Body {
    /// Form-encodes any serializable map, struct or sequence of pairs.
    pub fn form<T: Serialize + ?Sized>(data: &T) -> Result<Self, RunnerError> {
        let encoded = serde_urlencoded::to_string(data)
            .map_err(|e| RunnerError::InvalidRequest(format!("cannot form-encode body: {}", e)))?;
        Ok(if encoded.is_empty() { Body::Empty } else { Body::Form(encoded) })
    }

    /// JSON-encodes `data`. A unit/`null` payload becomes `{}`.
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<Self, RunnerError> {
        let value = serde_json::to_value(data)
            .map_err(|e| RunnerError::InvalidRequest(format!("cannot JSON-encode body: {}", e)))?;
        Ok(match value {
            Value::Null => Body::Json(Value::Object(Default::default())),
            value => Body::Json(value),
        })
    }
}

/// One HTTP request to issue. The dispatcher only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    method: Method,
    path: String,
    body: Body,
    headers: BTreeMap<String, String>,
    server_variables: BTreeMap<String, String>,
    referer: Option<String>,
    token: Option<String>,
    acting_as: Option<ActingAs>,
    wants_json: bool,
    test_now: Option<DateTime<FixedOffset>>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: Body::Empty,
            headers: BTreeMap::new(),
            server_variables: BTreeMap::new(),
            referer: None,
            token: None,
            acting_as: None,
            wants_json: false,
            test_now: None,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_server_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_variables.insert(name.into(), value.into());
        self
    }

    pub fn with_referer(mut self, from: impl Into<String>) -> Self {
        self.referer = Some(from.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_acting_as(mut self, acting_as: ActingAs) -> Self {
        self.acting_as = Some(acting_as);
        self
    }

    pub fn with_wants_json(mut self, wants_json: bool) -> Self {
        self.wants_json = wants_json;
        self
    }

    pub fn with_test_now(mut self, at: Option<DateTime<FixedOffset>>) -> Self {
        self.test_now = at;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn server_variables(&self) -> &BTreeMap<String, String> {
        &self.server_variables
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn acting_as(&self) -> Option<&ActingAs> {
        self.acting_as.as_ref()
    }

    pub fn wants_json(&self) -> bool {
        self.wants_json
    }

    pub fn test_now(&self) -> Option<DateTime<FixedOffset>> {
        self.test_now
    }
}

/// Ordered group of specs dispatched together, optionally bound to a session.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    specs: Vec<RequestSpec>,
    session: Option<Arc<Session>>,
}

impl Batch {
    pub fn new(specs: Vec<RequestSpec>) -> Self {
        Self { specs, session: None }
    }

    pub fn single(spec: RequestSpec) -> Self {
        Self::new(vec![spec])
    }

    /// `times` independent copies of `spec`.
    pub fn repeat(spec: RequestSpec, times: usize) -> Self {
        Self::new(vec![spec; times])
    }

    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[RequestSpec] {
        &self.specs
    }

    pub(crate) fn into_parts(self) -> (Vec<RequestSpec>, Option<Arc<Session>>) {
        (self.specs, self.session)
    }
}

/// Fluent request builder. Obtain one from [`Runner::create`].
#[derive(Clone)]
pub struct ParallelRequest {
    runner: Runner,
    session: Arc<Session>,
    headers: BTreeMap<String, String>,
    server_variables: BTreeMap<String, String>,
    referer: Option<String>,
    token: Option<String>,
    acting_as: Option<ActingAs>,
    clock: Clock,
}

impl ParallelRequest {
    pub(crate) fn new(runner: Runner, clock: Clock) -> Self {
        Self {
            runner,
            session: Arc::new(Session::new()),
            headers: BTreeMap::new(),
            server_variables: BTreeMap::new(),
            referer: None,
            token: None,
            acting_as: None,
            clock,
        }
    }

    fn derive(&self, change: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        change(&mut next);
        next
    }

    /// Sends `path` as the `Referer`, i.e. the page the request came from.
    pub fn from(&self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.derive(|r| r.referer = Some(path))
    }

    pub fn with_server_variables<I, K, V>(&self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.derive(|r| {
            r.server_variables
                .extend(variables.into_iter().map(|(k, v)| (k.into(), v.into())))
        })
    }

    pub fn with_header(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.derive(|r| {
            r.headers.insert(name, value);
        })
    }

    pub fn with_headers<I, K, V>(&self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.derive(|r| {
            r.headers
                .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())))
        })
    }

    /// Authenticates as `identity` on `guard` (`web` when `None`).
    pub fn acting_as(&self, identity: Identity, guard: Option<&str>) -> Self {
        let acting_as = ActingAs::new(identity, guard);
        self.derive(|r| r.acting_as = Some(acting_as))
    }

    /// Sends `Authorization: Bearer <token>`.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.derive(|r| r.token = Some(token))
    }

    pub fn with_clock(&self, clock: Clock) -> Self {
        self.derive(|r| r.clock = clock)
    }

    /// Issues every following verb `times` times concurrently.
    pub fn times(&self, times: usize) -> RepeatedRequest {
        RepeatedRequest {
            request: self.clone(),
            times,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn get(&self, path: &str) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::GET, path, Body::Empty, false).await
    }

    pub async fn delete(&self, path: &str) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::DELETE, path, Body::Empty, false).await
    }

    /// Form-encoded POST. Pass `&()` for an empty body.
    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::POST, path, Body::form(data)?, false).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::PUT, path, Body::form(data)?, false).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::PATCH, path, Body::form(data)?, false).await
    }

    /// JSON request with `Accept: application/json`. `data` is sent as the
    /// body whatever the method, GET included.
    pub async fn json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        data: &T,
    ) -> Result<ResponseHandle, RunnerError> {
        self.one(method, path, Body::json(data)?, true).await
    }

    /// JSON GET without a body.
    pub async fn get_json(&self, path: &str) -> Result<ResponseHandle, RunnerError> {
        self.one(Method::GET, path, Body::Empty, true).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<ResponseHandle, RunnerError> {
        self.json(Method::POST, path, data).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<ResponseHandle, RunnerError> {
        self.json(Method::PATCH, path, data).await
    }

    /// Builds the [`RequestSpec`] a verb would send, without sending it.
    pub fn spec(&self, method: Method, path: &str, body: Body, wants_json: bool) -> RequestSpec {
        let mut spec = RequestSpec::new(method, path)
            .with_body(body)
            .with_wants_json(wants_json)
            .with_test_now(self.clock.test_now());
        spec.headers = self.headers.clone();
        spec.server_variables = self.server_variables.clone();
        spec.referer = self.referer.clone();
        spec.token = self.token.clone();
        spec.acting_as = self.acting_as.clone();
        spec
    }

    async fn one(&self, method: Method, path: &str, body: Body, wants_json: bool) -> Result<ResponseHandle, RunnerError> {
        self.issue(1, method, path, body, wants_json)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::InvalidRequest("dispatcher returned no handle".to_string()))
    }

    async fn issue(
        &self,
        times: usize,
        method: Method,
        path: &str,
        body: Body,
        wants_json: bool,
    ) -> Result<Vec<ResponseHandle>, RunnerError> {
        let spec = self.spec(method, path, body, wants_json);
        let batch = Batch::repeat(spec, times).with_session(self.session.clone());
        self.runner.dispatch(batch).await
    }
}

/// A builder whose verbs each produce `times` handles, in submission order.
#[derive(Clone)]
pub struct RepeatedRequest {
    request: ParallelRequest,
    times: usize,
}

impl RepeatedRequest {
    pub fn times(&self) -> usize {
        self.times
    }

    pub async fn get(&self, path: &str) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::GET, path, Body::Empty, false).await
    }

    pub async fn delete(&self, path: &str) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::DELETE, path, Body::Empty, false).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::POST, path, Body::form(data)?, false).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::PUT, path, Body::form(data)?, false).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::PATCH, path, Body::form(data)?, false).await
    }

    pub async fn json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        data: &T,
    ) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, method, path, Body::json(data)?, true).await
    }

    pub async fn get_json(&self, path: &str) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.request.issue(self.times, Method::GET, path, Body::Empty, true).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.json(Method::POST, path, data).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<Vec<ResponseHandle>, RunnerError> {
        self.json(Method::PATCH, path, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunnerConfig;
    use serde_json::json;

    fn request() -> ParallelRequest {
        Runner::new(RunnerConfig::new("app")).unwrap().create()
    }

    #[test]
    fn test_builder_calls_do_not_mutate_the_original() {
        let base = request();
        let configured = base
            .from("/foo")
            .with_token("t0k3n")
            .with_server_variables([("CUSTOM", "custom")])
            .acting_as(Identity::model(1), Some("api"));

        let untouched = base.spec(Method::GET, "/", Body::Empty, false);
        assert_eq!(untouched.referer(), None);
        assert_eq!(untouched.token(), None);
        assert!(untouched.server_variables().is_empty());
        assert!(untouched.acting_as().is_none());

        let spec = configured.spec(Method::GET, "/", Body::Empty, false);
        assert_eq!(spec.referer(), Some("/foo"));
        assert_eq!(spec.token(), Some("t0k3n"));
        assert_eq!(spec.server_variables()["CUSTOM"], "custom");
        assert_eq!(spec.acting_as().map(|a| a.guard.as_str()), Some("api"));
    }

    #[test]
    fn test_derived_builders_share_the_session() {
        let base = request();
        let derived = base.with_header("X-Trace", "1");
        assert!(Arc::ptr_eq(base.session(), derived.session()));

        let other = request();
        assert!(!Arc::ptr_eq(base.session(), other.session()));
    }

    #[test]
    fn test_frozen_clock_is_stamped_on_spec() {
        let clock = Clock::parse("2023-01-01T00:00:00+00:00").unwrap();
        let spec = request()
            .with_clock(clock)
            .spec(Method::GET, "/date", Body::Empty, false);
        assert_eq!(spec.test_now(), clock.test_now());
    }

    #[test]
    fn test_repeat_preserves_order_and_count() {
        let spec = RequestSpec::new(Method::GET, "/");
        let batch = Batch::repeat(spec.clone(), 10);
        assert_eq!(batch.len(), 10);
        assert!(batch.specs().iter().all(|s| *s == spec));
        assert!(Batch::repeat(spec, 0).is_empty());
    }

    #[test]
    fn test_body_encoding() {
        assert_eq!(
            Body::form(&[("email", "a@b.c"), ("password", "password")]).unwrap(),
            Body::Form("email=a%40b.c&password=password".to_string())
        );
        assert_eq!(Body::form(&()).unwrap(), Body::Empty);
        assert_eq!(Body::json(&()).unwrap(), Body::Json(json!({})));
        assert_eq!(Body::json(&json!({"a": 1})).unwrap(), Body::Json(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_zero_times_returns_no_handles_without_launching() {
        // The binary does not exist, so any launch attempt would fail.
        let runner = Runner::new(RunnerConfig::new("/definitely/not/here/artisan")).unwrap();
        let repeated = runner.create().times(0);

        assert!(repeated.get("/").await.unwrap().is_empty());
        assert!(repeated.patch_json("/session", &json!({"a": 1})).await.unwrap().is_empty());
        assert!(runner.process().await.is_none());
    }
}
