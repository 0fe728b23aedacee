use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, REFERER, SET_COOKIE};
use reqwest::Url;
use std::error::Error as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::clock::TEST_NOW_HEADER;
use crate::handle::{Outcome, RequestId};
use crate::identity::IdentityEncoder;
use crate::launcher::LaunchedProcess;
use crate::request::{Batch, Body, RequestSpec};
use crate::{Response, ResponseHandle, RunnerError};

/// Prefix for headers carrying server variables, e.g. `x-server-var-custom`.
pub const SERVER_VAR_HEADER_PREFIX: &str = "x-server-var-";

/// Where a batch is sent.
#[derive(Debug, Clone)]
pub struct Endpoint {
    addr: SocketAddr,
    process: Option<Arc<LaunchedProcess>>,
}

impl Endpoint {
    /// A process started by the runner. Handles keep it alive.
    pub fn launched(process: Arc<LaunchedProcess>) -> Self {
        Self {
            addr: process.addr(),
            process: Some(process),
        }
    }

    /// An application that is already listening somewhere.
    pub fn external(addr: SocketAddr) -> Self {
        Self { addr, process: None }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn process(&self) -> Option<&Arc<LaunchedProcess>> {
        self.process.as_ref()
    }

    fn base_url(&self) -> Result<Url, RunnerError> {
        Url::parse(&format!("http://{}/", self.addr))
            .map_err(|e| RunnerError::InvalidRequest(format!("bad endpoint {}: {}", self.addr, e)))
    }
}

/// Cookie jar and previous URL shared by one builder and everything derived
/// from it.
#[derive(Debug, Default)]
pub struct Session {
    jar: Jar,
    previous_url: StdMutex<Option<Url>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_url(&self) -> Option<Url> {
        self.previous_url.lock().ok().and_then(|url| url.clone())
    }

    /// The `Cookie` header this session would send to `url`.
    pub fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }

    fn record(&self, url: &Url, headers: &HeaderMap) {
        let mut set_cookies = headers.get_all(SET_COOKIE).iter();
        self.jar.set_cookies(&mut set_cookies, url);
        if let Ok(mut previous) = self.previous_url.lock() {
            *previous = Some(url.clone());
        }
    }
}

/// Fires every request of a batch concurrently and hands back one pending
/// handle per request, in submission order.
pub struct Dispatcher {
    client: reqwest::Client,
    timeout: Duration,
    encoder: Arc<dyn IdentityEncoder>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(timeout: Duration, encoder: Arc<dyn IdentityEncoder>) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RunnerError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            encoder,
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns immediately. Must be called from within a tokio runtime.
    pub fn dispatch(&self, endpoint: &Endpoint, batch: Batch) -> Vec<ResponseHandle> {
        let (specs, session) = batch.into_parts();
        debug!("Dispatching {} request(s) to {}", specs.len(), endpoint.addr);

        specs
            .into_iter()
            .map(|spec| {
                let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let (tx, rx) = oneshot::channel();

                let call = Call {
                    id,
                    client: self.client.clone(),
                    encoder: self.encoder.clone(),
                    endpoint: endpoint.clone(),
                    session: session.clone(),
                    timeout: self.timeout,
                };

                let task = tokio::spawn(async move {
                    let outcome = call.execute(spec).await;
                    if tx.send(outcome).is_err() {
                        debug!("Handle {} dropped before its response arrived", id);
                    }
                });

                ResponseHandle::new(id, rx, task.abort_handle(), endpoint.process().cloned())
            })
            .collect()
    }
}

/// Everything one task needs to run one request.
struct Call {
    id: RequestId,
    client: reqwest::Client,
    encoder: Arc<dyn IdentityEncoder>,
    endpoint: Endpoint,
    session: Option<Arc<Session>>,
    timeout: Duration,
}

impl Call {
    async fn execute(self, spec: RequestSpec) -> Outcome {
        let base = self.endpoint.base_url()?;
        let url = base
            .join(spec.path())
            .map_err(|e| RunnerError::InvalidRequest(format!("bad path {:?}: {}", spec.path(), e)))?;
        let headers = self.headers(&spec, &base, &url)?;

        debug!("Request {}: {} {}", self.id, spec.method(), url);

        let mut request = self
            .client
            .request(spec.method().clone(), url.clone())
            .headers(headers);
        request = match spec.body() {
            Body::Empty => request,
            Body::Form(encoded) => request
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded.clone()),
            Body::Json(value) => request.json(value),
        };

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, headers, body) = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => {
                warn!("Request {} to {} timed out after {:?}", self.id, url, self.timeout);
                return Err(RunnerError::RequestTimeout {
                    id: self.id,
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) => {
                warn!("Request {} to {} failed: {}", self.id, url, e);
                return Err(self.classify(e));
            }
            Ok(Ok(parts)) => parts,
        };

        if let Some(session) = &self.session {
            session.record(&url, &headers);
        }

        debug!("Request {} resolved with {}", self.id, status);
        Ok(Response::new(status, headers, body.to_vec(), url))
    }

    fn headers(&self, spec: &RequestSpec, base: &Url, url: &Url) -> Result<HeaderMap, RunnerError> {
        let mut headers = HeaderMap::new();

        for (name, value) in spec.headers() {
            headers.insert(header_name(name)?, header_value(value)?);
        }

        for (name, value) in spec.server_variables() {
            let name = format!("{}{}", SERVER_VAR_HEADER_PREFIX, name.to_ascii_lowercase());
            headers.insert(header_name(&name)?, header_value(value)?);
        }

        if spec.wants_json() {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        if let Some(token) = spec.token() {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        }

        if let Some(acting_as) = spec.acting_as() {
            let (name, value) = self.encoder.encode(acting_as)?;
            headers.insert(name, value);
        }

        if let Some(at) = spec.test_now() {
            headers.insert(HeaderName::from_static(TEST_NOW_HEADER), header_value(&at.to_rfc3339())?);
        }

        let referer = match spec.referer() {
            Some(from) => Some(
                base.join(from)
                    .map_err(|e| RunnerError::InvalidRequest(format!("bad referer {:?}: {}", from, e)))?,
            ),
            None => self.session.as_ref().and_then(|s| s.previous_url()),
        };
        if let Some(referer) = referer {
            headers.insert(REFERER, header_value(referer.as_str())?);
        }

        if let Some(cookies) = self.session.as_ref().and_then(|s| s.cookies(url)) {
            headers.insert(reqwest::header::COOKIE, cookies);
        }

        Ok(headers)
    }

    fn classify(&self, e: reqwest::Error) -> RunnerError {
        if e.is_timeout() {
            return RunnerError::RequestTimeout {
                id: self.id,
                timeout: self.timeout,
            };
        }
        let mut reason = e.to_string();
        let mut source = e.source();
        while let Some(cause) = source {
            reason.push_str(": ");
            reason.push_str(&cause.to_string());
            source = cause.source();
        }
        RunnerError::ConnectionFailure {
            addr: self.endpoint.addr,
            reason,
        }
    }
}

fn header_name(name: &str) -> Result<HeaderName, RunnerError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RunnerError::InvalidRequest(format!("bad header name {:?}: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue, RunnerError> {
    HeaderValue::from_str(value)
        .map_err(|e| RunnerError::InvalidRequest(format!("bad header value {:?}: {}", value, e)))
}
