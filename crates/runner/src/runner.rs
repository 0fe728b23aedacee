use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, ProcessPolicy};
use crate::dispatcher::{Dispatcher, Endpoint};
use crate::identity::{IdentityEncoder, JwtIdentityEncoder};
use crate::launcher::{LaunchedProcess, Launcher};
use crate::request::{Batch, ParallelRequest};
use crate::{Clock, ResponseHandle, RunnerError};

/// Entry point: owns the launcher, the dispatcher and the lifecycle of the
/// application process. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
    clock: Clock,
}

struct Inner {
    config: Config,
    launcher: Launcher,
    dispatcher: Dispatcher,
    /// The long-lived process under [`ProcessPolicy::Reuse`].
    shared: Mutex<Option<Arc<LaunchedProcess>>>,
}

impl Runner {
    pub fn new(config: Config) -> Result<Self, RunnerError> {
        let encoder = Arc::new(JwtIdentityEncoder::new(config.app_key.as_bytes()));
        Self::with_encoder(config, encoder)
    }

    /// Loads the configuration from `PARALLEL_*` environment variables.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::new(Config::from_env()?)
    }

    /// Uses a custom hook to serialize acting-as identities.
    pub fn with_encoder(config: Config, encoder: Arc<dyn IdentityEncoder>) -> Result<Self, RunnerError> {
        config.validate()?;
        info!("Runner configured: {}", config);

        let dispatcher = Dispatcher::new(config.request_timeout(), encoder)?;
        let launcher = Launcher::new(&config);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                dispatcher,
                shared: Mutex::new(None),
            }),
            clock: Clock::System,
        })
    }

    /// A runner sharing this one's process but stamping requests with `clock`.
    pub fn with_clock(&self, clock: Clock) -> Self {
        Self {
            inner: self.inner.clone(),
            clock,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// A fresh builder with its own session.
    pub fn create(&self) -> ParallelRequest {
        ParallelRequest::new(self.clone(), self.clock)
    }

    /// Launches or reuses a process and fires `batch` at it.
    ///
    /// A launch failure aborts the whole batch; any other failure surfaces
    /// through the affected handle only. An empty batch launches nothing.
    pub async fn dispatch(&self, batch: Batch) -> Result<Vec<ResponseHandle>, RunnerError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = self.endpoint().await?;
        Ok(self.inner.dispatcher.dispatch(&endpoint, batch))
    }

    /// The endpoint the next batch would be sent to, launching a process if
    /// the policy requires one.
    pub async fn endpoint(&self) -> Result<Endpoint, RunnerError> {
        let config = &self.inner.config;
        match config.process_policy {
            ProcessPolicy::Reuse => {
                let mut shared = self.inner.shared.lock().await;
                if let Some(process) = shared.as_ref() {
                    if process.is_running() {
                        return Ok(Endpoint::launched(process.clone()));
                    }
                    warn!("Process {:?} is gone, launching a new one", process.pid());
                }
                let process = Arc::new(self.launch().await?);
                *shared = Some(process.clone());
                Ok(Endpoint::launched(process))
            }
            ProcessPolicy::PerBatch => Ok(Endpoint::launched(Arc::new(self.launch().await?))),
        }
    }

    /// The shared process, if one has been launched.
    pub async fn process(&self) -> Option<Arc<LaunchedProcess>> {
        self.inner.shared.lock().await.clone()
    }

    /// Stops the shared process. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        let process = self.inner.shared.lock().await.take();
        match process {
            Some(process) => process.stop().await,
            None => Ok(()),
        }
    }

    async fn launch(&self) -> Result<LaunchedProcess, RunnerError> {
        let config = &self.inner.config;
        self.inner.launcher.start(&config.binary, config.port).await
    }
}
