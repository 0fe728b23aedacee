//! Concurrent HTTP requests against a locally launched application.
//!
//! A [`Runner`] starts the application through its command-line entry point
//! (`<binary> serve --host H --port P`), and every builder it creates fires
//! requests at that process concurrently, handing back one
//! [`ResponseHandle`] per request.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use parallel_runner::{Runner, RunnerConfig};
//!
//! let runner = Runner::new(RunnerConfig::new("./target/debug/fixture-app"))?;
//!
//! for handle in runner.create().times(10).get("/sleep").await? {
//!     handle.wait().await?.assert_ok()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod dispatcher;
mod error;
pub mod handle;
pub mod identity;
pub mod launcher;
pub mod request;
mod response;
mod runner;

pub use clock::Clock;
pub use config::{ProcessPolicy, RunnerConfig};
pub use dispatcher::{Dispatcher, Endpoint, Session};
pub use error::{AssertionFailure, RunnerError};
pub use handle::{RequestId, ResponseHandle};
pub use identity::{ActingAs, Identity, IdentityEncoder, JwtIdentityEncoder};
pub use launcher::{LaunchedProcess, Launcher, ProcessState};
pub use request::{Batch, Body, ParallelRequest, RepeatedRequest, RequestSpec};
pub use response::Response;
pub use runner::Runner;

pub use reqwest::{Method, StatusCode};
