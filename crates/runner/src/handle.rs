use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::AbortHandle;

use crate::launcher::LaunchedProcess;
use crate::{Response, RunnerError};

/// Identity of one dispatched request, unique per dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type Outcome = Result<Response, RunnerError>;

/// An in-flight request. Resolves exactly once; every `wait()` after that
/// returns the cached outcome without touching the network again.
pub struct ResponseHandle {
    id: RequestId,
    receiver: Mutex<oneshot::Receiver<Outcome>>,
    outcome: OnceCell<Outcome>,
    task: AbortHandle,
    // Keeps a per-batch process alive for as long as its handles exist.
    _process: Option<Arc<LaunchedProcess>>,
}

impl ResponseHandle {
    pub(crate) fn new(
        id: RequestId,
        receiver: oneshot::Receiver<Outcome>,
        task: AbortHandle,
        process: Option<Arc<LaunchedProcess>>,
    ) -> Self {
        Self {
            id,
            receiver: Mutex::new(receiver),
            outcome: OnceCell::new(),
            task,
            _process: process,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Suspends until the request resolves and returns its response.
    ///
    /// Cancel-safe: dropping the future before it completes leaves the
    /// handle pending and a later `wait()` picks up where it left off.
    pub async fn wait(&self) -> Result<&Response, RunnerError> {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                let mut receiver = self.receiver.lock().await;
                match (&mut *receiver).await {
                    Ok(outcome) => outcome,
                    // Sender dropped without a result: the task was aborted.
                    Err(_) => Err(RunnerError::Cancelled { id: self.id }),
                }
            })
            .await;

        outcome.as_ref().map_err(Clone::clone)
    }

    /// Aborts the request if it has not completed yet. Waiting afterwards
    /// yields [`RunnerError::Cancelled`] unless a response already arrived.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// `true` once `wait()` would return without suspending.
    pub fn is_finished(&self) -> bool {
        self.outcome.initialized() || self.task.is_finished()
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("resolved", &self.outcome.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::time::Duration;

    fn pending(id: u64) -> (oneshot::Sender<Outcome>, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(std::future::pending::<()>());
        (tx, ResponseHandle::new(RequestId(id), rx, task.abort_handle(), None))
    }

    fn ok_response(body: &str) -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            body.as_bytes().to_vec(),
            "http://127.0.0.1/".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let (tx, handle) = pending(1);
        tx.send(Ok(ok_response("first"))).unwrap();

        let first = handle.wait().await.unwrap() as *const Response;
        let second = handle.wait().await.unwrap() as *const Response;

        assert_eq!(first, second, "wait() must return the cached response");
        assert_eq!(handle.wait().await.unwrap().text(), "first");
    }

    #[tokio::test]
    async fn test_failure_is_cached() {
        let (tx, handle) = pending(2);
        let timeout = RunnerError::RequestTimeout {
            id: RequestId(2),
            timeout: Duration::from_millis(10),
        };
        tx.send(Err(timeout.clone())).unwrap();

        assert_eq!(handle.wait().await.unwrap_err(), timeout);
        assert_eq!(handle.wait().await.unwrap_err(), timeout);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_cancelled() {
        let (tx, handle) = pending(3);
        drop(tx);
        handle.cancel();

        assert_eq!(
            handle.wait().await.unwrap_err(),
            RunnerError::Cancelled { id: RequestId(3) }
        );
    }

    #[tokio::test]
    async fn test_wait_survives_being_dropped_mid_flight() {
        let (tx, handle) = pending(4);

        let early = tokio::time::timeout(Duration::from_millis(20), handle.wait()).await;
        assert!(early.is_err(), "nothing was sent yet");

        tx.send(Ok(ok_response("late"))).unwrap();
        assert_eq!(handle.wait().await.unwrap().text(), "late");
    }
}
