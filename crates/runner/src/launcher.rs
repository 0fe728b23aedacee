use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::RunnerError;

// Serializes process creation inside this test process so two launches never
// race for the same ephemeral port.
static LAUNCH_LOCK: Mutex<()> = Mutex::const_new(());

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(250);
// How long the child must stay alive after its port first answers.
const READY_GRACE: Duration = Duration::from_millis(50);
const PUMP_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Everything the child wrote so far, byte for byte.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    stdout: StdMutex<Vec<u8>>,
    stderr: StdMutex<Vec<u8>>,
    changed: Notify,
}

impl CapturedOutput {
    pub fn stdout_bytes(&self) -> Vec<u8> {
        self.stdout.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        self.stderr.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Stdout decoded lossily; invalid UTF-8 shows up as U+FFFD.
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout_bytes()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr_bytes()).into_owned()
    }

    fn contains(&self, needle: &str) -> bool {
        self.stdout().contains(needle) || self.stderr().contains(needle)
    }

    fn push(&self, stream: Stream, chunk: &[u8]) {
        let buffer = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        if let Ok(mut buffer) = buffer.lock() {
            buffer.extend_from_slice(chunk);
        }
        self.changed.notify_waiters();
    }

    /// Waits until `needle` shows up on stdout or stderr. Returns `false` if
    /// it did not appear within `limit`.
    pub async fn wait_for(&self, needle: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let changed = self.changed.notified();
            if self.contains(needle) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, changed).await.is_err() {
                return self.contains(needle);
            }
        }
    }
}

/// A running application process bound to a local address.
#[derive(Debug)]
pub struct LaunchedProcess {
    pid: Option<u32>,
    addr: SocketAddr,
    binary: PathBuf,
    child: StdMutex<Option<Child>>,
    state: StdMutex<ProcessState>,
    output: Arc<CapturedOutput>,
}

impl LaunchedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> ProcessState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ProcessState::Terminated)
    }

    pub fn output(&self) -> &Arc<CapturedOutput> {
        &self.output
    }

    pub fn stdout(&self) -> String {
        self.output.stdout()
    }

    pub fn stderr(&self) -> String {
        self.output.stderr()
    }

    pub fn stdout_bytes(&self) -> Vec<u8> {
        self.output.stdout_bytes()
    }

    pub fn stderr_bytes(&self) -> Vec<u8> {
        self.output.stderr_bytes()
    }

    pub async fn wait_for_output(&self, needle: &str, limit: Duration) -> bool {
        self.output.wait_for(needle, limit).await
    }

    /// `false` once the child has exited or been stopped.
    pub fn is_running(&self) -> bool {
        let Ok(mut child) = self.child.lock() else {
            return false;
        };
        let running = match child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!("Process {:?} ({}) exited with {}", self.pid, self.binary.display(), status);
                false
            }
            Some(Err(e)) => {
                warn!("Failed to poll process {:?}: {}", self.pid, e);
                false
            }
            None => false,
        };
        if !running {
            self.set_state(ProcessState::Terminated);
        }
        running
    }

    /// Kills and reaps the child. Stopping an already stopped process is a no-op.
    pub async fn stop(&self) -> Result<(), RunnerError> {
        let child = self.child.lock().ok().and_then(|mut c| c.take());
        let Some(mut child) = child else {
            debug!("Process {:?} already stopped", self.pid);
            return Ok(());
        };

        info!("Stopping process {:?} on {}", self.pid, self.addr);
        if let Err(e) = child.start_kill() {
            // Already exited on its own; still reap it below.
            debug!("Kill signal for {:?} not delivered: {}", self.pid, e);
        }
        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::launch(&self.binary, format!("failed to reap process: {}", e)))?;
        debug!("Process {:?} exited with {}", self.pid, status);

        self.set_state(ProcessState::Terminated);
        Ok(())
    }

    fn set_state(&self, state: ProcessState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

/// Starts application processes and waits until they accept connections.
#[derive(Debug, Clone)]
pub struct Launcher {
    host: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    ready_timeout: Duration,
    passthrough: bool,
}

impl Launcher {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            args: config.args.clone(),
            env: config.child_env(),
            ready_timeout: config.ready_timeout(),
            passthrough: config.passthrough_output,
        }
    }

    /// Spawns `binary` bound to `configured_port` (or an ephemeral port) and
    /// returns once it accepts TCP connections.
    pub async fn start(
        &self,
        binary: &Path,
        configured_port: Option<u16>,
    ) -> Result<LaunchedProcess, RunnerError> {
        let _guard = LAUNCH_LOCK.lock().await;

        let port = match configured_port {
            Some(port) => port,
            None => allocate_port(&self.host).map_err(|e| {
                RunnerError::launch(binary, format!("cannot allocate a port on {}: {}", self.host, e))
            })?,
        };
        let addr = resolve(&self.host, port)
            .await
            .map_err(|e| RunnerError::launch(binary, e))?;

        // A foreign listener would otherwise pass the readiness probe.
        if accepts_connections(addr).await {
            return Err(RunnerError::launch(
                binary,
                format!("port {} is already in use on {}", port, self.host),
            ));
        }

        info!("Launching {} on {}", binary.display(), addr);

        let mut child = Command::new(binary)
            .args(&self.args)
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(port.to_string())
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::launch(binary, e))?;

        let output = Arc::new(CapturedOutput::default());
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, Stream::Stdout, output.clone(), self.passthrough);
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, Stream::Stderr, output.clone(), self.passthrough);
        }

        let process = LaunchedProcess {
            pid: child.id(),
            addr,
            binary: binary.to_path_buf(),
            child: StdMutex::new(Some(child)),
            state: StdMutex::new(ProcessState::Starting),
            output,
        };

        match self.wait_ready(&process).await {
            Ok(()) => {
                process.set_state(ProcessState::Ready);
                info!("Process {:?} ready on {}", process.pid, addr);
                Ok(process)
            }
            Err(reason) => {
                warn!("Process {:?} failed to become ready: {}", process.pid, reason);
                process.stop().await?;
                Err(RunnerError::launch(binary, reason))
            }
        }
    }

    async fn wait_ready(&self, process: &LaunchedProcess) -> Result<(), String> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if !process.is_running() {
                // Give the pumps a moment to drain whatever explains the exit.
                sleep(READY_POLL_INTERVAL).await;
                return Err(format!(
                    "process exited before accepting connections: {}",
                    process.stderr().trim()
                ));
            }

            if accepts_connections(process.addr).await {
                // A child that failed to bind exits shortly after; make sure
                // the one answering is still ours.
                sleep(READY_GRACE).await;
                if process.is_running() {
                    return Ok(());
                }
                continue;
            }

            if Instant::now() >= deadline {
                return Err(format!(
                    "not accepting connections on {} after {:?}",
                    process.addr, self.ready_timeout
                ));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

async fn accepts_connections(addr: SocketAddr) -> bool {
    matches!(
        timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Asks the OS for a free port by binding to port 0 and releasing it.
fn allocate_port(host: &str) -> std::io::Result<u16> {
    let listener = StdTcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("cannot resolve {}: {}", host, e))?
        .next()
        .ok_or_else(|| format!("{} resolved to no addresses", host))
}

/// Copies child output into `output` as it arrives, without decoding it.
fn pump<R>(reader: R, stream: Stream, output: Arc<CapturedOutput>, passthrough: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut echo: Option<Box<dyn AsyncWrite + Unpin + Send>> = match (passthrough, stream) {
            (false, _) => None,
            (true, Stream::Stdout) => Some(Box::new(tokio::io::stdout())),
            (true, Stream::Stderr) => Some(Box::new(tokio::io::stderr())),
        };
        let mut chunk = vec![0u8; PUMP_CHUNK];
        loop {
            let read = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    warn!("Stopped reading child {:?}: {}", stream, e);
                    break;
                }
            };
            let bytes = &chunk[..read];
            debug!(target: "parallel_runner::child", "{:?}: {}", stream, String::from_utf8_lossy(bytes));
            output.push(stream, bytes);

            let echoed = match echo.as_mut() {
                Some(writer) => match writer.write_all(bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                },
                None => Ok(()),
            };
            if let Err(e) = echoed {
                // Keep draining the pipe so the child never blocks on it.
                warn!("Stopped echoing child {:?}: {}", stream, e);
                echo = None;
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn launcher(args: &[&str], ready_timeout: Duration) -> Launcher {
        let config = Config::new("sh")
            .with_args(args.iter().copied())
            .with_ready_timeout(ready_timeout)
            .with_passthrough(false);
        Launcher::new(&config)
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_missing_binary_is_a_launch_failure() {
        let launcher = launcher(&["serve"], Duration::from_secs(1));
        let err = launcher
            .start(Path::new("/definitely/not/here/artisan"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::LaunchFailure { .. }), "got {:?}", err);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        // `sh -c <script> <argv0> --host .. --port ..`
        let launcher = launcher(&["-c", "echo boom >&2; exit 3", "app"], Duration::from_secs(2));
        let err = launcher.start(Path::new("sh"), None).await.unwrap_err();

        match err {
            RunnerError::LaunchFailure { reason, .. } => {
                assert!(reason.contains("exited"), "reason: {}", reason);
            }
            other => panic!("Expected LaunchFailure, got {:?}", other),
        }
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_readiness_timeout() {
        let launcher = launcher(&["-c", "sleep 5", "app"], Duration::from_millis(200));
        let started = Instant::now();
        let err = launcher.start(Path::new("sh"), None).await.unwrap_err();

        assert!(matches!(err, RunnerError::LaunchFailure { .. }));
        assert!(started.elapsed() < Duration::from_secs(3), "timed out too slowly");
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_occupied_port_is_a_launch_failure() {
        let foreign = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = foreign.local_addr().unwrap().port();

        let launcher = launcher(&["-c", "sleep 5", "app"], Duration::from_secs(2));
        let err = launcher.start(Path::new("sh"), Some(port)).await.unwrap_err();

        match err {
            RunnerError::LaunchFailure { reason, .. } => {
                assert!(reason.contains("already in use"), "reason: {}", reason);
            }
            other => panic!("Expected LaunchFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_captured_output_wait_for() {
        let output = Arc::new(CapturedOutput::default());
        let writer = output.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            writer.push(Stream::Stdout, b"echo foo\n");
        });

        assert!(output.wait_for("echo foo", Duration::from_secs(2)).await);
        assert!(!output.wait_for("never", Duration::from_millis(50)).await);
        assert_eq!(output.stdout(), "echo foo\n");
        assert_eq!(output.stderr(), "");
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_capture() {
        let raw: &'static [u8] = b"before\n\xff\xfe\nafter\n";
        let output = Arc::new(CapturedOutput::default());

        pump(raw, Stream::Stdout, output.clone(), false).await.unwrap();

        assert_eq!(output.stdout_bytes(), raw);
        assert!(output.wait_for("after", Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_output_is_kept_verbatim() {
        let raw: &'static [u8] = b"dump(foo)\r\nno newline";
        let output = Arc::new(CapturedOutput::default());

        pump(raw, Stream::Stderr, output.clone(), false).await.unwrap();

        assert_eq!(output.stderr_bytes(), raw);
        assert_eq!(output.stderr(), "dump(foo)\r\nno newline");
        assert!(output.stdout_bytes().is_empty());
    }

    #[test]
    fn test_allocate_port_returns_nonzero() {
        let port = allocate_port("127.0.0.1").unwrap();
        assert_ne!(port, 0);
    }
}
