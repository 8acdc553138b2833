use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AgentLauncher, LaunchRequest, TurnStream};
use crate::config::AgentConfig;
use crate::errors::RunnerError;
use crate::stream::{StreamEvent, parse_line};

/// Decoded events buffered between the stdout reader and the consumer.
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Only the tail of stderr is kept for error messages.
const STDERR_TAIL_BYTES: usize = 4096;

/// After a stop, lines already in the pipe are still delivered for this long.
const STOP_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for stderr once the agent itself has exited.
const STDERR_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Launches the agent CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: AgentConfig,
    working_dir: PathBuf,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, working_dir: PathBuf) -> Self {
        Self {
            config,
            working_dir,
        }
    }

    /// Spawn the agent with `prompt` as the final positional argument.
    pub async fn run(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<AgentSession, RunnerError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.flags())
            .arg(&request.prompt)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a stop also reaches anything the agent spawned.
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(
            command = %self.config.command,
            flags = ?self.config.flags(),
            prompt_chars = request.prompt.len(),
            "spawning agent"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RunnerError::BinaryNotFound {
                    binary: self.config.command.clone(),
                }
            } else {
                RunnerError::Spawn(e)
            }
        })?;
        tracing::debug!(pid = child.id().unwrap_or(0), "agent process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn(std::io::Error::other("stderr not captured")))?;

        let stop = cancel.child_token();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let reader = tokio::spawn(read_events(stdout, tx, stop.clone()));
        let stderr_task = tokio::spawn(read_stderr_tail(stderr));
        let pgid = child.id();
        let supervisor = tokio::spawn(supervise(
            child,
            pgid,
            stop.clone(),
            self.config.turn_timeout(),
        ));

        Ok(AgentSession {
            events: rx,
            stop,
            cancel,
            timeout: self.config.turn_timeout(),
            reader: Some(reader),
            stderr: Some(stderr_task),
            supervisor: Some(supervisor),
        })
    }
}

#[async_trait]
impl AgentLauncher for AgentRunner {
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TurnStream>, RunnerError> {
        let session = self.run(request, cancel).await?;
        Ok(Box::new(session))
    }
}

/// How the subprocess ended.
#[derive(Debug)]
enum Exit {
    Exited(ExitStatus),
    /// Killed through the session's stop token.
    Stopped,
    TimedOut,
}

/// A running agent subprocess.
///
/// Drain [`AgentSession::next_event`] until it returns `None`, then call
/// [`AgentSession::wait`]. Dropping the session kills the subprocess.
pub struct AgentSession {
    events: mpsc::Receiver<StreamEvent>,
    stop: CancellationToken,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    reader: Option<JoinHandle<Result<(), RunnerError>>>,
    stderr: Option<JoinHandle<String>>,
    supervisor: Option<JoinHandle<std::io::Result<Exit>>>,
}

impl AgentSession {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Kill the subprocess without treating it as a failure.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for the subprocess and classify how it ended.
    ///
    /// Explicit cancellation and deadlines take precedence over decode
    /// errors, which take precedence over the exit status.
    pub async fn wait(&mut self) -> Result<(), RunnerError> {
        // Unblock the reader if the consumer stopped draining early.
        self.events.close();

        let read_result = match self.reader.take() {
            Some(handle) => handle
                .await
                .map_err(|e| RunnerError::Io(std::io::Error::other(e)))?,
            None => Ok(()),
        };
        let exit = match self.supervisor.take() {
            Some(handle) => handle
                .await
                .map_err(|e| RunnerError::Io(std::io::Error::other(e)))?
                .map_err(RunnerError::Io)?,
            None => return read_result,
        };
        let stderr = match self.stderr.take() {
            Some(mut handle) => match tokio::time::timeout(STDERR_JOIN_GRACE, &mut handle).await {
                Ok(tail) => tail.unwrap_or_default(),
                Err(_) => {
                    tracing::debug!("agent stderr still open after exit, giving up on it");
                    handle.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        if self.cancel.is_cancelled() {
            return Err(RunnerError::Canceled);
        }
        if let Exit::TimedOut = exit {
            return Err(RunnerError::DeadlineExceeded {
                timeout: self.timeout.unwrap_or_default(),
            });
        }
        read_result?;

        match exit {
            Exit::Exited(status) if !status.success() => Err(RunnerError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl TurnStream for AgentSession {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        AgentSession::next_event(self).await
    }

    fn stop(&self) {
        AgentSession::stop(self);
    }

    async fn wait(&mut self) -> Result<(), RunnerError> {
        AgentSession::wait(self).await
    }
}

/// Decode stdout line by line. A malformed line ends the stream and stops
/// the subprocess; blank lines are skipped. Once `stop` fires, lines already
/// written are drained for [`STOP_DRAIN_GRACE`] and then the stream ends even
/// if something still holds the pipe open.
async fn read_events<R: AsyncRead + Unpin>(
    stdout: R,
    tx: mpsc::Sender<StreamEvent>,
    stop: CancellationToken,
) -> Result<(), RunnerError> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut drain_until: Option<Instant> = None;
    let mut consumer_gone = false;

    loop {
        // A canceled `read_until` keeps its partial bytes in `buf`, so the
        // next call picks up where it left off.
        let read = match drain_until {
            None => tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read,
                _ = stop.cancelled() => {
                    drain_until = Some(Instant::now() + STOP_DRAIN_GRACE);
                    continue;
                }
            },
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, reader.read_until(b'\n', &mut buf)).await {
                    Ok(read) => read,
                    Err(_) => return Ok(()),
                }
            }
        };
        let at_eof = match read {
            Ok(n) => n == 0,
            Err(e) => {
                stop.cancel();
                return Err(RunnerError::Io(e));
            }
        };

        if let Some(event) = decode_line(&buf).inspect_err(|_| stop.cancel())? {
            // Keep reading after the consumer leaves so the child never blocks on a full pipe.
            if !consumer_gone && tx.send(event).await.is_err() {
                consumer_gone = true;
            }
        }
        buf.clear();
        if at_eof {
            return Ok(());
        }
    }
}

/// Invalid UTF-8 is replaced rather than rejected; anything that still is
/// not JSON surfaces as a decode error.
fn decode_line(bytes: &[u8]) -> Result<Option<StreamEvent>, RunnerError> {
    let line = String::from_utf8_lossy(bytes);
    if line.trim().is_empty() {
        return Ok(None);
    }
    match parse_line(line.trim_end_matches(['\n', '\r'])) {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            tracing::warn!(error = %e, "malformed agent output, ending session stream");
            Err(e.into())
        }
    }
}

async fn read_stderr_tail<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "failed to read agent stderr");
    }
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

async fn supervise(
    mut child: Child,
    pgid: Option<u32>,
    stop: CancellationToken,
    timeout: Option<Duration>,
) -> std::io::Result<Exit> {
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => Ok(Exit::Exited(status?)),
        _ = stop.cancelled() => {
            kill_process_group(&mut child, pgid);
            child.wait().await?;
            Ok(Exit::Stopped)
        }
        _ = deadline => {
            tracing::warn!(?timeout, "agent turn deadline exceeded, killing process");
            // Unblocks the stdout reader if a descendant still holds the pipe.
            stop.cancel();
            kill_process_group(&mut child, pgid);
            child.wait().await?;
            Ok(Exit::TimedOut)
        }
    }
}

/// SIGKILL the agent's process group, falling back to the agent alone.
fn kill_process_group(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid.and_then(|p| libc::pid_t::try_from(p).ok()) {
            // SAFETY: killpg only sends a signal. The group was created for this
            // child by `process_group(0)` and is not reused while the child is unreaped.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc == 0 {
                return;
            }
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "killpg failed, killing agent process only"
            );
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "agent already exited before kill");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::EventKind;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the agent CLI.
    fn fake_agent(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn runner(dir: &TempDir, command: String) -> AgentRunner {
        let config = AgentConfig {
            command,
            ..AgentConfig::default()
        };
        AgentRunner::new(config, dir.path().to_path_buf())
    }

    async fn drain(session: &mut AgentSession) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streams_events_and_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(
            &dir,
            r#"echo '{"type":"system","subtype":"init","tools":["Read"]}'
echo ''
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","result":"hi","is_error":false}'"#,
        );
        let mut session = runner(&dir, script)
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut session).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].kind, EventKind::Init(_)));
        assert!(matches!(events[1].kind, EventKind::Message(_)));
        assert!(matches!(events[2].kind, EventKind::Result(_)));
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_is_final_argument_and_env_is_extended() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(
            &dir,
            r#"for last; do :; done
printf '{"type":"result","result":"%s:%s"}\n' "$last" "$PAIRLOOP_TEST_VAR""#,
        );
        let request = LaunchRequest {
            prompt: "do-the-thing".into(),
            env: vec![("PAIRLOOP_TEST_VAR".into(), "tagged".into())],
        };
        let mut session = runner(&dir, script)
            .run(request, CancellationToken::new())
            .await
            .unwrap();

        let events = drain(&mut session).await;
        match &events[0].kind {
            EventKind::Result(r) => assert_eq!(r.result.as_deref(), Some("do-the-thing:tagged")),
            other => panic!("Expected Result, got {:?}", other),
        }
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_distinct_error() {
        let dir = TempDir::new().unwrap();
        let err = runner(&dir, "/nonexistent/pairloop-agent".into())
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(&dir, "echo 'bad credentials' >&2\nexit 3");
        let mut session = runner(&dir, script)
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(drain(&mut session).await.is_empty());
        match session.wait().await {
            Err(RunnerError::NonZeroExit { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "bad credentials");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_line_ends_stream_with_decode_error() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"a"}]}}'
echo 'not json'
echo '{"type":"result"}'
exec sleep 30"#,
        );
        let mut session = runner(&dir, script)
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let events = drain(&mut session).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(session.wait().await, Err(RunnerError::Decode(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_is_distinguished() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(&dir, "exec sleep 30");
        let cancel = CancellationToken::new();
        let mut session = runner(&dir, script)
            .run(LaunchRequest::default(), cancel.clone())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        cancel.cancel();
        assert!(drain(&mut session).await.is_empty());
        let err = session.wait().await.unwrap_err();
        assert!(matches!(err, RunnerError::Canceled));
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// The agent forks a child that inherits its stdout and stderr.
    const FORKING_AGENT: &str = r#"echo '{"type":"system","subtype":"init","tools":["Read"]}'
sleep 20 &
wait"#;

    #[tokio::test]
    async fn test_cancel_ends_session_promptly_despite_background_child() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut session = runner(&dir, fake_agent(&dir, FORKING_AGENT))
            .run(LaunchRequest::default(), cancel.clone())
            .await
            .unwrap();
        let first = session.next_event().await.unwrap();
        assert!(matches!(first.kind, EventKind::Init(_)));

        let started = std::time::Instant::now();
        cancel.cancel();
        drain(&mut session).await;
        assert!(matches!(session.wait().await, Err(RunnerError::Canceled)));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_stop_ends_session_promptly_despite_background_child() {
        let dir = TempDir::new().unwrap();
        let mut session = runner(&dir, fake_agent(&dir, FORKING_AGENT))
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        session.next_event().await.unwrap();

        let started = std::time::Instant::now();
        session.stop();
        drain(&mut session).await;
        session.wait().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced_and_garbage_is_a_decode_error() {
        let input: &[u8] = b"{\"type\":\"result\",\"result\":\"caf\xff\"}\n\xff\xfe\n";
        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();

        let result = read_events(input, tx, stop.clone()).await;
        assert!(matches!(result, Err(RunnerError::Decode(_))));
        assert!(stop.is_cancelled());

        let event = rx.recv().await.unwrap();
        match event.kind {
            EventKind::Result(r) => assert_eq!(r.result.as_deref(), Some("caf\u{FFFD}")),
            other => panic!("Expected Result, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_final_line_without_newline_is_delivered() {
        let input: &[u8] = b"{\"type\":\"result\",\"result\":\"done\"}";
        let (tx, mut rx) = mpsc::channel(8);
        read_events(input, tx, CancellationToken::new()).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap().kind, EventKind::Result(_)));
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_events_and_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"a"}]}}'
exec sleep 30"#,
        );
        let mut session = runner(&dir, script)
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        let first = session.next_event().await.unwrap();
        assert!(matches!(first.kind, EventKind::Message(_)));
        session.stop();
        assert!(session.next_event().await.is_none());
        session.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let dir = TempDir::new().unwrap();
        let script = fake_agent(&dir, "exec sleep 30");
        let config = AgentConfig {
            command: script,
            turn_timeout_secs: Some(1),
            ..AgentConfig::default()
        };
        let mut session = AgentRunner::new(config, dir.path().to_path_buf())
            .run(LaunchRequest::default(), CancellationToken::new())
            .await
            .unwrap();
        assert!(drain(&mut session).await.is_empty());
        let err = session.wait().await.unwrap_err();
        assert!(matches!(err, RunnerError::DeadlineExceeded { .. }));
        assert!(err.is_cancellation());
    }
}
