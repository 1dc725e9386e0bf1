//! Host process execution bound to a session's environment and working
//! directory.
//!
//! Three modes share one spawn path:
//! - batch: combined stdout+stderr collected up to a byte cap
//! - streaming: two readers feed one bounded channel, closed by a single
//!   terminal record
//! - interactive: stdin/stdout/stderr wired straight to caller-supplied
//!   streams until the process exits

use crate::config::ServiceConfig;
use crate::error::ExecError;
use crate::state::Session;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest single output record; longer lines are split.
const MAX_RECORD_BYTES: usize = 8 * 1024;

/// How long readers may keep draining after the process was killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// What to run and where.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command_line: String,
    pub env: HashMap<String, String>,
    pub work_dir: PathBuf,
}

impl CommandSpec {
    pub fn for_session(session: &Session, command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            env: session.env.clone(),
            work_dir: session.work_dir.clone(),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Ran to completion. Non-zero codes are ordinary results; a process
    /// killed by a signal reports -1.
    Exited { code: i32 },
    /// Exceeded the runtime deadline and was terminated.
    TimedOut,
}

impl ExecOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::TimedOut => -1,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    fn from_status(status: &ExitStatus) -> Self {
        Self::Exited {
            code: status.code().unwrap_or(-1),
        }
    }
}

/// One record on a streamed execution's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Output { data: Vec<u8>, is_stderr: bool },
    /// Always the last record; the channel closes right after it.
    Exit(ExecOutcome),
}

impl StreamRecord {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Exit(_))
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub outcome: ExecOutcome,
    pub output: Vec<u8>,
    pub truncated: bool,
    pub elapsed: Duration,
}

/// Handle to a streamed execution.
#[derive(Debug)]
pub struct ExecStream {
    pub records: mpsc::Receiver<StreamRecord>,
    /// Resolves once both readers are joined and the terminal record is sent.
    pub done: JoinHandle<ExecOutcome>,
}

/// Spawns host-shell processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: Vec<String>,
    max_runtime: Duration,
    max_output: usize,
    stream_buffer: usize,
}

impl ProcessExecutor {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            max_runtime: config.effective_max_runtime(),
            max_output: config.max_output,
            stream_buffer: config.stream_buffer.max(1),
        }
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    fn command(&self, spec: &CommandSpec, interactive: bool) -> Command {
        let (program, prefix) = match self.shell.split_first() {
            Some((program, prefix)) => (program.as_str(), prefix),
            None => ("sh", &[][..]),
        };
        let mut cmd = Command::new(program);
        // A bare shell reads its commands from the piped stdin.
        if !interactive || !spec.command_line.trim().is_empty() {
            cmd.args(prefix).arg(&spec.command_line);
        }
        cmd.current_dir(&spec.work_dir)
            .envs(&spec.env)
            .stdin(if interactive { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn(&self, spec: &CommandSpec, interactive: bool) -> Result<Child, ExecError> {
        let child = self
            .command(spec, interactive)
            .spawn()
            .map_err(ExecError::Spawn)?;
        debug!(pid = ?child.id(), command = %spec.command_line, "Process spawned");
        Ok(child)
    }

    /// Runs to completion (or deadline) and returns the combined output.
    /// Output beyond the byte cap is dropped, but the pipes keep draining so
    /// the process never blocks on a full pipe.
    pub async fn run_batch(&self, spec: &CommandSpec) -> Result<BatchResult, ExecError> {
        let started = Instant::now();
        let mut stream = self.run_streaming(spec)?;

        let mut output = Vec::new();
        let mut truncated = false;
        let mut outcome = None;
        while let Some(record) = stream.records.recv().await {
            match record {
                StreamRecord::Output { data, .. } => {
                    let room = if self.max_output == 0 {
                        data.len()
                    } else {
                        self.max_output.saturating_sub(output.len())
                    };
                    if data.len() > room {
                        truncated = true;
                    }
                    output.extend_from_slice(&data[..data.len().min(room)]);
                }
                StreamRecord::Exit(o) => outcome = Some(o),
            }
        }
        let joined = stream
            .done
            .await
            .map_err(|e| ExecError::Join(e.to_string()))?;

        Ok(BatchResult {
            outcome: outcome.unwrap_or(joined),
            output,
            truncated,
            elapsed: started.elapsed(),
        })
    }

    /// Spawns the process and returns its record channel. Spawn failures are
    /// reported here, before any record is produced.
    pub fn run_streaming(&self, spec: &CommandSpec) -> Result<ExecStream, ExecError> {
        let mut child = self.spawn(spec, false)?;
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let readers = [
            tokio::spawn(pump(stdout, false, tx.clone())),
            tokio::spawn(pump(stderr, true, tx.clone())),
        ];
        let done = tokio::spawn(supervise(child, self.max_runtime, tx, readers));

        Ok(ExecStream { records: rx, done })
    }

    /// Full-duplex passthrough. Returns when the process exits; no deadline
    /// applies. Closing `input` sends EOF to the process.
    pub async fn run_interactive<I, O, E>(
        &self,
        spec: &CommandSpec,
        mut input: I,
        mut stdout_sink: O,
        mut stderr_sink: E,
    ) -> Result<ExecOutcome, ExecError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mut child = self.spawn(spec, true)?;
        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let feeder = tokio::spawn(async move {
            if let Some(stdin) = stdin.as_mut() {
                if let Err(e) = tokio::io::copy(&mut input, stdin).await {
                    debug!(error = %e, "Interactive input closed");
                }
                let _ = stdin.shutdown().await;
            }
        });
        let out = tokio::spawn(async move {
            if let Some(mut stdout) = stdout {
                tokio::io::copy(&mut stdout, &mut stdout_sink).await?;
                stdout_sink.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        });
        let err = tokio::spawn(async move {
            if let Some(mut stderr) = stderr {
                tokio::io::copy(&mut stderr, &mut stderr_sink).await?;
                stderr_sink.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let status = child.wait().await;
        // The input source may never end on its own.
        feeder.abort();
        for copier in [out, err] {
            match copier.await {
                Ok(Err(e)) => debug!(error = %e, "Interactive output sink closed"),
                Err(e) if !e.is_cancelled() => warn!(error = %e, "Interactive copier failed"),
                _ => {}
            }
        }
        let outcome = ExecOutcome::from_status(&status?);
        info!(code = outcome.exit_code(), "Interactive process exited");
        Ok(outcome)
    }
}

/// Reads newline-delimited records (capped at [`MAX_RECORD_BYTES`]) and
/// forwards them until EOF or until the consumer goes away.
async fn pump<R>(reader: Option<R>, is_stderr: bool, tx: mpsc::Sender<StreamRecord>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    loop {
        match next_record(&mut reader).await {
            Ok(data) if data.is_empty() => return,
            Ok(data) => {
                if tx.send(StreamRecord::Output { data, is_stderr }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, is_stderr, "Output reader stopped");
                return;
            }
        }
    }
}

async fn next_record<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut record = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(record);
        }
        let room = MAX_RECORD_BYTES - record.len();
        let window = &buf[..buf.len().min(room)];
        let (take, line_end) = match window.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), false),
        };
        record.extend_from_slice(&window[..take]);
        reader.consume(take);
        if line_end || record.len() >= MAX_RECORD_BYTES {
            return Ok(record);
        }
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Abandoned,
}

/// Owns the child: waits for exit, deadline or consumer loss, joins both
/// readers, then emits the single terminal record.
async fn supervise(
    mut child: Child,
    max_runtime: Duration,
    tx: mpsc::Sender<StreamRecord>,
    readers: [JoinHandle<()>; 2],
) -> ExecOutcome {
    // `Child::id` is gone once the child is reaped; the group may outlive it.
    let pid = child.id();
    let deadline = Instant::now() + max_runtime;

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Waited::Deadline,
        _ = tx.closed() => Waited::Abandoned,
    };

    let (outcome, drain_until) = match waited {
        Waited::Exited(Ok(status)) => (ExecOutcome::from_status(&status), deadline),
        Waited::Exited(Err(e)) => {
            warn!(error = %e, "Waiting on process failed");
            terminate(&mut child, pid).await;
            (ExecOutcome::Exited { code: -1 }, Instant::now() + KILL_GRACE)
        }
        Waited::Deadline => {
            warn!(limit_secs = max_runtime.as_secs(), "Command execution timeout");
            terminate(&mut child, pid).await;
            (ExecOutcome::TimedOut, Instant::now() + KILL_GRACE)
        }
        Waited::Abandoned => {
            debug!("Stream consumer gone, terminating process");
            terminate(&mut child, pid).await;
            (ExecOutcome::Exited { code: -1 }, Instant::now() + KILL_GRACE)
        }
    };

    // Background grandchildren can hold the pipes open past the shell's exit.
    let [out, err] = readers;
    let out_abort = out.abort_handle();
    let err_abort = err.abort_handle();
    let joined = tokio::time::timeout_at(drain_until, async {
        let _ = out.await;
        let _ = err.await;
    })
    .await;
    let outcome = if joined.is_err() {
        kill_group(pid);
        out_abort.abort();
        err_abort.abort();
        ExecOutcome::TimedOut
    } else {
        outcome
    };

    let _ = tx.send(StreamRecord::Exit(outcome)).await;
    outcome
}

/// Kills the whole process group (so shell grandchildren go too) and reaps.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(max_runtime: Duration, max_output: usize) -> ProcessExecutor {
        ProcessExecutor::new(&ServiceConfig {
            max_runtime,
            max_output,
            ..ServiceConfig::default()
        })
    }

    fn spec(command_line: &str) -> CommandSpec {
        CommandSpec {
            command_line: command_line.to_string(),
            env: HashMap::new(),
            work_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn batch_collects_combined_output() {
        let exec = executor(Duration::from_secs(10), 0);
        let result = exec.run_batch(&spec("echo out; echo err 1>&2")).await.unwrap();
        assert_eq!(result.outcome, ExecOutcome::Exited { code: 0 });
        let text = String::from_utf8(result.output).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let exec = executor(Duration::from_secs(10), 0);
        let result = exec.run_batch(&spec("exit 3")).await.unwrap();
        assert_eq!(result.outcome.exit_code(), 3);
        assert!(!result.outcome.timed_out());
    }

    #[tokio::test]
    async fn batch_honours_env_and_workdir() {
        let exec = executor(Duration::from_secs(10), 0);
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("echo \"$GREETING\"; pwd");
        s.env.insert("GREETING".into(), "hello".into());
        s.work_dir = dir.path().canonicalize().unwrap();
        let result = exec.run_batch(&s).await.unwrap();
        let text = String::from_utf8(result.output).unwrap();
        assert!(text.starts_with("hello\n"));
        assert!(text.contains(&s.work_dir.display().to_string()));
    }

    #[tokio::test]
    async fn batch_output_is_truncated_at_cap() {
        let exec = executor(Duration::from_secs(10), 10);
        let result = exec
            .run_batch(&spec("printf '0123456789abcdefghij'"))
            .await
            .unwrap();
        assert_eq!(result.output, b"0123456789");
        assert!(result.truncated);
        assert_eq!(result.outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn batch_timeout_is_distinct_outcome() {
        let exec = executor(Duration::from_millis(200), 0);
        let started = std::time::Instant::now();
        let result = exec.run_batch(&spec("echo partial; sleep 30")).await.unwrap();
        assert_eq!(result.outcome, ExecOutcome::TimedOut);
        assert_eq!(result.outcome.exit_code(), -1);
        assert_eq!(result.output, b"partial\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_immediately() {
        let exec = executor(Duration::from_secs(10), 0);
        let mut s = spec("true");
        s.work_dir = PathBuf::from("/definitely/not/here");
        assert!(matches!(exec.run_streaming(&s), Err(ExecError::Spawn(_))));
    }

    #[tokio::test]
    async fn stream_yields_records_then_one_sentinel() {
        let exec = executor(Duration::from_secs(10), 0);
        let mut stream = exec.run_streaming(&spec("printf 'a\\nb\\n'")).unwrap();
        let mut records = Vec::new();
        while let Some(r) = stream.records.recv().await {
            records.push(r);
        }
        assert_eq!(
            records,
            vec![
                StreamRecord::Output { data: b"a\n".to_vec(), is_stderr: false },
                StreamRecord::Output { data: b"b\n".to_vec(), is_stderr: false },
                StreamRecord::Exit(ExecOutcome::Exited { code: 0 }),
            ]
        );
        assert_eq!(stream.done.await.unwrap(), ExecOutcome::Exited { code: 0 });
    }

    #[tokio::test]
    async fn stream_tags_stderr_and_exit_code() {
        let exec = executor(Duration::from_secs(10), 0);
        let mut stream = exec.run_streaming(&spec("echo oops 1>&2; exit 7")).unwrap();
        let mut records = Vec::new();
        while let Some(r) = stream.records.recv().await {
            records.push(r);
        }
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            StreamRecord::Output { data: b"oops\n".to_vec(), is_stderr: true }
        );
        assert_eq!(records[1], StreamRecord::Exit(ExecOutcome::Exited { code: 7 }));
    }

    #[tokio::test]
    async fn stream_timeout_ends_with_single_sentinel() {
        let exec = executor(Duration::from_millis(200), 0);
        let mut stream = exec.run_streaming(&spec("sleep 30")).unwrap();
        let mut eofs = 0;
        let mut last = None;
        while let Some(r) = stream.records.recv().await {
            if r.is_eof() {
                eofs += 1;
            }
            last = Some(r);
        }
        assert_eq!(eofs, 1);
        assert_eq!(last, Some(StreamRecord::Exit(ExecOutcome::TimedOut)));
    }

    #[tokio::test]
    async fn dropping_consumer_stops_process() {
        let exec = executor(Duration::from_secs(30), 0);
        let stream = exec.run_streaming(&spec("yes")).unwrap();
        drop(stream.records);
        let outcome = tokio::time::timeout(Duration::from_secs(10), stream.done)
            .await
            .expect("supervisor should finish")
            .unwrap();
        assert!(!outcome.timed_out());
    }

    #[tokio::test]
    async fn long_lines_are_split() {
        let exec = executor(Duration::from_secs(10), 0);
        let mut stream = exec
            .run_streaming(&spec("head -c 20000 /dev/zero | tr '\\0' x"))
            .unwrap();
        let mut total = 0;
        while let Some(r) = stream.records.recv().await {
            if let StreamRecord::Output { data, .. } = r {
                assert!(data.len() <= MAX_RECORD_BYTES);
                total += data.len();
            }
        }
        assert_eq!(total, 20000);
    }

    #[tokio::test]
    async fn interactive_passthrough() {
        let exec = executor(Duration::from_secs(10), 0);
        let (mut client_in, server_in) = tokio::io::duplex(1024);
        let (server_out, mut client_out) = tokio::io::duplex(1024);
        let (server_err, mut client_err) = tokio::io::duplex(1024);

        client_in
            .write_all(b"echo hi\necho bad 1>&2\nexit 4\n")
            .await
            .unwrap();
        let outcome = exec
            .run_interactive(&spec(""), server_in, server_out, server_err)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Exited { code: 4 });

        use tokio::io::AsyncReadExt;
        let mut out = String::new();
        client_out.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        client_err.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "hi\n");
        assert_eq!(err, "bad\n");
    }

    #[tokio::test]
    async fn interactive_ends_on_input_eof() {
        let exec = executor(Duration::from_secs(10), 0);
        let (client_in, server_in) = tokio::io::duplex(64);
        drop(client_in);
        let outcome = exec
            .run_interactive(&spec(""), server_in, tokio::io::sink(), tokio::io::sink())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code(), 0);
    }
}
