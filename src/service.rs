//! Transport-agnostic façade over the registry, the policy checks and the
//! executor.
//!
//! Every request passes the same gate, in order: authenticate, ban check,
//! whitelist, rate limit, chaining-block. A failing stage short-circuits
//! with its [`Rejection`] before any session state is touched or any process
//! is spawned.

use crate::config::ServiceConfig;
use crate::error::{ExecError, Rejection, ServiceError};
use crate::executor::{CommandSpec, ExecOutcome, ExecStream, ProcessExecutor, StreamRecord};
use crate::policy::{contains_chaining, RateLimiter, TokenAuth, Whitelist};
use crate::state::{Session, SessionRegistry, SessionSummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Result of a batch `Execute`.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub session_id: String,
    pub output: String,
    /// Set on timeout; a non-zero exit alone is not an error.
    pub error: Option<String>,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub message: String,
    pub re_registered: bool,
}

/// A streamed execution already past the gate.
#[derive(Debug)]
pub struct StreamingExecution {
    pub records: mpsc::Receiver<StreamRecord>,
}

pub struct ExecutionService {
    config: ServiceConfig,
    auth: TokenAuth,
    whitelist: Whitelist,
    rate: RateLimiter,
    registry: Arc<SessionRegistry>,
    executor: ProcessExecutor,
}

impl ExecutionService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_registry(config, SessionRegistry::with_current_dir())
    }

    pub fn with_registry(config: ServiceConfig, registry: SessionRegistry) -> Self {
        Self {
            auth: TokenAuth::new(config.auth_token.clone()),
            whitelist: Whitelist::new(&config.whitelist),
            rate: RateLimiter::new(config.rate_limit, config.rate_window),
            executor: ProcessExecutor::new(&config),
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn authenticate(&self, token: &str) -> Result<(), Rejection> {
        if self.auth.validate(token) {
            Ok(())
        } else {
            Err(Rejection::Unauthorized)
        }
    }

    /// Runs the gate for a session-scoped call. `command` is `None` for calls
    /// that don't run anything, which skips the whitelist and chaining stages.
    async fn gate(&self, id: &str, token: &str, command: Option<&str>) -> Result<(), Rejection> {
        let verdict = self.check(id, token, command).await;
        if let Err(rejection) = &verdict {
            warn!(session = %id, reason = rejection.reason(), "Request rejected");
        }
        verdict
    }

    async fn check(&self, id: &str, token: &str, command: Option<&str>) -> Result<(), Rejection> {
        self.authenticate(token)?;
        if id.is_empty() {
            return Err(Rejection::InvalidArgument("session id required".into()));
        }
        if self.registry.is_banned(id).await {
            return Err(Rejection::Banned);
        }
        if let Some(command) = command {
            if !self.whitelist.is_allowed(command).await {
                return Err(Rejection::CommandNotAllowed);
            }
        }
        if !self.rate.allow(id).await {
            return Err(Rejection::RateLimited);
        }
        if let Some(command) = command {
            if self.config.block_chaining && contains_chaining(command) {
                return Err(Rejection::ChainingBlocked);
            }
        }
        Ok(())
    }

    /// Single auto-registration path shared by every session-scoped call.
    async fn resolve(&self, id: &str, client_addr: &str, via: &str) -> Result<Session, Rejection> {
        let resolved = self.registry.get_or_create(id, client_addr).await?;
        if resolved.created {
            info!(session = %id, client = %client_addr, "Auto-registered on {}", via);
        }
        Ok(resolved.session)
    }

    /// Creates the session or refreshes an existing one.
    pub async fn register(
        &self,
        id: &str,
        token: &str,
        client_addr: &str,
    ) -> Result<RegisterOutcome, Rejection> {
        self.gate(id, token, None).await?;
        let resolved = self.registry.get_or_create(id, client_addr).await?;
        if resolved.created {
            info!(session = %id, client = %client_addr, "Registered (new session)");
            Ok(RegisterOutcome {
                message: format!("Client {id} registered successfully"),
                re_registered: false,
            })
        } else {
            self.registry.touch(id).await;
            info!(session = %id, "Re-registered (existing session)");
            Ok(RegisterOutcome {
                message: format!("Client {id} re-registered"),
                re_registered: true,
            })
        }
    }

    /// Keepalive. Never creates a session and does not count against the
    /// rate limit.
    pub async fn heartbeat(&self, id: &str, token: &str) -> Result<(), Rejection> {
        self.authenticate(token)?;
        if self.registry.is_banned(id).await {
            return Err(Rejection::Banned);
        }
        if self.registry.touch(id).await {
            Ok(())
        } else {
            Err(Rejection::NotRegistered)
        }
    }

    pub async fn execute(
        &self,
        id: &str,
        token: &str,
        command: &str,
        client_addr: &str,
    ) -> Result<ExecuteOutcome, ServiceError> {
        self.gate(id, token, Some(command)).await?;
        let session = self.resolve(id, client_addr, "first command").await?;

        let spec = CommandSpec::for_session(&session, command);
        let result = self.executor.run_batch(&spec).await?;
        self.registry.touch(id).await;

        let exit_code = result.outcome.exit_code();
        let error = match result.outcome {
            ExecOutcome::TimedOut => {
                warn!(session = %id, command = %command, "Command timeout");
                Some(format!(
                    "command execution timeout ({}s)",
                    self.executor.max_runtime().as_secs()
                ))
            }
            ExecOutcome::Exited { .. } => {
                info!(session = %id, command = %command, exit = exit_code, "Executed");
                None
            }
        };

        Ok(ExecuteOutcome {
            session_id: id.to_string(),
            output: String::from_utf8_lossy(&result.output).into_owned(),
            error,
            exit_code,
            elapsed: result.elapsed,
            timed_out: result.outcome.timed_out(),
        })
    }

    /// Starts a streamed execution. Last-active is refreshed once the
    /// terminal record has been produced.
    pub async fn execute_stream(
        &self,
        id: &str,
        token: &str,
        command: &str,
        client_addr: &str,
    ) -> Result<StreamingExecution, ServiceError> {
        self.gate(id, token, Some(command)).await?;
        let session = self.resolve(id, client_addr, "stream command").await?;

        let spec = CommandSpec::for_session(&session, command);
        let ExecStream { records, done } = self.executor.run_streaming(&spec)?;

        let registry = Arc::clone(&self.registry);
        let session_id = id.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            match done.await {
                Ok(outcome) => {
                    info!(session = %session_id, command = %command, exit = outcome.exit_code(),
                          timed_out = outcome.timed_out(), "Stream finished");
                }
                Err(e) => warn!(session = %session_id, error = %e, "Stream supervisor failed"),
            }
            registry.touch(&session_id).await;
        });

        Ok(StreamingExecution {
            records,
        })
    }

    /// Opens a fresh session for an interactive shell.
    ///
    /// Refused unless `allow_interactive` is set. A raw shell can't honour a
    /// verb whitelist either, so it stays refused while one is in force.
    pub async fn open_interactive(&self, token: &str, client_addr: &str) -> Result<Session, Rejection> {
        self.authenticate(token)?;
        if !self.config.allow_interactive || !self.whitelist.is_empty().await {
            warn!(client = %client_addr, "Interactive shell refused by command policy");
            return Err(Rejection::CommandNotAllowed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let session = self.resolve(&id, client_addr, "interactive shell").await?;
        Ok(session)
    }

    /// Runs the host shell for `session` until it exits, then drops the
    /// session.
    pub async fn run_interactive<I, O, E>(
        &self,
        session: &Session,
        input: I,
        stdout_sink: O,
        stderr_sink: E,
    ) -> Result<ExecOutcome, ExecError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let spec = CommandSpec::for_session(session, "");
        let result = self
            .executor
            .run_interactive(&spec, input, stdout_sink, stderr_sink)
            .await;
        if self.registry.remove(&session.id).await.is_some() {
            info!(session = %session.id, "Interactive session closed");
        }
        result
    }

    pub async fn set_env(
        &self,
        id: &str,
        token: &str,
        key: &str,
        value: &str,
        client_addr: &str,
    ) -> Result<String, Rejection> {
        self.gate(id, token, None).await?;
        if key.is_empty() || value.is_empty() {
            return Err(Rejection::InvalidArgument("key and value required".into()));
        }
        self.resolve(id, client_addr, "SetEnv").await?;

        self.registry
            .update(id, |s| s.env.insert(key.to_string(), value.to_string()))
            .await
            .ok_or_else(|| Rejection::NotFound(format!("session {id}")))?;
        info!(session = %id, key = %key, "Environment updated");
        Ok(format!("Set {key}={value} for client {id}"))
    }

    /// Changes the session's working directory. The target must exist (and
    /// be a directory) at the time of the call; otherwise the old workdir is
    /// kept.
    pub async fn change_dir(
        &self,
        id: &str,
        token: &str,
        dir: &str,
        client_addr: &str,
    ) -> Result<String, Rejection> {
        self.gate(id, token, None).await?;
        if dir.is_empty() {
            return Err(Rejection::InvalidArgument("dir required".into()));
        }
        let session = self.resolve(id, client_addr, "ChangeDir").await?;

        let target = resolve_dir(&session.work_dir, dir)
            .await
            .ok_or_else(|| Rejection::NotFound(format!("directory {dir} does not exist")))?;

        let shown = target.display().to_string();
        self.registry
            .update(id, |s| s.work_dir = target)
            .await
            .ok_or_else(|| Rejection::NotFound(format!("session {id}")))?;
        info!(session = %id, dir = %shown, "Changed directory");
        Ok(format!("Changed directory to {shown} for client {id}"))
    }

    pub async fn session_info(&self, id: &str, token: &str) -> Result<SessionSummary, Rejection> {
        self.authenticate(token)?;
        self.registry
            .get(id)
            .await
            .map(|s| s.summary(self.config.session_timeout))
            .ok_or_else(|| Rejection::NotFound(format!("session {id}")))
    }

    pub async fn list_clients(&self, token: &str) -> Result<Vec<String>, Rejection> {
        self.authenticate(token)?;
        Ok(self.registry.ids().await)
    }

    pub async fn list_sessions(&self, token: &str) -> Result<Vec<SessionSummary>, Rejection> {
        self.authenticate(token)?;
        let timeout = self.config.session_timeout;
        Ok(self
            .registry
            .list()
            .await
            .iter()
            .map(|s| s.summary(timeout))
            .collect())
    }

    /// Removes the session and bans its id for the life of the process.
    pub async fn kill_session(&self, id: &str, token: &str) -> Result<String, Rejection> {
        self.authenticate(token)?;
        if !self.registry.kill(id).await {
            return Err(Rejection::NotFound(format!("session {id}")));
        }
        info!(session = %id, "Killed and banned session");
        Ok("killed and banned".to_string())
    }

    pub async fn add_to_whitelist(
        &self,
        token: &str,
        commands: &[String],
    ) -> Result<Vec<String>, Rejection> {
        self.authenticate(token)?;
        Ok(self.whitelist.add_verbs(commands).await)
    }

    /// One cleanup pass: evicts idle sessions and stale rate windows.
    pub async fn sweep(&self) -> usize {
        let evicted = self.registry.evict_idle(self.config.session_timeout).await;
        self.rate.prune().await;
        evicted.len()
    }
}

/// Resolves `dir` against `base` and returns the canonical directory path,
/// or `None` if it does not exist or is not a directory.
async fn resolve_dir(base: &Path, dir: &str) -> Option<PathBuf> {
    let candidate = base.join(dir);
    let canonical = tokio::fs::canonicalize(&candidate).await.ok()?;
    let meta = tokio::fs::metadata(&canonical).await.ok()?;
    meta.is_dir().then_some(canonical)
}
