//! gRPC server implementation using Tonic.

use crate::error::{Rejection, ServiceError};
use crate::executor::{ExecOutcome, StreamRecord};
use crate::state::{AppState, SessionSummary};
use futures_util::{stream, Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

// Import generated protobuf types
pub mod proto {
    tonic::include_proto!("remoteshell");
}

use proto::shell_service_server::{ShellService, ShellServiceServer};
use proto::{
    AdminRequest, ChangeDirRequest, ClientList, ExecuteReply, ExecuteRequest, OutputChunk,
    SessionInfoReply, SessionList, SessionRequest, SetEnvRequest, ShellInput, ShellOutput,
    StatusReply, WhitelistReply, WhitelistRequest,
};

/// Pipe capacity between the RPC stream and the interactive process.
const INTERACTIVE_PIPE_BYTES: usize = 64 * 1024;

type RpcStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// gRPC service implementation.
pub struct ShellServiceImpl {
    state: AppState,
}

impl ShellServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

fn client_addr<T>(request: &Request<T>) -> String {
    request
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn ok_reply(message: String) -> StatusReply {
    StatusReply {
        ok: true,
        message,
        rejection: String::new(),
    }
}

fn rejected_reply(rejection: &Rejection) -> StatusReply {
    StatusReply {
        ok: false,
        message: format!("Error: {rejection}"),
        rejection: rejection.reason().to_string(),
    }
}

fn status_reply(result: Result<String, Rejection>) -> StatusReply {
    match result {
        Ok(message) => ok_reply(message),
        Err(r) => rejected_reply(&r),
    }
}

/// Admin listings answer a bad token with a transport-level error.
fn admin_status(rejection: Rejection) -> Status {
    Status::from(ServiceError::Rejected(rejection))
}

impl From<SessionSummary> for proto::SessionSummary {
    fn from(s: SessionSummary) -> Self {
        Self {
            session_id: s.id,
            client_address: s.client_addr,
            work_dir: s.work_dir,
            env_count: s.env_count as u32,
            created_at: s.created_at,
            last_active: s.last_active,
            age_secs: s.age_secs,
            idle_secs: s.idle_secs,
            is_active: s.is_active,
        }
    }
}

fn rejected_chunk(rejection: &Rejection) -> OutputChunk {
    OutputChunk {
        data: Vec::new(),
        is_stderr: true,
        is_eof: true,
        exit_code: -1,
        rejection: rejection.reason().to_string(),
    }
}

/// Maps one executor record onto wire chunks. A timed-out run gets a stderr
/// notice ahead of its terminal chunk.
fn output_chunks(record: StreamRecord) -> Vec<OutputChunk> {
    match record {
        StreamRecord::Output { data, is_stderr } => vec![OutputChunk {
            data,
            is_stderr,
            ..Default::default()
        }],
        StreamRecord::Exit(outcome) => {
            let mut chunks = Vec::with_capacity(2);
            if outcome == ExecOutcome::TimedOut {
                chunks.push(OutputChunk {
                    data: b"command execution timeout\n".to_vec(),
                    is_stderr: true,
                    ..Default::default()
                });
            }
            chunks.push(OutputChunk {
                is_eof: true,
                exit_code: outcome.exit_code(),
                ..Default::default()
            });
            chunks
        }
    }
}

#[tonic::async_trait]
impl ShellService for ShellServiceImpl {
    type ExecuteStreamStream = RpcStream<OutputChunk>;
    type InteractiveShellStream = RpcStream<ShellOutput>;

    async fn register(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let addr = client_addr(&request);
        let req = request.into_inner();
        info!("gRPC Register: session={}", req.session_id);

        let reply = match self.state.service.register(&req.session_id, &req.token, &addr).await {
            Ok(outcome) => ok_reply(outcome.message),
            Err(r) => rejected_reply(&r),
        };
        Ok(Response::new(reply))
    }

    async fn heartbeat(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let req = request.into_inner();
        debug!("gRPC Heartbeat: session={}", req.session_id);

        let result = self
            .state
            .service
            .heartbeat(&req.session_id, &req.token)
            .await
            .map(|()| "OK".to_string());
        Ok(Response::new(status_reply(result)))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteReply>, Status> {
        let addr = client_addr(&request);
        let req = request.into_inner();
        info!("gRPC Execute: session={}, command={:?}", req.session_id, req.command);

        let result = self
            .state
            .service
            .execute(&req.session_id, &req.token, &req.command, &addr)
            .await;

        match result {
            Ok(out) => Ok(Response::new(ExecuteReply {
                output: out.output,
                error: out.error.unwrap_or_default(),
                exit_code: out.exit_code,
                session_id: out.session_id,
                execution_time_ms: out.elapsed.as_millis() as i64,
                timed_out: out.timed_out,
                rejection: String::new(),
            })),
            Err(ServiceError::Rejected(r)) => Ok(Response::new(ExecuteReply {
                error: r.to_string(),
                exit_code: -1,
                session_id: req.session_id,
                rejection: r.reason().to_string(),
                ..Default::default()
            })),
            Err(e @ ServiceError::Exec(_)) => Err(e.into()),
        }
    }

    async fn execute_stream(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStreamStream>, Status> {
        let addr = client_addr(&request);
        let req = request.into_inner();
        info!("gRPC ExecuteStream: session={}, command={:?}", req.session_id, req.command);

        let result = self
            .state
            .service
            .execute_stream(&req.session_id, &req.token, &req.command, &addr)
            .await;

        let stream: Self::ExecuteStreamStream = match result {
            Ok(exec) => Box::pin(
                ReceiverStream::new(exec.records)
                    .flat_map(|record| stream::iter(output_chunks(record)))
                    .map(Ok::<_, Status>),
            ),
            Err(ServiceError::Rejected(r)) => {
                Box::pin(stream::once(async move { Ok::<_, Status>(rejected_chunk(&r)) }))
            }
            Err(e @ ServiceError::Exec(_)) => return Err(e.into()),
        };
        Ok(Response::new(stream))
    }

    async fn interactive_shell(
        &self,
        request: Request<Streaming<ShellInput>>,
    ) -> Result<Response<Self::InteractiveShellStream>, Status> {
        let addr = client_addr(&request);
        let mut inbound = request.into_inner();
        let first = inbound.message().await?.unwrap_or_default();
        info!("gRPC InteractiveShell: client={}", addr);

        let session = match self.state.service.open_interactive(&first.token, &addr).await {
            Ok(session) => session,
            Err(r) => {
                let reply = ShellOutput {
                    is_stderr: true,
                    is_eof: true,
                    exit_code: -1,
                    rejection: r.reason().to_string(),
                    ..Default::default()
                };
                let single: Self::InteractiveShellStream =
                    Box::pin(stream::once(async move { Ok::<_, Status>(reply) }));
                return Ok(Response::new(single));
            }
        };

        let (tx, rx) = mpsc::channel(self.state.service.config().stream_buffer.max(1));
        let (mut input_writer, input_reader) = tokio::io::duplex(INTERACTIVE_PIPE_BYTES);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(INTERACTIVE_PIPE_BYTES);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(INTERACTIVE_PIPE_BYTES);

        // client -> process stdin; dropping the writer is the process's EOF
        tokio::spawn(async move {
            let mut next = Some(first);
            loop {
                let msg = match next.take() {
                    Some(msg) => msg,
                    None => match inbound.message().await {
                        Ok(Some(msg)) => msg,
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Interactive input stream failed: {}", e);
                            break;
                        }
                    },
                };
                if !msg.input.is_empty() && input_writer.write_all(&msg.input).await.is_err() {
                    break;
                }
                if msg.is_eof {
                    break;
                }
            }
        });

        let session_id = session.id.clone();
        let forwarders = [
            tokio::spawn(forward_output(stdout_reader, false, session_id.clone(), tx.clone())),
            tokio::spawn(forward_output(stderr_reader, true, session_id.clone(), tx.clone())),
        ];

        let service = self.state.service.clone();
        tokio::spawn(async move {
            let result = service
                .run_interactive(&session, input_reader, stdout_writer, stderr_writer)
                .await;
            for f in forwarders {
                let _ = f.await;
            }
            let last = match result {
                Ok(outcome) => Ok(ShellOutput {
                    session_id,
                    is_eof: true,
                    exit_code: outcome.exit_code(),
                    ..Default::default()
                }),
                Err(e) => {
                    warn!("Interactive shell failed: {}", e);
                    Err(Status::internal(e.to_string()))
                }
            };
            let _ = tx.send(last).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn set_env(
        &self,
        request: Request<SetEnvRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let addr = client_addr(&request);
        let req = request.into_inner();
        info!("gRPC SetEnv: session={}, key={}", req.session_id, req.key);

        let result = self
            .state
            .service
            .set_env(&req.session_id, &req.token, &req.key, &req.value, &addr)
            .await;
        Ok(Response::new(status_reply(result)))
    }

    async fn change_dir(
        &self,
        request: Request<ChangeDirRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let addr = client_addr(&request);
        let req = request.into_inner();
        info!("gRPC ChangeDir: session={}, dir={}", req.session_id, req.dir);

        let result = self
            .state
            .service
            .change_dir(&req.session_id, &req.token, &req.dir, &addr)
            .await;
        Ok(Response::new(status_reply(result)))
    }

    async fn get_session_info(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<SessionInfoReply>, Status> {
        let req = request.into_inner();
        let reply = match self.state.service.session_info(&req.session_id, &req.token).await {
            Ok(summary) => SessionInfoReply {
                session: Some(summary.into()),
                rejection: String::new(),
            },
            Err(r) => SessionInfoReply {
                session: None,
                rejection: r.reason().to_string(),
            },
        };
        Ok(Response::new(reply))
    }

    async fn list_clients(
        &self,
        request: Request<AdminRequest>,
    ) -> Result<Response<ClientList>, Status> {
        let req = request.into_inner();
        let session_ids = self
            .state
            .service
            .list_clients(&req.token)
            .await
            .map_err(admin_status)?;
        Ok(Response::new(ClientList { session_ids }))
    }

    async fn list_sessions(
        &self,
        request: Request<AdminRequest>,
    ) -> Result<Response<SessionList>, Status> {
        let req = request.into_inner();
        let sessions = self
            .state
            .service
            .list_sessions(&req.token)
            .await
            .map_err(admin_status)?;
        Ok(Response::new(SessionList {
            sessions: sessions.into_iter().map(Into::into).collect(),
        }))
    }

    async fn kill_session(
        &self,
        request: Request<SessionRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let req = request.into_inner();
        info!("gRPC KillSession: session={}", req.session_id);

        let result = self.state.service.kill_session(&req.session_id, &req.token).await;
        Ok(Response::new(status_reply(result)))
    }

    async fn add_to_whitelist(
        &self,
        request: Request<WhitelistRequest>,
    ) -> Result<Response<WhitelistReply>, Status> {
        let req = request.into_inner();
        info!("gRPC AddToWhitelist: {:?}", req.commands);

        let commands = self
            .state
            .service
            .add_to_whitelist(&req.token, &req.commands)
            .await
            .map_err(admin_status)?;
        Ok(Response::new(WhitelistReply { commands }))
    }
}

/// Copies one side of the interactive process's output onto the RPC stream.
async fn forward_output(
    mut reader: DuplexStream,
    is_stderr: bool,
    session_id: String,
    tx: mpsc::Sender<Result<ShellOutput, Status>>,
) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let msg = ShellOutput {
            session_id: session_id.clone(),
            output: buf[..n].to_vec(),
            is_stderr,
            ..Default::default()
        };
        if tx.send(Ok(msg)).await.is_err() {
            return;
        }
    }
}

/// Run the gRPC server on the given port with the provided state until
/// `shutdown` flips to true.
pub async fn run_server(
    port: u16,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting gRPC server on {}", addr);
    serve(listener, state, shutdown).await?;
    Ok(())
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tonic::transport::Error> {
    let service = ShellServiceImpl::new(state);

    tonic::transport::Server::builder()
        .add_service(ShellServiceServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("gRPC server stopping");
        })
        .await
}
