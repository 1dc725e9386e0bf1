//! End-to-end tests against the gRPC service implementation.

#![cfg(unix)]

use futures_util::StreamExt;
use remote_shell::config::ServiceConfig;
use remote_shell::grpc_server::proto::shell_service_server::ShellService;
use remote_shell::grpc_server::proto::{
    AdminRequest, ChangeDirRequest, ExecuteRequest, OutputChunk, SessionRequest, SetEnvRequest,
    WhitelistRequest,
};
use remote_shell::grpc_server::ShellServiceImpl;
use remote_shell::service::ExecutionService;
use remote_shell::state::{AppState, SessionRegistry};
use std::time::Duration;
use tonic::Request;

fn server(config: ServiceConfig) -> (ShellServiceImpl, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(dir.path().to_path_buf());
    let state = AppState::new(ExecutionService::with_registry(config, registry));
    (ShellServiceImpl::new(state), dir)
}

fn exec(id: &str, command: &str) -> Request<ExecuteRequest> {
    Request::new(ExecuteRequest {
        session_id: id.into(),
        token: String::new(),
        command: command.into(),
    })
}

fn session(id: &str) -> Request<SessionRequest> {
    Request::new(SessionRequest {
        session_id: id.into(),
        token: String::new(),
    })
}

async fn collect(svc: &ShellServiceImpl, id: &str, command: &str) -> Vec<OutputChunk> {
    let stream = svc.execute_stream(exec(id, command)).await.unwrap().into_inner();
    stream.map(|chunk| chunk.unwrap()).collect().await
}

#[tokio::test]
async fn execute_auto_registers_and_reports_output() {
    let (svc, _dir) = server(ServiceConfig::default());

    let reply = svc.execute(exec("alpha", "echo hi")).await.unwrap().into_inner();
    assert!(reply.rejection.is_empty());
    assert_eq!(reply.output, "hi\n");
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.session_id, "alpha");
    assert!(!reply.timed_out);

    let clients = svc
        .list_clients(Request::new(AdminRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(clients.session_ids, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn environment_and_directory_carry_across_commands() {
    let (svc, dir) = server(ServiceConfig::default());
    std::fs::create_dir(dir.path().join("work")).unwrap();

    let set = svc
        .set_env(Request::new(SetEnvRequest {
            session_id: "s".into(),
            token: String::new(),
            key: "GREETING".into(),
            value: "hello".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(set.ok, "{}", set.message);

    let cd = svc
        .change_dir(Request::new(ChangeDirRequest {
            session_id: "s".into(),
            token: String::new(),
            dir: "work".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(cd.ok, "{}", cd.message);

    let reply = svc
        .execute(exec("s", "echo $GREETING"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.output, "hello\n");

    let pwd = svc.execute(exec("s", "pwd")).await.unwrap().into_inner();
    let expected = dir.path().join("work").canonicalize().unwrap();
    assert_eq!(pwd.output.trim_end(), expected.to_string_lossy());
}

#[tokio::test]
async fn change_dir_to_missing_path_is_not_found() {
    let (svc, _dir) = server(ServiceConfig::default());
    let reply = svc
        .change_dir(Request::new(ChangeDirRequest {
            session_id: "s".into(),
            token: String::new(),
            dir: "does-not-exist".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!reply.ok);
    assert_eq!(reply.rejection, "not found");
}

#[tokio::test]
async fn stream_delivers_lines_then_one_eof() {
    let (svc, _dir) = server(ServiceConfig::default());
    let chunks = collect(&svc, "s", "printf 'a\\nb\\n'").await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].data, b"a\n");
    assert_eq!(chunks[1].data, b"b\n");
    assert!(chunks[..2].iter().all(|c| !c.is_eof && !c.is_stderr));
    assert!(chunks[2].is_eof);
    assert_eq!(chunks[2].exit_code, 0);
}

#[tokio::test]
async fn stream_timeout_reports_on_stderr() {
    let (svc, _dir) = server(ServiceConfig {
        max_runtime: Duration::from_millis(300),
        ..ServiceConfig::default()
    });
    let chunks = collect(&svc, "s", "sleep 30").await;

    let eofs: Vec<_> = chunks.iter().filter(|c| c.is_eof).collect();
    assert_eq!(eofs.len(), 1);
    assert_eq!(eofs[0].exit_code, -1);
    assert!(chunks
        .iter()
        .any(|c| c.is_stderr && c.data.starts_with(b"command execution timeout")));
}

#[tokio::test]
async fn rejected_stream_is_a_single_terminal_chunk() {
    let (svc, _dir) = server(ServiceConfig::default());
    let chunks = collect(&svc, "s", "ls | wc -l").await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_eof);
    assert_eq!(chunks[0].exit_code, -1);
    assert_eq!(chunks[0].rejection, "chaining/piping is blocked");
}

#[tokio::test]
async fn killed_session_stays_banned() {
    let (svc, _dir) = server(ServiceConfig::default());
    svc.register(session("rogue")).await.unwrap();

    let killed = svc.kill_session(session("rogue")).await.unwrap().into_inner();
    assert!(killed.ok);

    let reply = svc.execute(exec("rogue", "echo hi")).await.unwrap().into_inner();
    assert_eq!(reply.rejection, "banned");
    assert_eq!(reply.exit_code, -1);

    let again = svc.register(session("rogue")).await.unwrap().into_inner();
    assert!(!again.ok);
    assert_eq!(again.rejection, "banned");

    let hb = svc.heartbeat(session("rogue")).await.unwrap().into_inner();
    assert_eq!(hb.rejection, "banned");
}

#[tokio::test]
async fn whitelist_added_at_runtime_restricts_commands() {
    let (svc, _dir) = server(ServiceConfig::default());
    let reply = svc
        .add_to_whitelist(Request::new(WhitelistRequest {
            token: String::new(),
            commands: vec!["echo".into()],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.commands, vec!["echo".to_string()]);

    let ok = svc.execute(exec("s", "echo fine")).await.unwrap().into_inner();
    assert!(ok.rejection.is_empty());

    let denied = svc.execute(exec("s", "uname")).await.unwrap().into_inner();
    assert_eq!(denied.rejection, "command not allowed");
}

#[tokio::test]
async fn admin_rpcs_require_token() {
    let (svc, _dir) = server(ServiceConfig {
        auth_token: Some("secret".into()),
        ..ServiceConfig::default()
    });

    let status = svc
        .list_sessions(Request::new(AdminRequest {
            token: "wrong".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unauthenticated);

    let reply = svc.execute(exec("s", "echo hi")).await.unwrap().into_inner();
    assert_eq!(reply.rejection, "unauthorized");

    let sessions = svc
        .list_sessions(Request::new(AdminRequest {
            token: "secret".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(sessions.sessions.is_empty());
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let (svc, _dir) = server(ServiceConfig {
        rate_limit: 2,
        ..ServiceConfig::default()
    });
    for _ in 0..2 {
        let reply = svc.execute(exec("s", "true")).await.unwrap().into_inner();
        assert!(reply.rejection.is_empty());
    }
    let reply = svc.execute(exec("s", "true")).await.unwrap().into_inner();
    assert_eq!(reply.rejection, "rate limit exceeded");
}

#[tokio::test]
async fn session_info_reports_summary() {
    let (svc, _dir) = server(ServiceConfig::default());
    svc.register(session("info")).await.unwrap();

    let reply = svc.get_session_info(session("info")).await.unwrap().into_inner();
    let summary = reply.session.unwrap();
    assert_eq!(summary.session_id, "info");
    assert_eq!(summary.client_address, "unknown");
    assert_eq!(summary.env_count, 0);
    assert!(summary.is_active);

    let missing = svc.get_session_info(session("nobody")).await.unwrap().into_inner();
    assert!(missing.session.is_none());
    assert_eq!(missing.rejection, "not found");
}
