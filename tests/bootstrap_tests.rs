
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use guest_harness::{GuestBehavior, TestGuest, GUEST_PASSWORD, GUEST_USER};
use persistent_worker::bootstrap::{
    self, wait_for_ssh, BootstrapConfig, BootstrapError, ForwardTarget, Hook, SshDialer,
    SshSession, TcpDialer, REMOTE_AGENT_PATH,
};
use persistent_worker::upstream::TaskId;

/// Dialer that fails a fixed number of times before succeeding.
struct FlakyDialer {
    failures: u32,
    attempts: AtomicU32,
}

impl FlakyDialer {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshDialer for FlakyDialer {
    type Session = u32;

    async fn dial(&self) -> Result<u32, BootstrapError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.failures {
            Ok(attempt)
        } else {
            Err(BootstrapError::Timeout("guest".to_string()))
        }
    }
}

#[tokio::test]
async fn test_wait_for_ssh_retries_until_connected() {
    let dialer = FlakyDialer::new(2);
    let token = CancellationToken::new();

    let session = wait_for_ssh(&token, &dialer).await.unwrap();

    assert_eq!(session, 3);
    assert_eq!(dialer.attempts(), 3);
}

#[tokio::test]
async fn test_wait_for_ssh_stops_on_cancellation() {
    let dialer = FlakyDialer::new(u32::MAX);
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = wait_for_ssh(&token, &dialer).await;

    assert!(matches!(result, Err(BootstrapError::Cancelled)));
    assert!(dialer.attempts() >= 2, "should keep retrying until cancelled");
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_wait_for_ssh_already_cancelled() {
    let dialer = FlakyDialer::new(u32::MAX);
    let token = CancellationToken::new();
    token.cancel();

    let result = wait_for_ssh(&token, &dialer).await;
    assert!(matches!(result, Err(BootstrapError::Cancelled)));
}

#[tokio::test]
async fn test_tcp_dialer_reports_refused_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dialer = TcpDialer::new("127.0.0.1", port, "admin", "admin");
    let result = dialer.dial().await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_bootstrap_unreachable_guest_is_cancellable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = BootstrapConfig {
        host: "127.0.0.1".to_string(),
        port,
        user: "admin".to_string(),
        password: "admin".to_string(),
        agent_binary: "/bin/true".into(),
        endpoint: "https://grpc.example.com:443".to_string(),
        server_secret: "server".to_string(),
        client_secret: "client".to_string(),
        task_id: TaskId::from("42"),
        env: Vec::new(),
        sync_time: false,
        init_hooks: Vec::new(),
        termination_hooks: Vec::new(),
    };

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), bootstrap::run(&token, &config))
        .await
        .expect("bootstrap should return after cancellation");
    assert!(matches!(result, Err(BootstrapError::Cancelled)));
}

const AGENT_BYTES: &[u8] = b"#!/bin/sh\necho agent\n";

fn agent_binary() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(AGENT_BYTES).unwrap();
    file
}

fn guest_config(guest: &TestGuest, agent: &NamedTempFile) -> BootstrapConfig {
    BootstrapConfig {
        host: "127.0.0.1".to_string(),
        port: guest.port,
        user: GUEST_USER.to_string(),
        password: GUEST_PASSWORD.to_string(),
        agent_binary: agent.path().to_path_buf(),
        endpoint: "http://192.168.64.1:8080".to_string(),
        server_secret: "server".to_string(),
        client_secret: "client".to_string(),
        task_id: TaskId::from("42"),
        env: vec![("CIRRUS_VM_ID".to_string(), "vm-1".to_string())],
        sync_time: false,
        init_hooks: Vec::new(),
        termination_hooks: Vec::new(),
    }
}

fn command(cmd: &str) -> Hook {
    Hook::Command(cmd.to_string())
}

async fn run_bootstrap(
    token: &CancellationToken,
    config: &BootstrapConfig,
) -> Result<(), BootstrapError> {
    tokio::time::timeout(Duration::from_secs(10), bootstrap::run(token, config))
        .await
        .expect("bootstrap should finish")
}

#[tokio::test]
async fn test_bootstrap_runs_hooks_around_agent() {
    let guest = TestGuest::start(GuestBehavior {
        shell_status: Some(0),
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.init_hooks = vec![command("echo first"), command("echo second")];
    config.termination_hooks = vec![command("echo last")];

    let result = run_bootstrap(&CancellationToken::new(), &config).await;
    assert!(result.is_ok(), "unexpected result: {:?}", result);

    let commands = guest.guest.commands();
    assert_eq!(commands.len(), 4, "commands: {:?}", commands);
    assert_eq!(commands[0], "echo first");
    assert_eq!(commands[1], "echo second");
    assert!(commands[2].starts_with("chmod 755"));
    assert!(commands[2].contains(REMOTE_AGENT_PATH));
    assert_eq!(commands[3], "echo last");

    guest.guest.with_state(|s| {
        assert_eq!(s.files.get(REMOTE_AGENT_PATH).map(Vec::as_slice), Some(AGENT_BYTES));
        assert!(s.dirs.contains("/tmp/cirrus-ci"));
        assert_eq!(s.shells, 1);
        assert_eq!(s.forwards, 0);
        assert!(s.shell_input.starts_with("export CIRRUS_VM_ID='vm-1'\n"));
        assert!(s.shell_input.contains("-task-id '42'"));
        assert!(s.shell_input.contains("-api-endpoint 'http://192.168.64.1:8080'"));
        assert!(s.shell_input.ends_with("exit\n"));
    });
}

#[tokio::test]
async fn test_failing_init_hook_aborts_bootstrap() {
    let guest = TestGuest::start(GuestBehavior {
        exec_status: vec![("mount-cache".to_string(), 2)],
        shell_status: Some(0),
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.init_hooks = vec![command("mount-cache"), command("echo never")];
    config.termination_hooks = vec![command("echo cleanup")];

    let result = run_bootstrap(&CancellationToken::new(), &config).await;

    match result {
        Err(BootstrapError::Hook { hook, message }) => {
            assert_eq!(hook, "mount-cache");
            assert!(message.contains('2'), "message: {}", message);
        }
        other => panic!("expected hook failure, got {:?}", other),
    }
    assert_eq!(guest.guest.commands(), vec!["mount-cache".to_string()]);
    guest.guest.with_state(|s| {
        assert!(s.files.is_empty(), "agent must not be uploaded");
        assert_eq!(s.shells, 0);
    });
}

#[tokio::test]
async fn test_failing_termination_hook_is_tolerated() {
    let guest = TestGuest::start(GuestBehavior {
        exec_status: vec![("unmount".to_string(), 1)],
        shell_status: Some(0),
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.termination_hooks = vec![command("unmount"), command("echo after")];

    let result = run_bootstrap(&CancellationToken::new(), &config).await;

    assert!(result.is_ok(), "unexpected result: {:?}", result);
    let commands = guest.guest.commands();
    assert_eq!(commands[commands.len() - 2], "unmount");
    assert_eq!(commands[commands.len() - 1], "echo after");
}

#[tokio::test]
async fn test_agent_exit_status_is_reported() {
    let guest = TestGuest::start(GuestBehavior {
        shell_status: Some(3),
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.termination_hooks = vec![command("echo after")];

    let result = run_bootstrap(&CancellationToken::new(), &config).await;

    assert!(matches!(result, Err(BootstrapError::AgentExited(3))), "got {:?}", result);
    assert_eq!(guest.guest.commands().last().map(String::as_str), Some("echo after"));
}

#[tokio::test]
async fn test_rejected_password_retries_until_cancelled() {
    let guest = TestGuest::start(GuestBehavior::default()).await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.password = "wrong".to_string();

    let dialer = TcpDialer::new("127.0.0.1", guest.port, GUEST_USER, "wrong");
    assert!(matches!(
        dialer.dial().await,
        Err(BootstrapError::AuthenticationFailed { .. })
    ));

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
    });
    let result = run_bootstrap(&token, &config).await;
    assert!(matches!(result, Err(BootstrapError::Cancelled)));
}

#[tokio::test]
async fn test_cancellation_closes_running_agent() {
    let guest = TestGuest::start(GuestBehavior {
        shell_status: None,
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.termination_hooks = vec![command("echo after")];

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = run_bootstrap(&token, &config).await;

    assert!(matches!(result, Err(BootstrapError::Cancelled)), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));
    guest.guest.with_state(|s| {
        assert_eq!(s.shells, 1);
        assert!(!s.commands.iter().any(|c| c == "echo after"));
    });
}

#[tokio::test]
async fn test_cancellation_during_stalled_forward() {
    let guest = TestGuest::start(GuestBehavior {
        shell_status: Some(0),
        stall_forward: true,
        ..Default::default()
    })
    .await;
    let agent = agent_binary();
    let mut config = guest_config(&guest, &agent);
    config.endpoint = "http://127.0.0.1:8080".to_string();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = run_bootstrap(&token, &config).await;

    assert!(matches!(result, Err(BootstrapError::Cancelled)), "got {:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));
    guest.guest.with_state(|s| {
        assert_eq!(s.forwards, 1);
        assert_eq!(s.shells, 0);
    });
}

#[tokio::test]
async fn test_close_is_not_blocked_by_pending_forward() {
    let guest = TestGuest::start(GuestBehavior {
        stall_forward: true,
        ..Default::default()
    })
    .await;

    let session = SshSession::connect(
        "127.0.0.1",
        guest.port,
        GUEST_USER,
        GUEST_PASSWORD,
        Some(ForwardTarget::Tcp("127.0.0.1:8080".to_string())),
    )
    .await
    .unwrap();
    let session = Arc::new(session);
    let closer = session.closer();

    let forwarding = session.clone();
    let forward = tokio::spawn(async move { forwarding.forward_remote().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::timeout(Duration::from_secs(2), closer.close())
        .await
        .expect("close should not wait for the pending forward");

    let result = tokio::time::timeout(Duration::from_secs(2), forward)
        .await
        .expect("forward should return after close")
        .unwrap();
    assert!(matches!(result, Err(BootstrapError::SessionClosed)), "got {:?}", result);
    assert!(matches!(
        session.exec("true").await,
        Err(BootstrapError::SessionClosed)
    ));
}
