//! Server lifecycle against stand-in processes and an in-test listener
#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tutorial_regress::server::{with_server, ReadinessProbe, ServerConfig, ServerHandle};
use tutorial_regress::RegressError;

const FRESH_SERVER: &str = "echo 'Watching for file changes with StatReloader'; \
     echo '[18/Oct/2026 10:00:00] \"GET / HTTP/1.1\" 200 2'";

/// Answer every request with 200 until the test ends
async fn serve_ok() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn stand_in(dir: &Path, port: u16, script: &str) -> ServerConfig {
    ServerConfig {
        program: "sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: dir.to_path_buf(),
        envs: BTreeMap::new(),
        log_path: dir.join("runserver_log.txt"),
        port,
        probe: ReadinessProbe {
            max_attempts: 20,
            interval: Duration::from_millis(50),
            settle: Duration::from_millis(300),
            ..ReadinessProbe::default()
        },
        stop_grace: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn fresh_server_is_used_and_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    let config = stand_in(dir.path(), port, &format!("{}; exec sleep 30", FRESH_SERVER));

    let (status, report) = with_server(config, |base_url| async move {
        let resp = reqwest::get(format!("{}/", base_url)).await?;
        Ok::<u16, RegressError>(resp.status().as_u16())
    })
    .await
    .unwrap();

    assert_eq!(status, 200);
    assert!(report.terminated);
    assert!(!report.escalated);
    assert_eq!(report.strategy, "process-group");
}

#[tokio::test]
async fn stop_reaches_every_process_of_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    let config = stand_in(
        dir.path(),
        port,
        &format!("sleep 30 & sleep 30 & {}; wait", FRESH_SERVER),
    );

    let mut server = ServerHandle::spawn(config).await.unwrap();
    let report = server.stop();
    assert!(report.terminated);
    assert!(!report.escalated);
    assert!(!server.is_running());

    #[cfg(target_os = "linux")]
    {
        let members = tutorial_regress::process_tree::ProcTable::group_members(report.pid as i32).unwrap();
        assert!(members.iter().all(|e| !e.running), "{:?}", members);
    }
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    let config = stand_in(dir.path(), port, &format!("{}; exec sleep 30", FRESH_SERVER));

    let mut server = ServerHandle::spawn(config).await.unwrap();
    let first = server.stop();
    let second = server.stop();
    assert_eq!(first.pid, second.pid);
    assert_eq!(first.terminated, second.terminated);
}

#[tokio::test]
async fn answer_from_someone_else_is_a_stale_server() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    // Holds the port slot in name only; the listener answers instead
    let config = stand_in(dir.path(), port, "exec sleep 30");

    match ServerHandle::spawn(config).await {
        Err(RegressError::StaleServer(_)) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("stale server accepted"),
    }
}

#[tokio::test]
async fn port_in_use_exit_is_a_stale_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = stand_in(
        dir.path(),
        free_port(),
        "echo 'Error: That port is already in use.'; exit 1",
    );

    match ServerHandle::spawn(config).await {
        Err(RegressError::StaleServer(_)) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("server accepted"),
    }
}

#[tokio::test]
async fn early_exit_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = stand_in(dir.path(), free_port(), "echo 'ImportError: no module'; exit 1");

    match ServerHandle::spawn(config).await {
        Err(RegressError::ServerStartup(message)) => assert!(message.contains("runserver_log.txt")),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("server accepted"),
    }
}

#[tokio::test]
async fn silent_server_exhausts_readiness_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = stand_in(dir.path(), free_port(), "exec sleep 30");
    config.probe.max_attempts = 3;

    match ServerHandle::spawn(config).await {
        Err(RegressError::ServerHealthCheck(attempts)) => assert_eq!(attempts, 3),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("server accepted"),
    }
}

#[tokio::test]
async fn body_failure_still_stops_server() {
    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    let config = stand_in(dir.path(), port, &format!("{}; exec sleep 30", FRESH_SERVER));

    let result = with_server(config, |_| async {
        Err::<(), _>(RegressError::AssertionFailed("functional check failed".to_string()))
    })
    .await;
    assert!(matches!(result, Err(RegressError::AssertionFailed(_))));

    // The log was written by a process that is gone now
    let log = std::fs::read_to_string(dir.path().join("runserver_log.txt")).unwrap();
    assert!(log.contains("StatReloader"));
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_keeps_the_runtime_responsive() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let port = serve_ok().await;
    // SIGTERM is ignored by the shell and inherited by sleep
    let mut config = stand_in(dir.path(), port, &format!("trap '' TERM; {}; exec sleep 30", FRESH_SERVER));
    config.stop_grace = Duration::from_millis(800);

    let mut server = ServerHandle::spawn(config).await.unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let report = server.shutdown().await;
    ticker.abort();

    assert!(report.escalated);
    assert!(report.terminated);
    assert!(ticks.load(Ordering::SeqCst) >= 5, "runtime stalled during shutdown");
}

#[cfg(target_os = "linux")]
#[test]
fn descendant_terminator_stops_children_first() {
    use std::process::Command;
    use tutorial_regress::process_tree::{descendants, DescendantTerminator, ProcTable, ProcessTable, TreeTerminator};

    let mut child = Command::new("sh")
        .args(["-c", "sleep 30 & sleep 30 & wait"])
        .spawn()
        .unwrap();
    let root = child.id();

    // Wait for both sleeps to show up
    let mut found = Vec::new();
    for _ in 0..50 {
        found = descendants(&ProcTable.snapshot().unwrap(), root);
        if found.len() >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(found.len() >= 2, "children not found: {:?}", found);

    let terminator = DescendantTerminator::new(ProcTable);
    terminator.terminate_tree(root).unwrap();
    child.wait().unwrap();

    let mut alive = true;
    for _ in 0..100 {
        alive = terminator.tree_alive(root);
        if !alive {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!alive);
}
